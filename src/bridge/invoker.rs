//! Stub-side invoker
//!
//! Publishes invocation requests over the bridge and waits for the local
//! bridge to answer. Also tracks the control traffic coming back: function
//! metadata from `Init`, cache resets from `Reboot`, and `Ping` echoes.

use super::correlator::{Correlator, Delivery};
use super::{publish_message, BridgeChannels};
use crate::config::BridgeConfig;
use crate::error::{DevTunnelError, ProtocolError};
use crate::helper::random_id;
use crate::protocol::{
    decode_frame, BridgeMessage, ChunkLimits, FunctionMetadata, InvocationRequest,
    InvocationType, MessageKind,
};
use crate::transport::{InboundMessage, PubSub};
use bytes::Bytes;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

/// Sends invocations and awaits their results
pub struct Invoker {
    pubsub: Arc<dyn PubSub>,
    correlator: Arc<Correlator>,
    channels: BridgeChannels,
    limits: ChunkLimits,
    timeout: Duration,
    sweep_interval: Duration,
    environment: BTreeMap<String, String>,
    metadata: Mutex<HashMap<String, FunctionMetadata>>,
    last_ping: Mutex<Option<Instant>>,
}

impl Invoker {
    /// Create an invoker publishing on `channels`
    pub fn new(pubsub: Arc<dyn PubSub>, channels: BridgeChannels, config: &BridgeConfig) -> Self {
        Invoker {
            pubsub,
            correlator: Arc::new(Correlator::new()),
            channels,
            limits: config.limits(),
            timeout: config.request_timeout(),
            sweep_interval: config.sweep_interval(),
            environment: BTreeMap::new(),
            metadata: Mutex::new(HashMap::new()),
            last_ping: Mutex::new(None),
        }
    }

    /// Remote environment forwarded with every request
    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Subscribe to the response channel
    pub async fn start(&self) -> Result<(), DevTunnelError> {
        self.pubsub.subscribe(&self.channels.response).await?;
        info!("Invoker listening on {}", self.channels.response);
        Ok(())
    }

    /// Correlator shared with the inbound loop
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Metadata announced for a function, if any
    pub fn function(&self, function_id: &str) -> Option<FunctionMetadata> {
        self.metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(function_id)
            .cloned()
    }

    /// When the last `Ping` echo arrived
    pub fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Probe the local bridge
    pub async fn ping(&self) -> Result<(), DevTunnelError> {
        let msg = BridgeMessage::ping(random_id());
        publish_message(self.pubsub.as_ref(), &self.channels.request, msg, &self.limits).await?;
        Ok(())
    }

    /// Invoke a function with a fresh request id
    pub async fn invoke(
        &self,
        function_id: &str,
        event: Value,
        invocation_type: InvocationType,
    ) -> Result<BridgeMessage, DevTunnelError> {
        self.invoke_with_id(&random_id(), function_id, event, invocation_type)
            .await
    }

    /// Invoke a function under a caller-chosen request id
    pub async fn invoke_with_id(
        &self,
        request_id: &str,
        function_id: &str,
        event: Value,
        invocation_type: InvocationType,
    ) -> Result<BridgeMessage, DevTunnelError> {
        let handler_budget = self
            .function(function_id)
            .map(|meta| Duration::from_millis(meta.timeout_ms).min(self.timeout))
            .unwrap_or(self.timeout);
        let deadline_ms = SystemTime::now()
            .checked_add(handler_budget)
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(u64::MAX);

        let request = InvocationRequest {
            function_id: function_id.to_string(),
            aws_request_id: request_id.to_string(),
            deadline_ms,
            invocation_type,
            invoked_function_arn: None,
            environment: self.environment.clone(),
            client_context: None,
            identity: None,
            event,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ProtocolError::Malformed(format!("Failed to encode request: {}", e)))?;
        self.limits.check(payload.len(), invocation_type)?;

        let waiter = self.correlator.register(request_id, self.timeout)?;
        let msg = BridgeMessage::new(MessageKind::Next, request_id, Bytes::from(payload));
        match publish_message(self.pubsub.as_ref(), &self.channels.request, msg, &self.limits).await {
            Ok(frames) => debug!("Sent request {} in {} frame(s)", request_id, frames),
            Err(e) => {
                self.correlator.cancel(request_id);
                return Err(e.into());
            }
        }

        Ok(waiter.wait().await?)
    }

    /// Process one inbound frame from the response channel
    pub fn handle_inbound(&self, inbound: InboundMessage) {
        let msg = match decode_frame(&inbound.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed frame on {}: {}", inbound.channel, e);
                return;
            }
        };

        match msg.kind {
            MessageKind::Init => match serde_json::from_slice::<FunctionMetadata>(&msg.payload) {
                Ok(meta) => {
                    debug!("Cached metadata for {}", meta.function_id);
                    self.metadata
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(meta.function_id.clone(), meta);
                }
                Err(e) => warn!("Ignoring malformed Init: {}", e),
            },
            MessageKind::Reboot => {
                info!("Local bridge restarted, clearing cached metadata");
                self.metadata.lock().unwrap_or_else(|e| e.into_inner()).clear();
            }
            MessageKind::Ping => {
                *self.last_ping.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            }
            MessageKind::Response | MessageKind::Error => {
                let request_id = msg.request_id.clone();
                match self.correlator.deliver(msg) {
                    Ok(Delivery::Unknown) => debug!("Result for unknown request {}", request_id),
                    Ok(delivery) => trace!("Result frame for {}: {:?}", request_id, delivery),
                    Err(e) => warn!("Rejected result frame for {}: {}", request_id, e),
                }
            }
            MessageKind::Next => trace!("Ignoring Next on the response channel"),
        }
    }

    /// Consume inbound frames and drive request timeouts until shutdown
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown_rx: broadcast::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_inbound(msg),
                    None => {
                        info!("Inbound stream closed");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    let expired = self.correlator.sweep(Instant::now());
                    if expired > 0 {
                        debug!("{} request(s) timed out", expired);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Invoker shutting down");
                    break;
                }
            }
        }
        self.correlator.shutdown();
    }
}
