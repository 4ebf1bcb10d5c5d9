//! Developer-side bridge
//!
//! Listens on the stage's request channel, reassembles `Next` requests, runs
//! each one on its own task through the [`ExecutionHost`], and publishes the
//! chunked result on the response channel.

use super::{publish_message, BridgeChannels};
use crate::config::BridgeConfig;
use crate::error::{DevTunnelError, ExecutionError, ProtocolError, TransportError};
use crate::helper::random_id;
use crate::host::{error_message, ExecutionHost};
use crate::protocol::{decode_frame, BridgeMessage, ChunkLimits, MessageKind, Reassembler};
use crate::transport::{InboundMessage, PubSub};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Runs remote invocations locally
pub struct DevBridge {
    pubsub: Arc<dyn PubSub>,
    host: Arc<ExecutionHost>,
    channels: BridgeChannels,
    limits: ChunkLimits,
    sweep_interval: Duration,
    partial_ttl: Duration,
    max_partial: usize,
    executing: Arc<Mutex<HashSet<String>>>,
}

impl DevBridge {
    /// Create a bridge serving `host` on `channels`
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        host: ExecutionHost,
        channels: BridgeChannels,
        config: &BridgeConfig,
    ) -> Self {
        DevBridge {
            pubsub,
            host: Arc::new(host),
            channels,
            limits: config.limits(),
            sweep_interval: config.sweep_interval(),
            partial_ttl: config.request_timeout(),
            max_partial: config.max_partial,
            executing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Channels this bridge serves
    pub fn channels(&self) -> &BridgeChannels {
        &self.channels
    }

    /// Subscribe to the request channel and announce the functions
    pub async fn start(&self) -> Result<(), DevTunnelError> {
        self.pubsub.subscribe(&self.channels.request).await?;
        info!("Dev bridge listening on {}", self.channels.request);
        self.announce().await
    }

    /// Publish `Reboot` followed by one `Init` per function
    pub async fn announce(&self) -> Result<(), DevTunnelError> {
        self.publish(BridgeMessage::reboot(random_id())).await?;
        for meta in self.host.metadata() {
            let body = serde_json::to_vec(&meta)
                .map_err(|e| ProtocolError::Malformed(format!("Failed to encode metadata: {}", e)))?;
            let id = meta.function_id.clone();
            self.publish(BridgeMessage::new(MessageKind::Init, id, body)).await?;
        }
        debug!("Announced {} function(s)", self.host.metadata().len());
        Ok(())
    }

    async fn publish(&self, msg: BridgeMessage) -> Result<(), TransportError> {
        publish_message(self.pubsub.as_ref(), &self.channels.response, msg, &self.limits).await?;
        Ok(())
    }

    /// Serve requests until shutdown or until the inbound stream ends
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown_rx: broadcast::Receiver<bool>,
    ) {
        let mut reassembler = Reassembler::new(self.max_partial);
        let mut workers = JoinSet::new();
        let mut sweep = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_inbound(msg, &mut reassembler, &mut workers),
                    None => {
                        info!("Inbound stream closed");
                        break;
                    }
                },
                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = result {
                        error!("Invocation task failed: {}", e);
                    }
                }
                _ = sweep.tick() => {
                    for id in reassembler.expire(self.partial_ttl) {
                        warn!("Abandoned partial request {}", id);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Dev bridge shutting down");
                    break;
                }
            }
        }

        if !workers.is_empty() {
            info!("Cancelling {} running invocation(s)", workers.len());
        }
        workers.shutdown().await;
    }

    fn handle_inbound(
        &self,
        inbound: InboundMessage,
        reassembler: &mut Reassembler,
        workers: &mut JoinSet<()>,
    ) {
        let msg = match decode_frame(&inbound.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed frame on {}: {}", inbound.channel, e);
                return;
            }
        };

        match msg.kind {
            MessageKind::Ping => self.echo_ping(msg.request_id, workers),
            MessageKind::Next => match reassembler.accept(msg) {
                Ok(Some(request)) => self.dispatch(request, workers),
                Ok(None) => {}
                Err(e) => warn!("Dropping request chunk: {}", e),
            },
            other => trace!("Ignoring {} on the request channel", other),
        }
    }

    /// Answer a ping off the read loop; the publish may wait out a reconnect
    fn echo_ping(&self, id: String, workers: &mut JoinSet<()>) {
        trace!("Ping {}", id);
        let pubsub = Arc::clone(&self.pubsub);
        let channel = self.channels.response.clone();
        let limits = self.limits;
        workers.spawn(async move {
            let pong = BridgeMessage::ping(id);
            if let Err(e) = publish_message(pubsub.as_ref(), &channel, pong, &limits).await {
                warn!("Failed to answer ping: {}", e);
            }
        });
    }

    fn dispatch(&self, request: BridgeMessage, workers: &mut JoinSet<()>) {
        let request_id = request.request_id.clone();
        {
            let mut executing = self.executing.lock().unwrap_or_else(|e| e.into_inner());
            if !executing.insert(request_id.clone()) {
                warn!("Request {} is already executing, ignoring duplicate", request_id);
                return;
            }
        }
        info!("Invoking request {} ({} bytes)", request_id, request.payload.len());

        let pubsub = Arc::clone(&self.pubsub);
        let host = Arc::clone(&self.host);
        let executing = Arc::clone(&self.executing);
        let channel = self.channels.response.clone();
        let limits = self.limits;

        workers.spawn(async move {
            let reply = host.invoke(&request_id, request.payload).await;
            let result = publish_message(pubsub.as_ref(), &channel, reply, &limits).await;
            if let Err(e) = result {
                warn!("Failed to publish result for {}: {}", request_id, e);
                if let TransportError::Protocol(ProtocolError::PayloadTooLarge { size, max }) = e {
                    let fallback = error_message(&request_id, &ExecutionError::PayloadTooLarge { size, max });
                    if let Err(e) = publish_message(pubsub.as_ref(), &channel, fallback, &limits).await {
                        warn!("Failed to publish error for {}: {}", request_id, e);
                    }
                }
            }
            executing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
        });
    }

    /// Number of invocations currently running
    pub fn executing(&self) -> usize {
        self.executing.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{FnHandler, InvocationContext};
    use crate::protocol::{encode_frame, FunctionMetadata};
    use crate::transport::{MemoryHub, MemoryPubSub};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use tokio::sync::Semaphore;

    /// Holds back ping replies until released, like a transport waiting to
    /// reconnect
    struct StalledPings {
        inner: MemoryPubSub,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl PubSub for StalledPings {
        async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
            self.inner.subscribe(channel).await
        }

        async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
            let is_ping = decode_frame(&payload).map(|m| m.kind == MessageKind::Ping).unwrap_or(false);
            if is_ping {
                let _permit = self.gate.acquire().await.map_err(|_| TransportError::Closed)?;
            }
            self.inner.publish(channel, payload).await
        }

        fn max_frame_bytes(&self) -> usize {
            self.inner.max_frame_bytes()
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.inner.close().await
        }
    }

    fn echo_host() -> ExecutionHost {
        let mut host = ExecutionHost::new(BridgeConfig::default().limits());
        host.register(
            FunctionMetadata {
                function_id: "echo".to_string(),
                function_name: "shop-dev-echo".to_string(),
                handler: "echo.handler".to_string(),
                memory_mb: 128,
                timeout_ms: 3000,
                environment: BTreeMap::new(),
            },
            Arc::new(FnHandler::new(|_: &InvocationContext, event: &Value| Ok(event.clone()))),
        );
        host
    }

    fn next_frame(request_id: &str, event: Value) -> Bytes {
        let deadline = std::time::SystemTime::now() + Duration::from_secs(60);
        let request = json!({
            "functionId": "echo",
            "awsRequestId": request_id,
            "deadlineMs": deadline.duration_since(std::time::UNIX_EPOCH).unwrap().as_millis() as u64,
            "event": event,
        });
        let next = BridgeMessage::new(
            MessageKind::Next,
            request_id,
            Bytes::from(serde_json::to_vec(&request).unwrap()),
        );
        encode_frame(&next).unwrap()
    }

    fn bridge(hub: &MemoryHub) -> (DevBridge, mpsc::Receiver<InboundMessage>) {
        let (client, rx) = hub.client();
        let channels = BridgeChannels::new("devtunnel", "shop/dev");
        let bridge = DevBridge::new(Arc::new(client), echo_host(), channels, &BridgeConfig::default());
        (bridge, rx)
    }

    #[tokio::test]
    async fn test_announce_reboot_then_init() {
        let hub = MemoryHub::new(240 * 1024);
        let (bridge, _rx) = bridge(&hub);
        let (observer, mut observed) = hub.client();
        observer.subscribe(&bridge.channels().response).await.unwrap();

        bridge.start().await.unwrap();

        let first = decode_frame(&observed.recv().await.unwrap().payload).unwrap();
        assert_eq!(first.kind, MessageKind::Reboot);
        let second = decode_frame(&observed.recv().await.unwrap().payload).unwrap();
        assert_eq!(second.kind, MessageKind::Init);
        let meta: FunctionMetadata = serde_json::from_slice(&second.payload).unwrap();
        assert_eq!(meta.function_name, "shop-dev-echo");
    }

    #[tokio::test]
    async fn test_ping_echo_and_malformed_frame() {
        let hub = MemoryHub::new(240 * 1024);
        let (bridge, rx) = bridge(&hub);
        bridge.start().await.unwrap();

        let (stub, mut responses) = hub.client();
        stub.subscribe(&bridge.channels().response).await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let channels = bridge.channels().clone();
        let server = tokio::spawn(async move { bridge.run(rx, shutdown_rx).await });

        stub.publish(&channels.request, Bytes::from_static(b"\xff\x00garbage"))
            .await
            .unwrap();
        let ping = encode_frame(&BridgeMessage::ping("p1")).unwrap();
        stub.publish(&channels.request, ping).await.unwrap();

        let echo = decode_frame(&responses.recv().await.unwrap().payload).unwrap();
        assert_eq!(echo.kind, MessageKind::Ping);
        assert_eq!(echo.request_id, "p1");

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_next_runs_handler() {
        let hub = MemoryHub::new(240 * 1024);
        let (bridge, rx) = bridge(&hub);
        bridge.start().await.unwrap();

        let (stub, mut responses) = hub.client();
        stub.subscribe(&bridge.channels().response).await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let channels = bridge.channels().clone();
        let server = tokio::spawn(async move { bridge.run(rx, shutdown_rx).await });

        stub.publish(&channels.request, next_frame("r1", json!("ping")))
            .await
            .unwrap();

        let reply = decode_frame(&responses.recv().await.unwrap().payload).unwrap();
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.request_id, "r1");
        assert_eq!(&reply.payload[..], b"\"ping\"");

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_ping_does_not_block_requests() {
        let hub = MemoryHub::new(240 * 1024);
        let (client, rx) = hub.client();
        let gate = Arc::new(Semaphore::new(0));
        let pubsub = StalledPings {
            inner: client,
            gate: Arc::clone(&gate),
        };
        let channels = BridgeChannels::new("devtunnel", "shop/dev");
        let bridge = DevBridge::new(Arc::new(pubsub), echo_host(), channels.clone(), &BridgeConfig::default());
        bridge.start().await.unwrap();

        let (stub, mut responses) = hub.client();
        stub.subscribe(&channels.response).await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(async move { bridge.run(rx, shutdown_rx).await });

        let ping = encode_frame(&BridgeMessage::ping("p1")).unwrap();
        stub.publish(&channels.request, ping).await.unwrap();
        stub.publish(&channels.request, next_frame("r2", json!("after ping")))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), responses.recv())
            .await
            .unwrap()
            .unwrap();
        let reply = decode_frame(&reply.payload).unwrap();
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.request_id, "r2");

        gate.add_permits(1);
        let echo = decode_frame(&responses.recv().await.unwrap().payload).unwrap();
        assert_eq!(echo.kind, MessageKind::Ping);
        assert_eq!(echo.request_id, "p1");

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_ping() {
        let hub = MemoryHub::new(240 * 1024);
        let (client, rx) = hub.client();
        let pubsub = StalledPings {
            inner: client,
            gate: Arc::new(Semaphore::new(0)),
        };
        let channels = BridgeChannels::new("devtunnel", "shop/dev");
        let bridge = DevBridge::new(Arc::new(pubsub), echo_host(), channels.clone(), &BridgeConfig::default());
        bridge.start().await.unwrap();

        let (stub, _responses) = hub.client();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(async move { bridge.run(rx, shutdown_rx).await });

        let ping = encode_frame(&BridgeMessage::ping("p1")).unwrap();
        stub.publish(&channels.request, ping).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }
}
