//! Local execution host
//!
//! Runs invocations received over the bridge against locally configured
//! handlers and turns every outcome, including panics and timeouts, into a
//! `Response` or `Error` message.

mod context;
mod handler;

pub use context::{filter_environment, InvocationContext};
pub use handler::{CommandHandler, FnHandler, Handler, HandlerFailure};

use crate::config::Config;
use crate::error::ExecutionError;
use crate::protocol::{
    BridgeMessage, ChunkLimits, ErrorPayload, FunctionMetadata, InvocationRequest, InvocationType,
    MessageKind,
};
use bytes::Bytes;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct RegisteredFunction {
    metadata: FunctionMetadata,
    handler: Arc<dyn Handler>,
}

/// Runs handlers for the functions it knows about
pub struct ExecutionHost {
    functions: BTreeMap<String, RegisteredFunction>,
    limits: ChunkLimits,
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl ExecutionHost {
    /// Create a host with no functions
    pub fn new(limits: ChunkLimits) -> Self {
        ExecutionHost {
            functions: BTreeMap::new(),
            limits,
        }
    }

    /// Create a host running the configured commands for a stage
    pub fn from_config(config: &Config, stage: &str) -> Self {
        let mut host = ExecutionHost::new(config.bridge.limits());
        for (id, function) in &config.functions {
            let metadata = function.metadata(id, &config.app, stage);
            host.register(metadata, Arc::new(CommandHandler::from_config(function)));
        }
        host
    }

    /// Add or replace a function
    pub fn register(&mut self, metadata: FunctionMetadata, handler: Arc<dyn Handler>) {
        debug!("Registered function {} ({})", metadata.function_id, metadata.function_name);
        self.functions.insert(
            metadata.function_id.clone(),
            RegisteredFunction { metadata, handler },
        );
    }

    /// Metadata of every function, ordered by id
    pub fn metadata(&self) -> Vec<FunctionMetadata> {
        self.functions.values().map(|f| f.metadata.clone()).collect()
    }

    /// Build the context for a request
    pub fn context(&self, request: &InvocationRequest) -> Result<InvocationContext, ExecutionError> {
        let function = self
            .functions
            .get(&request.function_id)
            .ok_or_else(|| ExecutionError::UnknownFunction(request.function_id.clone()))?;
        Ok(InvocationContext::from_request(&function.metadata, request))
    }

    /// Run the handler for `ctx` on the event JSON in `payload`
    pub async fn execute(&self, ctx: InvocationContext, payload: Bytes) -> Result<Bytes, ExecutionError> {
        let function = self
            .functions
            .get(&ctx.function_id)
            .ok_or_else(|| ExecutionError::UnknownFunction(ctx.function_id.clone()))?;
        let event: Value = serde_json::from_slice(&payload)
            .map_err(|e| ExecutionError::InvalidEvent(format!("Event is not JSON: {}", e)))?;

        if ctx.invocation_type == InvocationType::DryRun {
            debug!("Dry run for {} skips the handler", ctx.request_id);
            return Ok(Bytes::new());
        }

        let remaining = ctx.remaining_time();
        let handler = Arc::clone(&function.handler);
        let invocation_type = ctx.invocation_type;
        let mut task = tokio::spawn(async move { handler.handle(ctx, event).await });

        let value = match tokio::time::timeout(remaining, &mut task).await {
            Err(_) => {
                task.abort();
                return Err(ExecutionError::Timeout(remaining));
            }
            Ok(Err(join)) if join.is_panic() => {
                return Err(ExecutionError::Handler {
                    error_type: "Runtime.HandlerPanic".to_string(),
                    message: panic_message(join.into_panic()),
                    trace: Vec::new(),
                });
            }
            Ok(Err(join)) => {
                return Err(ExecutionError::Handler {
                    error_type: "Runtime.Cancelled".to_string(),
                    message: join.to_string(),
                    trace: Vec::new(),
                });
            }
            Ok(Ok(Err(failure))) => {
                return Err(ExecutionError::Handler {
                    error_type: failure.error_type,
                    message: failure.message,
                    trace: failure.trace,
                });
            }
            Ok(Ok(Ok(value))) => value,
        };

        let body = serde_json::to_vec(&value).map_err(|e| ExecutionError::Handler {
            error_type: "Runtime.InvalidResponse".to_string(),
            message: e.to_string(),
            trace: Vec::new(),
        })?;
        let max = self.limits.effective_limit(invocation_type);
        if body.len() > max {
            return Err(ExecutionError::PayloadTooLarge {
                size: body.len(),
                max,
            });
        }
        Ok(Bytes::from(body))
    }

    /// Run a `Next` payload and produce the reply message
    ///
    /// Never fails: every error becomes an `Error` message.
    pub async fn invoke(&self, request_id: &str, payload: Bytes) -> BridgeMessage {
        match self.run(payload).await {
            Ok(body) => {
                info!("Request {} succeeded ({} bytes)", request_id, body.len());
                BridgeMessage::new(MessageKind::Response, request_id, body)
            }
            Err(e) => {
                warn!("Request {} failed: {}", request_id, e);
                error_message(request_id, &e)
            }
        }
    }

    async fn run(&self, payload: Bytes) -> Result<Bytes, ExecutionError> {
        let request: InvocationRequest = serde_json::from_slice(&payload)
            .map_err(|e| ExecutionError::InvalidEvent(e.to_string()))?;
        let ctx = self.context(&request)?;
        let event = serde_json::to_vec(&request.event)
            .map_err(|e| ExecutionError::InvalidEvent(e.to_string()))?;
        self.execute(ctx, Bytes::from(event)).await
    }
}

/// Build the `Error` message for a failed invocation
pub fn error_message(request_id: &str, err: &ExecutionError) -> BridgeMessage {
    let error_message = match err {
        ExecutionError::Handler { message, .. } => message.clone(),
        other => other.to_string(),
    };
    let payload = ErrorPayload {
        error_type: err.error_type().to_string(),
        error_message,
        trace: err.trace().to_vec(),
    };
    let body = serde_json::to_vec(&payload).unwrap_or_default();
    BridgeMessage::new(MessageKind::Error, request_id, body)
}
