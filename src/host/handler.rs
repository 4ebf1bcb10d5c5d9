//! Handlers run by the execution host
//!
//! A [`Handler`] turns an event into a result. [`FnHandler`] runs a plain
//! closure on the blocking pool; [`CommandHandler`] delegates to a configured
//! program speaking JSON over stdin/stdout.

use super::context::InvocationContext;
use crate::config::FunctionConfig;
use crate::protocol::ErrorPayload;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// An error raised by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Error class name
    pub error_type: String,
    /// Error message
    pub message: String,
    /// Stack trace lines
    pub trace: Vec<String>,
}

impl HandlerFailure {
    /// Create a failure without a trace
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerFailure {
            error_type: error_type.into(),
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Attach stack trace lines
    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }
}

impl From<ErrorPayload> for HandlerFailure {
    fn from(payload: ErrorPayload) -> Self {
        HandlerFailure {
            error_type: payload.error_type,
            message: payload.error_message,
            trace: payload.trace,
        }
    }
}

/// Runs one function
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one event
    async fn handle(&self, ctx: InvocationContext, event: Value) -> Result<Value, HandlerFailure>;
}

/// Handler backed by a synchronous closure
///
/// The closure runs on the blocking pool; a panic inside it is re-raised on
/// the calling task.
pub struct FnHandler<F>(Arc<F>);

impl<F> FnHandler<F>
where
    F: Fn(&InvocationContext, &Value) -> Result<Value, HandlerFailure> + Send + Sync + 'static,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        FnHandler(Arc::new(f))
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&InvocationContext, &Value) -> Result<Value, HandlerFailure> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: InvocationContext, event: Value) -> Result<Value, HandlerFailure> {
        let f = Arc::clone(&self.0);
        match tokio::task::spawn_blocking(move || (*f)(&ctx, &event)).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Err(join) => Err(HandlerFailure::new("Runtime.Cancelled", join.to_string())),
        }
    }
}

/// Runs a program per invocation
///
/// The event is written to stdin as JSON and the result read from stdout.
/// A non-zero exit is a failure; if stdout then holds an
/// `{"errorType", "errorMessage"}` object it is reported as is. The child is
/// killed when the invocation deadline passes or the call is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    environment: BTreeMap<String, String>,
}

impl CommandHandler {
    /// Create a handler running `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandHandler {
            program: program.into(),
            args,
            cwd: None,
            environment: BTreeMap::new(),
        }
    }

    /// Create a handler from function configuration
    pub fn from_config(config: &FunctionConfig) -> Self {
        CommandHandler {
            program: config.command.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
            environment: BTreeMap::new(),
        }
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Add extra environment variables
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl Handler for CommandHandler {
    async fn handle(&self, ctx: InvocationContext, event: Value) -> Result<Value, HandlerFailure> {
        let input = serde_json::to_vec(&event)
            .map_err(|e| HandlerFailure::new("Runtime.InvalidEvent", e.to_string()))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(ctx.lambda_env())
            .envs(&self.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            HandlerFailure::new(
                "Runtime.StartError",
                format!("Failed to start {}: {}", self.program, e),
            )
        })?;
        debug!("Started {} (pid {:?}) for {}", self.program, child.id(), ctx.request_id);

        let stdin = child.stdin.take();
        let program = self.program.as_str();
        let write = async move {
            let Some(mut stdin) = stdin else { return };
            if let Err(e) = stdin.write_all(&input).await {
                debug!("{} did not read its event: {}", program, e);
            }
        };
        let run = async { tokio::join!(write, child.wait_with_output()).1 };

        // Dropping the child on timeout kills it
        let output = match tokio::time::timeout(ctx.remaining_time(), run).await {
            Err(_) => {
                warn!("Killing {} at the deadline of {}", self.program, ctx.request_id);
                return Err(HandlerFailure::new(
                    "Sandbox.Timedout",
                    format!("{} killed at the invocation deadline", self.program),
                ));
            }
            Ok(Err(e)) => return Err(HandlerFailure::new("Runtime.ExitError", e.to_string())),
            Ok(Ok(output)) => output,
        };

        let log = String::from_utf8_lossy(&output.stderr);
        for line in log.lines() {
            info!(target: "devtunnel::handler", "[{}] {}", ctx.function_name, line);
        }

        if !output.status.success() {
            if let Ok(payload) = serde_json::from_slice::<ErrorPayload>(&output.stdout) {
                return Err(payload.into());
            }
            let tail: Vec<String> = log.lines().rev().take(20).map(str::to_string).collect();
            return Err(HandlerFailure::new(
                "Runtime.ExitError",
                format!("{} exited with {}", self.program, output.status),
            )
            .with_trace(tail.into_iter().rev().collect()));
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            HandlerFailure::new(
                "Runtime.InvalidResponse",
                format!("Handler output is not JSON: {}", e),
            )
        })
    }
}
