//! Per-invocation context
//!
//! Combines the function metadata announced at startup with the request
//! received in a `Next` frame, and synthesizes the environment a handler
//! would see when running remotely.

use crate::helper::random_id;
use crate::protocol::{FunctionMetadata, InvocationRequest, InvocationType};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Variables that only make sense on the remote runtime
const REMOTE_ONLY_VARS: &[&str] = &[
    "_HANDLER",
    "_X_AMZN_TRACE_ID",
    "AWS_EXECUTION_ENV",
    "LAMBDA_TASK_ROOT",
    "LAMBDA_RUNTIME_DIR",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

/// Drop remote-only variables from an environment map
pub fn filter_environment(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| !is_remote_only(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn is_remote_only(key: &str) -> bool {
    key.starts_with("AWS_LAMBDA_") || REMOTE_ONLY_VARS.contains(&key)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything a handler learns about its invocation
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationContext {
    /// Remote request id
    pub request_id: String,
    /// Function id within the app
    pub function_id: String,
    /// Deployed function name
    pub function_name: String,
    /// Function version
    pub function_version: String,
    /// Declared memory in MB
    pub memory_limit_mb: u32,
    /// ARN the function was invoked through
    pub invoked_function_arn: String,
    /// Log group name
    pub log_group_name: String,
    /// Log stream name
    pub log_stream_name: String,
    /// Invocation type
    pub invocation_type: InvocationType,
    /// Handler entry point
    pub handler: String,
    /// Deadline as milliseconds since the Unix epoch
    pub deadline_ms: u64,
    /// Filtered environment (remote environment overlaid with declared one)
    pub environment: BTreeMap<String, String>,
}

impl InvocationContext {
    /// Build the context for one request
    pub fn from_request(meta: &FunctionMetadata, request: &InvocationRequest) -> Self {
        let function_name = meta.function_name.clone();
        let invoked_function_arn = request.invoked_function_arn.clone().unwrap_or_else(|| {
            format!(
                "arn:aws:lambda:local:000000000000:function:{}",
                function_name
            )
        });

        let mut environment = filter_environment(&request.environment);
        environment.extend(filter_environment(&meta.environment));

        InvocationContext {
            request_id: request.aws_request_id.clone(),
            function_id: meta.function_id.clone(),
            log_group_name: format!("/aws/lambda/{}", function_name),
            log_stream_name: format!("devtunnel/[$LATEST]{}", random_id()),
            function_name,
            function_version: "$LATEST".to_string(),
            memory_limit_mb: meta.memory_mb,
            invoked_function_arn,
            invocation_type: request.invocation_type,
            handler: meta.handler.clone(),
            deadline_ms: request.deadline_ms,
            environment,
        }
    }

    /// Time left until the deadline
    pub fn remaining_time(&self) -> Duration {
        Duration::from_millis(self.deadline_ms.saturating_sub(now_ms()))
    }

    /// Environment handed to the handler process
    pub fn lambda_env(&self) -> BTreeMap<String, String> {
        let mut env = self.environment.clone();
        let synthesized = [
            ("AWS_LAMBDA_FUNCTION_NAME", self.function_name.clone()),
            ("AWS_LAMBDA_FUNCTION_VERSION", self.function_version.clone()),
            ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", self.memory_limit_mb.to_string()),
            ("AWS_LAMBDA_LOG_GROUP_NAME", self.log_group_name.clone()),
            ("AWS_LAMBDA_LOG_STREAM_NAME", self.log_stream_name.clone()),
            ("DEVTUNNEL_REQUEST_ID", self.request_id.clone()),
            ("DEVTUNNEL_FUNCTION_ARN", self.invoked_function_arn.clone()),
            ("DEVTUNNEL_DEADLINE_MS", self.deadline_ms.to_string()),
            ("DEVTUNNEL_HANDLER", self.handler.clone()),
        ];
        for (key, value) in synthesized {
            env.insert(key.to_string(), value);
        }
        env
    }
}
