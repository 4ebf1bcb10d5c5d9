//! Error types for devtunnel
//!
//! Each subsystem has its own error enum so callers can decide how to react
//! (retry, drop, report) without string matching. [`DevTunnelError`] wraps
//! them all for the application edges.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Exit code used by the CLI when an operation needs elevated privilege
pub const EXIT_PRIVILEGE_REQUIRED: i32 = 77;

/// Top-level error type
#[derive(Error, Debug)]
pub enum DevTunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pub/sub transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Bridge protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Handler execution error
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Request timed out
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// Network tunnel error
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Errors raised by the pub/sub transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not establish the connection
    #[error("Transport connect failed: {0}")]
    ConnectFailed(String),

    /// Signing failed or the server rejected the credentials
    #[error("Transport authentication failed: {0}")]
    AuthFailed(String),

    /// The message violates the wire contract (never retried)
    #[error("Transport protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server rejected an operation
    #[error("Transport operation rejected: {0}")]
    Rejected(String),

    /// TLS setup failed
    #[error("Transport TLS error: {0}")]
    Tls(String),

    /// The client was closed
    #[error("Transport closed")]
    Closed,

    /// IO error on the underlying socket
    #[error("Transport IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether a reconnect with backoff may cure this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::ConnectFailed(_) | TransportError::Io(_))
    }
}

/// Malformed or inconsistent bridge traffic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame could not be decoded or has an invalid shape
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// A request id is already live
    #[error("Duplicate request id: {0}")]
    DuplicateRequest(String),

    /// Reassembled payload does not match its digest
    #[error("Checksum mismatch for request {0}")]
    ChecksumMismatch(String),

    /// Chunk disagrees with earlier chunks of the same message
    #[error("Chunk shape mismatch for request {request_id}: {reason}")]
    ShapeMismatch {
        /// Request the chunk belongs to
        request_id: String,
        /// What differed
        reason: String,
    },

    /// Single frame exceeds the transport frame limit
    #[error("Frame too large: {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Frame size in bytes
        size: usize,
        /// Maximum frame size in bytes
        max: usize,
    },

    /// Logical payload exceeds the effective payload limit
    #[error("Payload too large: {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Payload size in bytes
        size: usize,
        /// Effective payload limit in bytes
        max: usize,
    },
}

/// Failure while running a handler locally
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The handler raised an error or panicked
    #[error("{error_type}: {message}")]
    Handler {
        /// Error class name
        error_type: String,
        /// Error message
        message: String,
        /// Stack trace lines, if any
        trace: Vec<String>,
    },

    /// The handler did not finish before the invocation deadline
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    /// The serialized result does not fit through the relay
    #[error("Response payload too large: {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Result size in bytes
        size: usize,
        /// Effective payload limit in bytes
        max: usize,
    },

    /// No handler is configured for the function
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// The invocation request could not be parsed
    #[error("Invalid invocation request: {0}")]
    InvalidEvent(String),
}

impl ExecutionError {
    /// Error class reported to the remote caller
    pub fn error_type(&self) -> &str {
        match self {
            ExecutionError::Handler { error_type, .. } => error_type,
            ExecutionError::Timeout(_) => "Sandbox.Timedout",
            ExecutionError::PayloadTooLarge { .. } => "PayloadTooLarge",
            ExecutionError::UnknownFunction(_) => "ResourceNotFound",
            ExecutionError::InvalidEvent(_) => "InvalidRequestContent",
        }
    }

    /// Stack trace reported to the remote caller
    pub fn trace(&self) -> &[String] {
        match self {
            ExecutionError::Handler { trace, .. } => trace,
            _ => &[],
        }
    }
}

/// A request received no response before its deadline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Request {request_id} timed out after {after:?}")]
pub struct TimeoutError {
    /// Request that timed out
    pub request_id: String,
    /// Time waited
    pub after: Duration,
}

/// Errors fatal to a tunnel lifecycle operation
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The operation needs root / administrator rights
    #[error("Elevated privilege required: {0}")]
    PrivilegeDenied(String),

    /// The TUN device is held by another process
    #[error("Tunnel device busy: {0}")]
    DeviceBusy(String),

    /// The bastion rejected the key
    #[error("SSH authentication failed: {0}")]
    SshAuth(String),

    /// The bastion could not be reached
    #[error("SSH connection failed: {0}")]
    SshConnect(String),

    /// A tunnel session is already started
    #[error("Tunnel is already running; stop it before starting again")]
    AlreadyRunning,

    /// The lifecycle state does not allow the operation
    #[error("Cannot {operation} tunnel while {state}")]
    InvalidState {
        /// Requested operation
        operation: &'static str,
        /// Current state
        state: String,
    },

    /// A system command failed
    #[error("Command `{program}` failed with code {code}: {stderr}")]
    Command {
        /// Program and arguments
        program: String,
        /// Exit code (-1 when killed by a signal)
        code: i32,
        /// Captured standard error
        stderr: String,
    },

    /// Opening or using the TUN device failed
    #[error("Tunnel device error: {0}")]
    Device(String),

    /// The host operating system has no network driver
    #[error("Unsupported operating system: {0}")]
    Unsupported(String),
}

impl TunnelError {
    /// Process exit code the CLI reports for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TunnelError::PrivilegeDenied(_) => EXIT_PRIVILEGE_REQUIRED,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::AuthFailed("401 Unauthorized".to_string());
        assert_eq!(
            format!("{}", err),
            "Transport authentication failed: 401 Unauthorized"
        );

        let err: TransportError = ProtocolError::FrameTooLarge { size: 300, max: 200 }.into();
        assert_eq!(
            format!("{}", err),
            "Transport protocol error: Frame too large: 300 bytes exceeds limit of 200 bytes"
        );

        assert_eq!(format!("{}", TransportError::Closed), "Transport closed");
    }

    #[test]
    fn test_transport_error_retryable() {
        assert!(TransportError::ConnectFailed("refused".to_string()).is_retryable());
        assert!(TransportError::Io(io::Error::new(io::ErrorKind::Other, "reset")).is_retryable());
        assert!(!TransportError::AuthFailed("denied".to_string()).is_retryable());
        assert!(!TransportError::Protocol(ProtocolError::FrameTooLarge { size: 2, max: 1 })
            .is_retryable());
        assert!(!TransportError::Closed.is_retryable());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::DuplicateRequest("r1".to_string());
        assert_eq!(format!("{}", err), "Duplicate request id: r1");

        let err = ProtocolError::ShapeMismatch {
            request_id: "r2".to_string(),
            reason: "total_chunks 3 != 4".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Chunk shape mismatch for request r2: total_chunks 3 != 4"
        );

        let err = ProtocolError::ChecksumMismatch("r3".to_string());
        assert_eq!(format!("{}", err), "Checksum mismatch for request r3");
    }

    #[test]
    fn test_execution_error_type() {
        let err = ExecutionError::Handler {
            error_type: "TypeError".to_string(),
            message: "x is undefined".to_string(),
            trace: vec!["at handler (index.js:3)".to_string()],
        };
        assert_eq!(err.error_type(), "TypeError");
        assert_eq!(err.trace().len(), 1);
        assert_eq!(format!("{}", err), "TypeError: x is undefined");

        let err = ExecutionError::Timeout(Duration::from_secs(3));
        assert_eq!(err.error_type(), "Sandbox.Timedout");
        assert!(err.trace().is_empty());

        let err = ExecutionError::PayloadTooLarge { size: 10, max: 5 };
        assert_eq!(err.error_type(), "PayloadTooLarge");
    }

    #[test]
    fn test_timeout_error_display() {
        let err = TimeoutError {
            request_id: "abc".to_string(),
            after: Duration::from_secs(2),
        };
        assert_eq!(format!("{}", err), "Request abc timed out after 2s");
    }

    #[test]
    fn test_tunnel_error_exit_code() {
        assert_eq!(
            TunnelError::PrivilegeDenied("run as root".to_string()).exit_code(),
            EXIT_PRIVILEGE_REQUIRED
        );
        assert_eq!(TunnelError::AlreadyRunning.exit_code(), 1);
        assert_eq!(TunnelError::DeviceBusy("devtun0".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_tunnel_error_display() {
        let err = TunnelError::InvalidState {
            operation: "start",
            state: "Uninstalled".to_string(),
        };
        assert_eq!(format!("{}", err), "Cannot start tunnel while Uninstalled");

        let err = TunnelError::Command {
            program: "ip route add 10.0.0.0/22 dev devtun0".to_string(),
            code: 2,
            stderr: "RTNETLINK answers: File exists".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Command `ip route add 10.0.0.0/22 dev devtun0` failed with code 2: RTNETLINK answers: File exists"
        );
    }

    #[test]
    fn test_devtunnel_error_from() {
        let err: DevTunnelError = TunnelError::AlreadyRunning.into();
        assert!(matches!(err, DevTunnelError::Tunnel(_)));

        let err: DevTunnelError = ProtocolError::Malformed("short".to_string()).into();
        assert!(matches!(err, DevTunnelError::Protocol(_)));
        assert_eq!(format!("{}", err), "Malformed frame: short");

        let io_err = io::Error::new(io::ErrorKind::Other, "io error");
        let err: DevTunnelError = io_err.into();
        assert!(matches!(err, DevTunnelError::Io(_)));
    }
}
