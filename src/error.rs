//! Error taxonomy for the bridge core.
//!
//! Errors are split along the propagation boundaries described by the server
//! design: per-frame errors are answered on the wire and never disconnect,
//! per-connection errors close a single socket, and per-process errors abort
//! startup or the accept loop. Every variant maps to a stable machine-readable
//! `kind` string that crosses the wire in error replies; messages are for
//! humans and never carry backtraces.

use thiserror::Error;

/// Errors produced by the bridge core.
///
/// The `kind` of each variant is what clients see in error replies; the
/// display string is the human-readable message. Fatal variants (`Config`,
/// `Bind`) are only ever surfaced at startup and map to process exit codes.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Listener could not be bound (typically a port conflict). Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Disallowed origin or missing/invalid token. Closes the connection with 1008.
    #[error("policy violation: {0}")]
    Policy(String),

    /// Malformed, oversized or structurally invalid frame. Answered, never disconnects.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// The external dispatcher reported a failure.
    #[error("command failed: {0}")]
    Command(String),

    /// A pending operation was cancelled by disconnect or shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// A pending operation outlived its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A connection mailbox rejected writes repeatedly. Closes the connection with 1011.
    #[error("connection overloaded: {0}")]
    Overload(String),

    /// Unexpected failure inside a handler.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable machine-readable label used as the `kind` field of error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config",
            BridgeError::Bind { .. } => "bind",
            BridgeError::Policy(_) => "policy",
            BridgeError::BadFrame(_) => "bad_frame",
            BridgeError::Command(_) => "command",
            BridgeError::Cancelled => "cancelled",
            BridgeError::Timeout => "timeout",
            BridgeError::Overload(_) => "overload",
            BridgeError::Internal(_) => "internal",
        }
    }

    /// Whether the error is fatal for the whole process rather than one
    /// request or connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Config(_) | BridgeError::Bind { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_wire_labels() {
        assert_eq!(BridgeError::BadFrame("x".into()).kind(), "bad_frame");
        assert_eq!(BridgeError::Cancelled.kind(), "cancelled");
        assert_eq!(BridgeError::Timeout.kind(), "timeout");
        assert_eq!(BridgeError::Policy("origin".into()).kind(), "policy");
    }

    #[test]
    fn only_startup_errors_are_fatal() {
        assert!(BridgeError::Config("missing root".into()).is_fatal());
        assert!(
            BridgeError::Bind {
                addr: "127.0.0.1:0".into(),
                source: std::io::Error::other("in use"),
            }
            .is_fatal()
        );
        assert!(!BridgeError::Command("boom".into()).is_fatal());
    }
}
