//! Error types for the proxy core.
//!
//! Every error carries the operation and the key involved, so a single log
//! line is enough to diagnose a failure. Recovery happens only at well-known
//! boundaries (the shared-backend pick probe loop, TTL expiry); everything
//! else is wrapped and surfaced.

use thiserror::Error;

/// Main error type for the proxy core.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed endpoint, missing registration field, unparseable port or
    /// duration. Never retried.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// Shared state backend unreachable or a transient write failed.
    #[error("state backend unavailable: {0}")]
    BackendUnavailable(String),

    /// `pick` found zero registered descriptors.
    #[error("no backend available for {stream_url}")]
    NoBackendAvailable { stream_url: String },

    /// Expected HLS/WebRTC index entry is absent, likely TTL expiry.
    #[error("no {kind} session for {key}")]
    SessionNotFound { kind: &'static str, key: String },

    /// A stored session record could not be rehydrated.
    #[error("session for {key} cannot be deserialized: {reason}")]
    SessionNotDeserializable { key: String, reason: String },

    /// Malformed SDP, SRT stream-id, or wire input. Surfaced as 4xx.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Ambient cancellation. Propagated, never retried.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O failure talking to a peer or a backend.
    #[error("io error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Whether an I/O error is an expected end-of-connection signal from a peer.
///
/// These are logged at debug and never escalated.
pub fn is_peer_closed(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_closed_classification() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(is_peer_closed(&eof));

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(!is_peer_closed(&refused));
    }

    #[test]
    fn errors_carry_context() {
        let err = ProxyError::SessionNotFound {
            kind: "HLS",
            key: "sp-abc".into(),
        };
        assert_eq!(err.to_string(), "no HLS session for sp-abc");
    }
}
