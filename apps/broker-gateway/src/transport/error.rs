//! Transport error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors from the low-level transport adapter.
///
/// `AuthRejected` is non-retryable and must propagate immediately; the
/// remaining variants are retryable per the caller's policy. The
/// adapter itself never retries.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// TCP connection refused or unreachable.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// TLS handshake or certificate failure.
    #[error("TLS failure: {0}")]
    TlsFailure(String),

    /// The caller-supplied timeout elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Broker rejected the credentials. Non-retryable.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The streaming connection closed.
    #[error("stream closed: {0}")]
    StreamClosed(String),

    /// Malformed frame or response body.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether a retry (with backoff) could plausibly succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionRefused(_)
            | Self::TlsFailure(_)
            | Self::Timeout(_)
            | Self::StreamClosed(_) => true,
            Self::AuthRejected(_) | Self::Protocol(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_rejection_is_not_retryable() {
        assert!(!TransportError::AuthRejected("bad token".to_string()).is_retryable());
    }

    #[test]
    fn network_failures_are_retryable() {
        assert!(TransportError::ConnectionRefused("refused".to_string()).is_retryable());
        assert!(TransportError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(TransportError::StreamClosed("eof".to_string()).is_retryable());
    }
}
