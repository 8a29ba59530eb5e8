//! Error types for the session and realtime connection layer.

use thiserror::Error;

/// Errors that can occur inside the session core.
///
/// Most of these never reach application code: the bootstrap coordinator and
/// the connection manager absorb them and log them. They surface directly from
/// the pluggable seams ([`Storage`](crate::storage::Storage),
/// [`IdentityFetcher`](crate::identity::IdentityFetcher),
/// [`Connector`](crate::transport::Connector)) and from
/// [`ConnectionManager::send`](crate::connection::ConnectionManager::send).
#[derive(Debug, Error)]
pub enum SessionError {
    /// The persistence backend could not read or write a key.
    #[error("storage error: {0}")]
    Storage(String),

    /// Failed to serialize or deserialize persisted state or a frame.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The identity request failed for a reason other than rejected credentials.
    #[error("identity fetch failed: {0}")]
    IdentityFetch(String),

    /// A connect attempt on the realtime channel failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A connect attempt did not complete within the configured timeout.
    #[error("connect attempt timed out")]
    ConnectTimeout,

    /// The remote side refused the bearer credential.
    #[error("credentials rejected: {0}")]
    AuthRejected(String),

    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Attempted an operation that requires a live channel.
    #[error("realtime channel is not connected")]
    NotConnected,

    /// The HTTP client failed before a response was received.
    #[cfg(feature = "identity-http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SessionError {
    /// Returns `true` if the credential itself was refused.
    ///
    /// Retrying with the same token cannot succeed, so the connection manager
    /// gives up immediately on these.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, SessionError::AuthRejected(_))
    }

    /// Returns `true` if another connect attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectFailed(_)
                | SessionError::ConnectTimeout
                | SessionError::TransportSend(_)
                | SessionError::TransportReceive(_)
                | SessionError::TransportClosed
                | SessionError::Io(_)
        )
    }
}

/// A specialized [`Result`] type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn auth_rejected_is_not_retryable() {
        let err = SessionError::AuthRejected("401".into());
        assert!(err.is_auth_rejected());
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        assert!(SessionError::ConnectTimeout.is_retryable());
        assert!(!SessionError::ConnectTimeout.is_auth_rejected());
    }

    #[test]
    fn display_includes_detail() {
        let err = SessionError::ConnectFailed("connection refused".into());
        assert_eq!(err.to_string(), "connect failed: connection refused");
    }
}
