use shared::protocol::DecodeError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("websocket connection timed out after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },
    #[error("websocket connection failed: {0}")]
    Connection(String),
    #[error("no bearer token available for the current session")]
    AuthMissing,
    #[error("failed to send frame: {0}")]
    SendFailure(String),
    #[error("invalid inbound frame: {0}")]
    Parse(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Lifecycle errors are retried by the connection itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Connection(_) | Self::AuthMissing
        )
    }
}

impl From<DecodeError> for TransportError {
    fn from(err: DecodeError) -> Self {
        Self::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use shared::protocol::InboundEvent;

    use super::*;

    #[test]
    fn decode_failures_become_parse_errors() {
        let err = InboundEvent::decode("{not json").expect_err("malformed");
        assert!(matches!(TransportError::from(err), TransportError::Parse(_)));
    }

    #[test]
    fn only_lifecycle_errors_are_retried() {
        assert!(TransportError::ConnectionTimeout { timeout_ms: 10_000 }.is_retryable());
        assert!(TransportError::Connection("refused".into()).is_retryable());
        assert!(TransportError::AuthMissing.is_retryable());
        assert!(!TransportError::SendFailure("closed".into()).is_retryable());
        assert!(!TransportError::Parse("bad".into()).is_retryable());
        assert!(!TransportError::InvalidEndpoint("ftp://x".into()).is_retryable());
    }
}
