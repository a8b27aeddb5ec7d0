//! Client error types.

use flowhub_protocol::ErrorCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] flowhub_protocol::ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("client closed")]
    Closed,

    #[error("request timeout")]
    Timeout,

    #[error("rejected by hub: {code} - {message}")]
    Rejected { code: i32, message: String },

    #[error("unexpected reply type: expected {expected}, got {actual}")]
    UnexpectedType { expected: u16, actual: u16 },

    #[error("message id already in flight")]
    DuplicateMsgId,

    #[error("reply payload missing or expired")]
    MissingPayload,
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::DuplicateMsgId => true,
            ClientError::Rejected { code, .. } => {
                ErrorCode::from_code(*code).is_some_and(|c| c.is_retryable())
            }
            _ => false,
        }
    }

    /// Known error code carried by a rejection, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rejected { code, .. } => ErrorCode::from_code(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::Closed.is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());

        let internal = ClientError::Rejected {
            code: 500,
            message: "boom".into(),
        };
        assert!(internal.is_retryable());

        let denied = ClientError::Rejected {
            code: 401,
            message: "invalid credentials".into(),
        };
        assert!(!denied.is_retryable());
        assert_eq!(denied.error_code(), Some(ErrorCode::Unauthorized));
    }

    #[test]
    fn test_display() {
        let err = ClientError::UnexpectedType {
            expected: 101,
            actual: 0,
        };
        assert_eq!(err.to_string(), "unexpected reply type: expected 101, got 0");
    }
}
