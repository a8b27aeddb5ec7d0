//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors raised while decoding headers or payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("short buffer: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },

    #[error("varint overflow")]
    VarintOverflow,

    #[error("length {0} does not fit a length prefix")]
    LengthOverflow(usize),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedType { expected: u16, actual: u16 },
}

/// Stable numeric codes carried in OK/Error replies.
///
/// These values are part of the wire contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorCode {
    /// Returns the numeric wire value.
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::Internal => 500,
        }
    }

    /// Maps a numeric wire value back to a known code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            400 => Some(ErrorCode::BadRequest),
            401 => Some(ErrorCode::Unauthorized),
            403 => Some(ErrorCode::Forbidden),
            404 => Some(ErrorCode::NotFound),
            409 => Some(ErrorCode::Conflict),
            500 => Some(ErrorCode::Internal),
            _ => None,
        }
    }

    /// Returns whether a request rejected with this code may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Internal)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::BadRequest => write!(f, "BAD_REQUEST"),
            ErrorCode::Unauthorized => write!(f, "UNAUTHORIZED"),
            ErrorCode::Forbidden => write!(f, "FORBIDDEN"),
            ErrorCode::NotFound => write!(f, "NOT_FOUND"),
            ErrorCode::Conflict => write!(f, "CONFLICT"),
            ErrorCode::Internal => write!(f, "INTERNAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::BadRequest.code(), 400);
        assert_eq!(ErrorCode::Unauthorized.code(), 401);
        assert_eq!(ErrorCode::Forbidden.code(), 403);
        assert_eq!(ErrorCode::Internal.code(), 500);
    }

    #[test]
    fn test_error_code_from_code() {
        for code in [
            ErrorCode::BadRequest,
            ErrorCode::Unauthorized,
            ErrorCode::Forbidden,
            ErrorCode::NotFound,
            ErrorCode::Conflict,
            ErrorCode::Internal,
        ] {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(418), None);
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::Internal.is_retryable());
        assert!(!ErrorCode::BadRequest.is_retryable());
        assert!(!ErrorCode::Unauthorized.is_retryable());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::BadRequest), "BAD_REQUEST");
        assert_eq!(format!("{}", ErrorCode::Unauthorized), "UNAUTHORIZED");
        assert_eq!(format!("{}", ErrorCode::Forbidden), "FORBIDDEN");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::ShortBuffer {
            needed: 38,
            available: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("38"));
        assert!(msg.contains("10"));

        assert!(ProtocolError::VarintOverflow.to_string().contains("varint"));
        assert!(ProtocolError::InvalidUtf8.to_string().contains("UTF-8"));

        let err = ProtocolError::UnexpectedType {
            expected: 101,
            actual: 1,
        };
        assert!(err.to_string().contains("101"));
    }
}
