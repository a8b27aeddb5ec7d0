//! Server error types.

use flowhub_protocol::ErrorCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] flowhub_protocol::ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("read deadline exceeded")]
    ReadTimeout,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("parent rejected handshake: {code} - {message}")]
    ParentRejected { code: i32, message: String },

    #[error("unexpected reply type {0}")]
    UnexpectedReply(u16),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Converts to the code carried in an error reply.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Auth(e) => e.error_code(),
            ServerError::ParentRejected { code, .. } => {
                ErrorCode::from_code(*code).unwrap_or(ErrorCode::Internal)
            }
            _ => ErrorCode::Internal,
        }
    }

    /// Returns whether the relay should reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ServerError::Config(_) | ServerError::ShuttingDown)
    }
}

/// Rejections produced while verifying a handshake.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("time window exceeded")]
    BadTimeWindow,

    #[error("replay detected")]
    Replay,

    #[error("bad request")]
    BadRequest,

    #[error("device not approved")]
    NotApproved,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("signing key rejected")]
    InvalidKey,

    #[error("directory error: {0}")]
    Directory(String),
}

impl AuthError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AuthError::InvalidSignature | AuthError::InvalidCredentials => ErrorCode::Unauthorized,
            AuthError::BadTimeWindow | AuthError::Replay | AuthError::BadRequest => {
                ErrorCode::BadRequest
            }
            AuthError::NotApproved => ErrorCode::Forbidden,
            AuthError::InvalidKey | AuthError::Directory(_) => ErrorCode::Internal,
        }
    }
}
