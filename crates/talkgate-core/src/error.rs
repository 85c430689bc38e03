//! Error types for the talk session engine

use thiserror::Error;

/// Result type alias for talk operations
pub type TalkResult<T> = Result<T, TalkError>;

/// Errors that can occur while running a talk session.
///
/// Variants follow the failure taxonomy of the engine: authentication and validation
/// failures reject a request before any session state exists, backend and transport
/// failures are fatal only for the executor, and persistence failures are logged by the
/// caller and never block the live conversation.
#[derive(Error, Debug)]
pub enum TalkError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("session closed")]
    SessionClosed,

    #[error("illegal session state: {0}")]
    InvalidState(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("transformer error: {0}")]
    Transformer(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("end of stream")]
    EndOfStream,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("webhook error: {0}")]
    Webhook(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TalkError {
    /// Whether the error is an expected end of a stream rather than a failure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, TalkError::EndOfStream)
    }
}
