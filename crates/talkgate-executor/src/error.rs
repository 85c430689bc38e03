//! Error types for executor backends

use talkgate_core::TalkError;
use thiserror::Error;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("TLS configuration: {0}")]
    Tls(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("unknown model provider: {0}")]
    UnknownProvider(String),

    #[error("executor not initialized")]
    NotInitialized,

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Talk(#[from] TalkError),

    #[error("gRPC status: {0}")]
    Status(#[from] tonic::Status),

    #[error("gRPC transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("WebSocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<ExecutorError> for TalkError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Talk(inner) => inner,
            other => TalkError::Executor(other.to_string()),
        }
    }
}
