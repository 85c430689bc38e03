//! Error types for the utterance analyzers

use talkgate_core::TalkError;
use thiserror::Error;

/// Result type alias for analyzer operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while analyzing user speech
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Analyzer not initialized: {0}")]
    NotInitialized(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<VoiceError> for TalkError {
    fn from(err: VoiceError) -> Self {
        TalkError::Transformer(err.to_string())
    }
}
