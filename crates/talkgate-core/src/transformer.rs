//! Speech-to-text and text-to-speech transformer contracts.
//!
//! Provider implementations live outside this workspace. The engine builds them through a
//! [`TransformerFactory`] and talks to them only through these traits.

use crate::assistant::TransformerSpec;
use crate::audio::AudioConfig;
use crate::error::TalkResult;
use crate::store::Credential;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A transcript produced by a speech-to-text provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
    pub language: Option<String>,
    pub completed: bool,
}

/// Synthesized audio produced by a text-to-speech provider.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub context_id: String,
    pub data: Vec<u8>,
    pub completed: bool,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;

    /// Start the provider session. Transcripts are delivered on `transcripts`.
    async fn initialize(&self, transcripts: mpsc::UnboundedSender<Transcript>) -> TalkResult<()>;

    /// Feed one audio frame. Returns [`crate::TalkError::EndOfStream`] once the provider
    /// stream has ended; callers treat that as non-fatal.
    async fn transform(&self, frame: &[u8]) -> TalkResult<()>;

    async fn close(&self) -> TalkResult<()>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, audio: mpsc::UnboundedSender<SynthesizedAudio>) -> TalkResult<()>;

    /// Synthesize `text`. With `is_complete` the call resolves only after every queued
    /// sentence of `context_id` has been delivered.
    async fn transform(&self, context_id: &str, text: &str, is_complete: bool) -> TalkResult<()>;

    async fn close(&self) -> TalkResult<()>;
}

/// Builds provider transformers. Returning `Ok(None)` means the provider has no
/// transformer for this channel, which the pipelines tolerate.
#[async_trait]
pub trait TransformerFactory: Send + Sync {
    async fn speech_to_text(
        &self,
        spec: &TransformerSpec,
        credential: &Credential,
        audio: &AudioConfig,
    ) -> TalkResult<Option<Arc<dyn SpeechToText>>>;

    async fn text_to_speech(
        &self,
        spec: &TransformerSpec,
        credential: &Credential,
        audio: &AudioConfig,
    ) -> TalkResult<Option<Arc<dyn TextToSpeech>>>;
}

/// Factory for deployments without any speech provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransformers;

#[async_trait]
impl TransformerFactory for NoTransformers {
    async fn speech_to_text(
        &self,
        _spec: &TransformerSpec,
        _credential: &Credential,
        _audio: &AudioConfig,
    ) -> TalkResult<Option<Arc<dyn SpeechToText>>> {
        Ok(None)
    }

    async fn text_to_speech(
        &self,
        _spec: &TransformerSpec,
        _credential: &Credential,
        _audio: &AudioConfig,
    ) -> TalkResult<Option<Arc<dyn TextToSpeech>>> {
        Ok(None)
    }
}
