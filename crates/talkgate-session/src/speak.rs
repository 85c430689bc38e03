//! Speak pipeline: assistant text → sentences → synthesizer chain → text-to-speech →
//! transport audio.

use crate::engine::Session;
use crate::recorder::Recorder;
use std::sync::{Arc, PoisonError, RwLock};
use talkgate_core::tokenizer::BOUNDARIES_OPTION;
use talkgate_core::{
    Outbound, Sentence, SentenceTokenizer, Stage, Streamer, SynthesizedAudio, SynthesizerChain,
    TalkError, TalkResult, TextToSpeech,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
pub(crate) struct Speaker {
    tokenizer: RwLock<Option<Arc<SentenceTokenizer>>>,
    synthesizers: RwLock<Option<Arc<SynthesizerChain>>>,
    tts: RwLock<Option<Arc<dyn TextToSpeech>>>,
}

impl Speaker {
    fn tokenize(&self, context_id: &str, text: &str, completed: bool) -> Vec<Sentence> {
        let tokenizer = self
            .tokenizer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tokenizer {
            Some(tokenizer) => tokenizer.tokenize(context_id, text, completed),
            None if completed && !text.trim().is_empty() => vec![Sentence {
                context_id: context_id.to_string(),
                text: text.trim().to_string(),
            }],
            None => Vec::new(),
        }
    }

    fn synthesize(&self, sentence: &str) -> String {
        match self
            .synthesizers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(chain) => chain.run(sentence),
            None => sentence.to_string(),
        }
    }

    fn tts(&self) -> Option<Arc<dyn TextToSpeech>> {
        self.tts.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Throw away text buffered for an interrupted turn.
    pub(crate) fn discard(&self) {
        let tokenizer = self
            .tokenizer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tokenizer) = tokenizer {
            let dropped = tokenizer.flush();
            if !dropped.is_empty() {
                debug!(sentences = dropped.len(), "discarded unspoken text");
            }
        }
    }
}

impl Session {
    /// Build the text path (tokenizer, synthesizers) and the audio path (TTS) side by
    /// side. Whatever comes up is kept; the first failure is returned for logging.
    pub(crate) async fn connect_speaker(self: &Arc<Self>) -> TalkResult<()> {
        let assistant = self.assistant()?;
        let options = assistant.options.merged(&self.state.options());

        let text_path = async {
            let tokenizer = if options.get(BOUNDARIES_OPTION).is_some() {
                SentenceTokenizer::from_options(&options)
            } else {
                SentenceTokenizer::new(&self.deps.config.speaker.default_boundaries)
            };
            let synthesizers = SynthesizerChain::from_options(&options);
            (tokenizer, synthesizers)
        };

        let audio_path = async {
            let Some(spec) = assistant.speaker.clone() else {
                debug!("assistant has no speaker configured");
                return Ok(None);
            };
            let Some(audio) = self.streamer.config() else {
                debug!("text-only channel, speech synthesis skipped");
                return Ok(None);
            };
            let credential = self
                .deps
                .credentials
                .get_credential(spec.credential_id)
                .await
                .map_err(|e| {
                    TalkError::Credential(format!("speaker credential {}: {e}", spec.credential_id))
                })?;
            let Some(tts) = self
                .deps
                .transformers
                .text_to_speech(&spec, &credential, &audio)
                .await?
            else {
                info!(provider = %spec.provider, "no text-to-speech transformer for this channel");
                return Ok(None);
            };
            let (tx, rx) = mpsc::unbounded_channel();
            tts.initialize(tx).await?;
            tokio::spawn(forward_audio(
                Arc::clone(&self.streamer),
                Arc::clone(&self.recorder),
                rx,
                self.cancel.clone(),
            ));
            info!(provider = %spec.provider, transformer = tts.name(), "🔊 Speaker connected");
            Ok::<_, TalkError>(Some(tts))
        };

        let ((tokenizer, synthesizers), tts) = tokio::join!(text_path, audio_path);
        let mut first_error = None;

        let tokenizer = match tokenizer {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(error = %e, "sentence tokenizer rejected, using default boundaries");
                first_error.get_or_insert(e);
                SentenceTokenizer::new(&self.deps.config.speaker.default_boundaries).ok()
            }
        };
        *self.speaker.tokenizer.write().unwrap_or_else(PoisonError::into_inner) =
            tokenizer.map(Arc::new);

        match synthesizers {
            Ok(chain) => {
                debug!(synthesizers = ?chain.names(), "synthesizer chain ready");
                *self
                    .speaker
                    .synthesizers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(chain));
            }
            Err(e) => {
                warn!(error = %e, "synthesizer chain unavailable, text is spoken verbatim");
                first_error.get_or_insert(e);
            }
        }

        match tts {
            Ok(tts) => *self.speaker.tts.write().unwrap_or_else(PoisonError::into_inner) = tts,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) async fn speak(&self, context_id: &str, chunk: &str) {
        for sentence in self.speaker.tokenize(context_id, chunk, false) {
            self.on_complete_sentence(&sentence.context_id, &sentence.text)
                .await;
        }
    }

    pub(crate) async fn on_complete_sentence(&self, context_id: &str, sentence: &str) {
        let Some(tts) = self.speaker.tts() else {
            return;
        };
        let text = self.speaker.synthesize(sentence);
        if text.trim().is_empty() {
            return;
        }
        let span = self.tracer.start_span(Stage::Speak);
        self.tracer
            .add_attributes(span, &[("context_id", context_id.to_string())]);
        if let Err(e) = tts.transform(context_id, &text, false).await {
            warn!(context_id, error = %e, "speech synthesis failed for sentence");
        }
        self.tracer.end_span(span);
    }

    /// Speak whatever is still buffered for `context_id` and wait for the audio to drain.
    pub(crate) async fn finish_speaking(&self, context_id: &str) {
        for sentence in self.speaker.tokenize(context_id, "", true) {
            self.on_complete_sentence(&sentence.context_id, &sentence.text)
                .await;
        }
        if let Some(tts) = self.speaker.tts() {
            if let Err(e) = tts.transform(context_id, "", true).await {
                warn!(context_id, error = %e, "speech synthesis did not finish");
            }
        }
    }

    pub(crate) async fn close_speaker(&self) {
        let tts = self
            .speaker
            .tts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tts) = tts {
            if let Err(e) = tts.close().await {
                warn!(transformer = tts.name(), error = %e, "text-to-speech close failed");
            }
        }
    }
}

async fn forward_audio(
    streamer: Arc<dyn Streamer>,
    recorder: Arc<Recorder>,
    mut audio: mpsc::UnboundedReceiver<SynthesizedAudio>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = audio.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        recorder.assistant(&chunk.data);
        let frame = Outbound::Audio {
            context_id: chunk.context_id,
            data: chunk.data,
            completed: chunk.completed,
        };
        if let Err(e) = streamer.send(frame).await {
            warn!(error = %e, "audio frame not delivered");
        }
    }
    debug!("speaker audio forwarding stopped");
}
