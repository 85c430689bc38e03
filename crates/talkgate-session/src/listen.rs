//! Listen pipeline: transport audio → speech-to-text and voice activity detection →
//! finalized utterances for the executor.
//!
//! Every consumer of audio or transcript text gets its own unbounded queue drained by its
//! own task, so one slow consumer never reorders or drops frames for another.

use crate::engine::{new_context_id, Session};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use talkgate_core::{
    Activity, InterruptionSource, Outbound, Packet, SpeechToText, Stage, TalkError, TalkResult,
    Transcript,
};
use talkgate_voice::{AudioAnalyzer, SilenceEndOfSpeech, TextAnalyzer, TurnConfig, VadAnalyzer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Speech starting earlier than this (seconds of received audio) is line noise at pickup,
/// not barge-in.
const MIN_BARGE_IN_SECS: f64 = 1.0;

#[derive(Clone)]
enum AudioSink {
    Transcriber(Arc<dyn SpeechToText>),
    Analyzer(Arc<dyn AudioAnalyzer>),
}

impl AudioSink {
    fn name(&self) -> String {
        match self {
            AudioSink::Transcriber(stt) => stt.name().to_string(),
            AudioSink::Analyzer(analyzer) => analyzer.name().to_string(),
        }
    }

    async fn feed(&self, frame: &[u8]) -> TalkResult<()> {
        match self {
            AudioSink::Transcriber(stt) => stt.transform(frame).await,
            AudioSink::Analyzer(analyzer) => analyzer.analyze(frame).await.map_err(TalkError::from),
        }
    }
}

#[derive(Default)]
pub(crate) struct Listener {
    stt: RwLock<Option<Arc<dyn SpeechToText>>>,
    audio_analyzers: RwLock<Vec<Arc<dyn AudioAnalyzer>>>,
    text_analyzers: RwLock<Vec<Arc<dyn TextAnalyzer>>>,
    audio_queues: Mutex<Vec<mpsc::UnboundedSender<Arc<[u8]>>>>,
    text_queues: Mutex<Vec<mpsc::UnboundedSender<(String, bool)>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    /// Completed transcripts not yet handed to the executor.
    pending: Mutex<String>,
    /// Latest interim transcript.
    interim: Mutex<String>,
}

impl Listener {
    fn attach_audio(&self, sink: AudioSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drain_audio(sink.clone(), rx));
        self.audio_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        match sink {
            AudioSink::Transcriber(stt) => {
                *self.stt.write().unwrap_or_else(PoisonError::into_inner) = Some(stt)
            }
            AudioSink::Analyzer(analyzer) => self
                .audio_analyzers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(analyzer),
        }
    }

    fn attach_text(&self, analyzer: Arc<dyn TextAnalyzer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drain_text(Arc::clone(&analyzer), rx));
        self.text_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        self.text_analyzers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(analyzer);
    }

    /// Returns how many consumers the frame was queued for.
    fn fan_out_audio(&self, frame: &[u8]) -> usize {
        let queues = self.audio_queues.lock().unwrap_or_else(PoisonError::into_inner);
        if queues.is_empty() {
            return 0;
        }
        let frame: Arc<[u8]> = Arc::from(frame);
        queues
            .iter()
            .filter(|q| q.send(Arc::clone(&frame)).is_ok())
            .count()
    }

    fn fan_out_text(&self, text: &str, completed: bool) {
        let queues = self.text_queues.lock().unwrap_or_else(PoisonError::into_inner);
        for queue in queues.iter() {
            let _ = queue.send((text.to_string(), completed));
        }
    }

    fn push_transcript(&self, text: &str, completed: bool) {
        if completed {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if !pending.is_empty() {
                pending.push(' ');
            }
            pending.push_str(text);
            self.interim
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        } else {
            *self.interim.lock().unwrap_or_else(PoisonError::into_inner) = text.to_string();
        }
    }

    fn take_pending(&self) -> String {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn interim(&self) -> String {
        self.interim
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn drain_audio(sink: AudioSink, mut frames: mpsc::UnboundedReceiver<Arc<[u8]>>) {
    let name = sink.name();
    let mut ended = false;
    while let Some(frame) = frames.recv().await {
        if ended {
            continue;
        }
        match sink.feed(&frame).await {
            Ok(()) => {}
            Err(e) if e.is_end_of_stream() => {
                info!(consumer = %name, "audio consumer reached end of stream");
                ended = true;
            }
            Err(e) => debug!(consumer = %name, error = %e, "audio frame rejected"),
        }
    }
    debug!(consumer = %name, "audio queue closed");
}

async fn drain_text(
    analyzer: Arc<dyn TextAnalyzer>,
    mut texts: mpsc::UnboundedReceiver<(String, bool)>,
) {
    while let Some((text, completed)) = texts.recv().await {
        if let Err(e) = analyzer.analyze(&text, completed).await {
            debug!(analyzer = analyzer.name(), error = %e, "transcript rejected");
        }
    }
}

impl Session {
    /// Bring up speech-to-text, the VAD analyzer and the end-of-speech analyzer
    /// concurrently. Text-only channels have nothing to connect.
    pub(crate) async fn connect_listener(self: &Arc<Self>) -> TalkResult<()> {
        let Some(audio) = self.streamer.config() else {
            debug!("text-only channel, listener not connected");
            return Ok(());
        };
        let assistant = self.assistant()?;
        let settings = &self.deps.config.listener;
        let options = assistant.options.merged(&self.state.options());

        let (activity_tx, activity_rx) = mpsc::unbounded_channel::<Activity>();
        tokio::spawn(receive_activities(Arc::clone(self), activity_rx));

        let transcriber = async {
            let Some(spec) = assistant.listener.clone() else {
                debug!("assistant has no listener configured");
                return Ok(None);
            };
            let credential = self
                .deps
                .credentials
                .get_credential(spec.credential_id)
                .await
                .map_err(|e| {
                    TalkError::Credential(format!("listener credential {}: {e}", spec.credential_id))
                })?;
            let Some(stt) = self
                .deps
                .transformers
                .speech_to_text(&spec, &credential, &audio)
                .await?
            else {
                info!(provider = %spec.provider, "no speech-to-text transformer for this channel");
                return Ok(None);
            };
            let (tx, rx) = mpsc::unbounded_channel();
            stt.initialize(tx).await?;
            tokio::spawn(receive_transcripts(Arc::clone(self), rx));
            Ok::<_, TalkError>(Some(stt))
        };

        let vad = async {
            let turn = TurnConfig {
                silence_threshold: Duration::from_millis(settings.vad_silence_ms),
                min_speech_duration: Duration::from_millis(settings.vad_min_speech_ms),
                ..TurnConfig::default()
            };
            let analyzer: Arc<dyn AudioAnalyzer> =
                Arc::new(VadAnalyzer::new(audio, settings.vad_mode, turn));
            analyzer.initialize(activity_tx.clone()).await?;
            Ok::<_, TalkError>(analyzer)
        };

        let end_of_speech = async {
            let analyzer: Arc<dyn TextAnalyzer> = Arc::new(SilenceEndOfSpeech::from_options(
                &options,
                Duration::from_millis(settings.eos_timeout_ms),
            ));
            analyzer.initialize(activity_tx.clone()).await?;
            Ok::<_, TalkError>(analyzer)
        };

        let (transcriber, vad, end_of_speech) = tokio::join!(transcriber, vad, end_of_speech);
        let mut first_error = None;

        match transcriber {
            Ok(Some(stt)) => {
                info!(transformer = stt.name(), "🎙️ Speech-to-text connected");
                self.listener.attach_audio(AudioSink::Transcriber(stt));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "speech-to-text unavailable");
                first_error.get_or_insert(e);
            }
        }
        match vad {
            Ok(analyzer) => self.listener.attach_audio(AudioSink::Analyzer(analyzer)),
            Err(e) => {
                warn!(error = %e, "voice activity detection unavailable");
                first_error.get_or_insert(e);
            }
        }
        match end_of_speech {
            Ok(analyzer) => self.listener.attach_text(analyzer),
            Err(e) => {
                warn!(error = %e, "end-of-speech analyzer unavailable");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) async fn listen_audio(&self, frame: &[u8]) -> TalkResult<()> {
        self.ensure_active()?;
        self.recorder.user(frame);
        if self.listener.fan_out_audio(frame) == 0 {
            debug!(bytes = frame.len(), "no audio consumers, frame ignored");
        }
        Ok(())
    }

    /// Typed user input skips the analyzers and starts a turn right away.
    pub(crate) async fn listen_text(self: &Arc<Self>, text: &str) -> TalkResult<()> {
        self.ensure_active()?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.on_packet(Packet::UserText {
            context_id: new_context_id(),
            text: text.to_string(),
        })
        .await
    }

    pub(crate) async fn listen_transcript(self: &Arc<Self>, transcript: Transcript) {
        let text = transcript.text.trim();
        if text.is_empty() {
            return;
        }
        let span = self.tracer.start_span(Stage::Listen);
        self.tracer.add_attributes(
            span,
            &[
                ("completed", transcript.completed.to_string()),
                ("confidence", format!("{:.3}", transcript.confidence)),
                ("language", transcript.language.clone().unwrap_or_default()),
                ("received_at", chrono::Utc::now().to_rfc3339()),
            ],
        );
        debug!(completed = transcript.completed, chars = text.len(), "transcript received");

        if let Err(e) = self
            .streamer
            .send(Outbound::UserTranscript {
                text: text.to_string(),
                completed: transcript.completed,
            })
            .await
        {
            warn!(error = %e, "transcript echo not delivered");
        }
        self.listener.push_transcript(text, transcript.completed);
        self.listener.fan_out_text(text, transcript.completed);
        self.tracer.end_span(span);
    }

    pub(crate) async fn after_analyze(self: &Arc<Self>, activity: Activity) {
        match activity {
            Activity::SpeechStart {
                start_at,
                energy,
                confidence,
            } => {
                if start_at < MIN_BARGE_IN_SECS {
                    debug!(start_at, "speech start too early for barge-in, ignored");
                    return;
                }
                debug!(start_at, energy, confidence, "user started speaking");
                let interim = self.listener.interim();
                if !interim.is_empty() {
                    self.listener.fan_out_text(&interim, false);
                }
                let Some(target) = self.turns.interrupt_target() else {
                    debug!("nothing to interrupt");
                    return;
                };
                if let Err(e) = self.on_interrupt(&target, InterruptionSource::Vad).await {
                    warn!(error = %e, "barge-in handling failed");
                }
            }
            Activity::SpeechEnd { start_at, end_at, .. } => {
                debug!(start_at, end_at, "user stopped speaking");
                self.on_silence_break().await;
            }
            Activity::System { time } => debug!(%time, "system activity"),
        }
    }

    /// Hand everything transcribed since the last break to the executor. VAD and the
    /// end-of-speech analyzer both report the same break; whichever comes second finds
    /// nothing pending.
    async fn on_silence_break(self: &Arc<Self>) {
        let utterance = self.listener.take_pending();
        if utterance.is_empty() {
            return;
        }
        let context_id = new_context_id();
        info!(context_id = %context_id, chars = utterance.len(), "🗣️ Utterance finalized");
        let packet = Packet::EndOfSpeech {
            context_id,
            speech: utterance,
        };
        if let Err(e) = self.on_packet(packet).await {
            warn!(error = %e, "utterance not handled");
        }
    }

    /// Stop feeding consumers, let them drain, then close transcriber and analyzers.
    pub(crate) async fn close_listener(&self) {
        self.listener
            .audio_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.listener
            .text_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let consumers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .listener
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for consumer in consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "listener consumer task failed");
            }
        }

        let stt = self
            .listener
            .stt
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stt) = stt {
            if let Err(e) = stt.close().await {
                warn!(transformer = stt.name(), error = %e, "speech-to-text close failed");
            }
        }

        let audio_analyzers = std::mem::take(
            &mut *self
                .listener
                .audio_analyzers
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for analyzer in audio_analyzers {
            if let Err(e) = analyzer.close().await {
                warn!(analyzer = analyzer.name(), error = %e, "audio analyzer close failed");
            }
        }
        let text_analyzers = std::mem::take(
            &mut *self
                .listener
                .text_analyzers
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for analyzer in text_analyzers {
            if let Err(e) = analyzer.close().await {
                warn!(analyzer = analyzer.name(), error = %e, "text analyzer close failed");
            }
        }
    }
}

async fn receive_activities(session: Arc<Session>, mut activities: mpsc::UnboundedReceiver<Activity>) {
    loop {
        let activity = tokio::select! {
            _ = session.cancel.cancelled() => break,
            activity = activities.recv() => match activity {
                Some(activity) => activity,
                None => break,
            },
        };
        session.after_analyze(activity).await;
    }
}

async fn receive_transcripts(
    session: Arc<Session>,
    mut transcripts: mpsc::UnboundedReceiver<Transcript>,
) {
    loop {
        let transcript = tokio::select! {
            _ = session.cancel.cancelled() => break,
            transcript = transcripts.recv() => match transcript {
                Some(transcript) => transcript,
                None => break,
            },
        };
        session.listen_transcript(transcript).await;
    }
}
