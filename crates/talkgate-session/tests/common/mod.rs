//! Fakes shared by the session integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use talkgate_core::{
    AssistantDefinition, AudioConfig, AuthType, BehaviorSpec, Credential, EngineConfig,
    ExecutorSpec, Inbound, InMemoryAssistantCatalog, InMemoryConversationStore,
    InMemoryCredentialStore, Options, Outbound, Principal, RecordingTracer, Role, SpeechToText,
    Streamer, SynthesizedAudio, TalkResult, TextToSpeech, Transcript, TransformerFactory,
    TransformerSpec, WebhookDispatcher, WebhookEvent, WebhookEventKind, WebhookSpec,
};
use talkgate_executor::{ExecutorError, ExecutorFactory, ExecutorResult, LanguageModel, ModelRequest};
use talkgate_session::{SessionDeps, TalkEngine};
use tokio::sync::mpsc;

pub const ASSISTANT_ID: u64 = 1;
pub const SPEECH_CREDENTIAL: u64 = 7;

pub fn principal() -> Principal {
    Principal {
        token: "test-key".into(),
        auth_type: AuthType::ApiKey,
    }
}

/// Text assistant answering through [`EchoModel`].
pub fn assistant() -> AssistantDefinition {
    AssistantDefinition {
        id: ASSISTANT_ID,
        name: "concierge".into(),
        provider_model_id: 11,
        executor: ExecutorSpec::Model {
            provider: "echo".into(),
            model: "echo-1".into(),
            credential_id: 0,
            options: Options::new(),
        },
        greeting: None,
        behavior: BehaviorSpec::default(),
        listener: None,
        speaker: None,
        options: Options::new(),
        webhooks: Vec::new(),
    }
}

/// Same assistant with speech in and out through [`FakeSpeech`].
pub fn voice_assistant() -> AssistantDefinition {
    let spec = TransformerSpec {
        provider: "fake".into(),
        credential_id: SPEECH_CREDENTIAL,
        options: Options::new(),
    };
    AssistantDefinition {
        listener: Some(spec.clone()),
        speaker: Some(spec),
        options: Options::new().with("microphone.eos.timeout", 50),
        ..assistant()
    }
}

pub fn webhook_for_all_events() -> WebhookSpec {
    WebhookSpec {
        url: "https://hooks.example.com/talk".into(),
        events: vec![
            WebhookEventKind::ConversationBegin,
            WebhookEventKind::ConversationCompleted,
        ],
        headers: Default::default(),
        retry: Default::default(),
    }
}

/// Answers "ok: <last user text>" one word at a time.
pub struct EchoModel;

#[async_trait]
impl LanguageModel for EchoModel {
    fn provider(&self) -> &str {
        "echo"
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> ExecutorResult<BoxStream<'static, ExecutorResult<String>>> {
        let last = request
            .history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.contents.clone())
            .unwrap_or_default();
        let words: Vec<ExecutorResult<String>> = format!("ok: {last}")
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(futures_util::stream::iter(words).boxed())
    }
}

/// Refuses every completion.
pub struct BrokenModel;

#[async_trait]
impl LanguageModel for BrokenModel {
    fn provider(&self) -> &str {
        "broken"
    }

    async fn stream(
        &self,
        _request: ModelRequest,
    ) -> ExecutorResult<BoxStream<'static, ExecutorResult<String>>> {
        Err(ExecutorError::Model("upstream unavailable".into()))
    }
}

#[derive(Default)]
pub struct RecordingWebhooks {
    events: Mutex<Vec<WebhookEvent>>,
}

impl RecordingWebhooks {
    pub fn kinds(&self) -> Vec<WebhookEventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn events(&self) -> Vec<WebhookEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookDispatcher for RecordingWebhooks {
    async fn dispatch(&self, _spec: &WebhookSpec, event: &WebhookEvent) -> TalkResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// What the fake speech providers saw.
#[derive(Default)]
pub struct SpeechLog {
    frames: Mutex<Vec<Vec<u8>>>,
    spoken: Mutex<Vec<String>>,
    transcripts: Mutex<Option<mpsc::UnboundedSender<Transcript>>>,
}

impl SpeechLog {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    /// Deliver a transcript as if the provider had recognized it.
    pub fn transcribe(&self, text: &str, completed: bool) {
        let sender = self.transcripts.lock().unwrap().clone();
        sender
            .expect("speech-to-text not initialized")
            .send(Transcript {
                text: text.to_string(),
                confidence: 0.92,
                language: Some("en-US".into()),
                completed,
            })
            .unwrap();
    }
}

pub struct FakeSpeech {
    pub log: Arc<SpeechLog>,
}

struct FakeStt {
    log: Arc<SpeechLog>,
}

#[async_trait]
impl SpeechToText for FakeStt {
    fn name(&self) -> &str {
        "fake-stt"
    }

    async fn initialize(&self, transcripts: mpsc::UnboundedSender<Transcript>) -> TalkResult<()> {
        *self.log.transcripts.lock().unwrap() = Some(transcripts);
        Ok(())
    }

    async fn transform(&self, frame: &[u8]) -> TalkResult<()> {
        self.log.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    async fn close(&self) -> TalkResult<()> {
        self.log.transcripts.lock().unwrap().take();
        Ok(())
    }
}

/// "Synthesizes" each sentence as its UTF-8 bytes.
struct FakeTts {
    log: Arc<SpeechLog>,
    audio: Mutex<Option<mpsc::UnboundedSender<SynthesizedAudio>>>,
}

impl FakeTts {
    fn emit(&self, context_id: &str, data: Vec<u8>, completed: bool) {
        if let Some(audio) = self.audio.lock().unwrap().as_ref() {
            let _ = audio.send(SynthesizedAudio {
                context_id: context_id.to_string(),
                data,
                completed,
            });
        }
    }
}

#[async_trait]
impl TextToSpeech for FakeTts {
    fn name(&self) -> &str {
        "fake-tts"
    }

    async fn initialize(&self, audio: mpsc::UnboundedSender<SynthesizedAudio>) -> TalkResult<()> {
        *self.audio.lock().unwrap() = Some(audio);
        Ok(())
    }

    async fn transform(&self, context_id: &str, text: &str, is_complete: bool) -> TalkResult<()> {
        if !text.is_empty() {
            self.log.spoken.lock().unwrap().push(text.to_string());
            self.emit(context_id, text.as_bytes().to_vec(), false);
        }
        if is_complete {
            self.emit(context_id, Vec::new(), true);
        }
        Ok(())
    }

    async fn close(&self) -> TalkResult<()> {
        self.audio.lock().unwrap().take();
        Ok(())
    }
}

#[async_trait]
impl TransformerFactory for FakeSpeech {
    async fn speech_to_text(
        &self,
        _spec: &TransformerSpec,
        _credential: &Credential,
        _audio: &AudioConfig,
    ) -> TalkResult<Option<Arc<dyn SpeechToText>>> {
        Ok(Some(Arc::new(FakeStt {
            log: Arc::clone(&self.log),
        })))
    }

    async fn text_to_speech(
        &self,
        _spec: &TransformerSpec,
        _credential: &Credential,
        _audio: &AudioConfig,
    ) -> TalkResult<Option<Arc<dyn TextToSpeech>>> {
        Ok(Some(Arc::new(FakeTts {
            log: Arc::clone(&self.log),
            audio: Mutex::new(None),
        })))
    }
}

/// Transport fed by the test through `inbound`, recording everything sent back.
pub struct ChannelStreamer {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    sent: mpsc::UnboundedSender<Outbound>,
    audio: Option<AudioConfig>,
}

#[async_trait]
impl Streamer for ChannelStreamer {
    async fn recv(&self) -> TalkResult<Option<Inbound>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn send(&self, frame: Outbound) -> TalkResult<()> {
        let _ = self.sent.send(frame);
        Ok(())
    }

    fn config(&self) -> Option<AudioConfig> {
        self.audio
    }
}

pub struct Harness {
    pub engine: TalkEngine,
    /// The collaborators `engine` was built from, for building more sessions.
    pub deps: SessionDeps,
    pub inbound: mpsc::UnboundedSender<Inbound>,
    pub sent: mpsc::UnboundedReceiver<Outbound>,
    pub store: Arc<InMemoryConversationStore>,
    pub webhooks: Arc<RecordingWebhooks>,
    pub tracer: Arc<RecordingTracer>,
    pub speech: Arc<SpeechLog>,
}

impl Harness {
    pub fn new(assistant: AssistantDefinition, audio: Option<AudioConfig>) -> Self {
        Self::with_store(assistant, audio, Arc::new(InMemoryConversationStore::new()))
    }

    pub fn with_store(
        assistant: AssistantDefinition,
        audio: Option<AudioConfig>,
        store: Arc<InMemoryConversationStore>,
    ) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let config = Arc::new(EngineConfig::default());
        let assistants = InMemoryAssistantCatalog::new();
        assistants.insert(assistant);
        let credentials = Arc::new(InMemoryCredentialStore::new());
        credentials.insert(Credential {
            id: SPEECH_CREDENTIAL,
            provider: "fake".into(),
            value: Options::new().with("key", "secret"),
        });
        let executors =
            ExecutorFactory::new(config.websocket.clone()).with_credentials(credentials.clone());
        executors.register_model(Arc::new(EchoModel));
        executors.register_model(Arc::new(BrokenModel));

        let webhooks = Arc::new(RecordingWebhooks::default());
        let speech = Arc::new(SpeechLog::default());
        let deps = SessionDeps::new(
            config,
            Arc::new(assistants),
            store.clone(),
            credentials,
            webhooks.clone(),
            Arc::new(executors),
        )
        .with_transformers(Arc::new(FakeSpeech {
            log: Arc::clone(&speech),
        }));

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let streamer = Arc::new(ChannelStreamer {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            sent: sent_tx,
            audio,
        });
        let tracer = Arc::new(RecordingTracer::new());
        let engine = TalkEngine::new(deps.clone(), streamer, tracer.clone());
        Self {
            engine,
            deps,
            inbound,
            sent,
            store,
            webhooks,
            tracer,
            speech,
        }
    }

    /// Next frame sent to the transport, within two seconds.
    pub async fn next_frame(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("no frame within two seconds")
            .expect("transport channel closed")
    }

    /// Text of the next completed assistant message, skipping everything else.
    pub async fn next_reply(&mut self) -> String {
        loop {
            if let Outbound::Text {
                text,
                completed: true,
                ..
            } = self.next_frame().await
            {
                return text;
            }
        }
    }

    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Poll `check` until it holds, failing after roughly two seconds.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
