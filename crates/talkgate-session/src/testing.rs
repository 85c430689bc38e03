//! In-memory collaborators for the engine's unit tests.

use crate::deps::SessionDeps;
use crate::engine::Session;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use talkgate_core::{
    AssistantDefinition, AudioConfig, AuthType, BehaviorSpec, Channel, ConnectRequest,
    EngineConfig, ExecutorSpec, Inbound, InMemoryAssistantCatalog, InMemoryConversationStore,
    InMemoryCredentialStore, Options, Outbound, Principal, RecordingTracer, Role, Streamer,
    TalkResult, WebhookDispatcher, WebhookEvent, WebhookSpec,
};
use talkgate_executor::{ExecutorFactory, ExecutorResult, LanguageModel, ModelRequest};
use tokio::sync::mpsc;

pub(crate) struct CapturingStreamer {
    audio: Option<AudioConfig>,
    sent: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl Streamer for CapturingStreamer {
    async fn recv(&self) -> TalkResult<Option<Inbound>> {
        std::future::pending().await
    }

    async fn send(&self, frame: Outbound) -> TalkResult<()> {
        let _ = self.sent.send(frame);
        Ok(())
    }

    fn config(&self) -> Option<AudioConfig> {
        self.audio
    }
}

/// Answers "ok: <last user text>" one word at a time.
pub(crate) struct EchoModel;

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

struct NoWebhooks;

#[async_trait]
impl WebhookDispatcher for NoWebhooks {
    async fn dispatch(&self, _spec: &WebhookSpec, _event: &WebhookEvent) -> TalkResult<()> {
        Ok(())
    }
}

pub(crate) fn assistant() -> AssistantDefinition {
    AssistantDefinition {
        id: 1,
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

/// A session connected over a text-only channel, plus everything it sent to the transport.
pub(crate) async fn connected() -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
    let config = Arc::new(EngineConfig::default());
    let assistants = InMemoryAssistantCatalog::default();
    assistants.insert(assistant());
    let credentials = Arc::new(InMemoryCredentialStore::default());
    let executors = ExecutorFactory::new(config.websocket.clone()).with_credentials(credentials.clone());
    executors.register_model(Arc::new(EchoModel));
    let deps = SessionDeps::new(
        config,
        Arc::new(assistants),
        Arc::new(InMemoryConversationStore::new()),
        credentials,
        Arc::new(NoWebhooks),
        Arc::new(executors),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let streamer = Arc::new(CapturingStreamer {
        audio: None,
        sent: tx,
    });
    let session = Arc::new(Session::new(deps, streamer, Arc::new(RecordingTracer::new())));
    let principal = Principal {
        token: "test-key".into(),
        auth_type: AuthType::ApiKey,
    };
    session
        .connect(&principal, ConnectRequest::new(1, Channel::Web))
        .await
        .expect("connect");
    (session, rx)
}

/// Poll `check` until it holds, failing after roughly a second.
pub(crate) async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}
