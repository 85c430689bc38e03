//! In-process model backend.
//!
//! Calls a [`LanguageModel`] directly with the conversation history the executor keeps
//! for itself. Each user turn runs as its own task; a newer turn or an interruption
//! cancels the one in flight.

use crate::accumulate::DeltaAccumulator;
use crate::error::{ExecutorError, ExecutorResult};
use crate::{Communication, Executor};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use talkgate_core::{
    ConnectRequest, Credential, CredentialStore, Message, Metric, Options, Packet, Role, Stage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a model needs for one completion.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub history: Vec<Message>,
    pub options: Options,
    pub credential: Option<Credential>,
}

/// A text generation backend streaming its answer as deltas.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name assistants refer to.
    fn provider(&self) -> &str;

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> ExecutorResult<BoxStream<'static, ExecutorResult<String>>>;
}

pub struct ModelExecutor {
    model: Arc<dyn LanguageModel>,
    model_name: String,
    credential_id: u64,
    options: Options,
    credentials: Option<Arc<dyn CredentialStore>>,
    credential: Mutex<Option<Credential>>,
    history: Arc<RwLock<Vec<Message>>>,
    accumulator: Arc<DeltaAccumulator>,
    inflight: Mutex<Option<(String, CancellationToken)>>,
    cancel: CancellationToken,
}

impl ModelExecutor {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        model_name: String,
        credential_id: u64,
        options: Options,
        credentials: Option<Arc<dyn CredentialStore>>,
    ) -> Self {
        Self {
            model,
            model_name,
            credential_id,
            options,
            credentials,
            credential: Mutex::new(None),
            history: Arc::new(RwLock::new(Vec::new())),
            accumulator: Arc::new(DeltaAccumulator::new()),
            inflight: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn push_history(&self, message: Message) {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    /// Cancel the running turn; `only` restricts it to one context.
    fn cancel_inflight(&self, only: Option<&str>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let matches = match (inflight.as_ref(), only) {
            (Some((ctx, _)), Some(target)) => ctx == target,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            if let Some((ctx, token)) = inflight.take() {
                debug!(context_id = %ctx, "cancelling in-flight generation");
                token.cancel();
                self.accumulator.discard(&ctx);
            }
        }
    }

    async fn start_turn(
        &self,
        comm: Arc<dyn Communication>,
        context_id: String,
        text: String,
    ) -> ExecutorResult<()> {
        self.cancel_inflight(None);
        self.push_history(Message::new(context_id.clone(), Role::User, text));

        let request = ModelRequest {
            model: self.model_name.clone(),
            history: self
                .history
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            options: self.options.merged(&comm.options()),
            credential: self
                .credential
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        let started = Instant::now();
        let deltas = self.model.stream(request).await?;

        let token = self.cancel.child_token();
        *self.inflight.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((context_id.clone(), token.clone()));

        tokio::spawn(generate(
            comm,
            deltas,
            token,
            context_id,
            started,
            Arc::clone(&self.accumulator),
            Arc::clone(&self.history),
        ));
        Ok(())
    }
}

async fn generate(
    comm: Arc<dyn Communication>,
    mut deltas: BoxStream<'static, ExecutorResult<String>>,
    token: CancellationToken,
    context_id: String,
    started: Instant,
    acc: Arc<DeltaAccumulator>,
    history: Arc<RwLock<Vec<Message>>>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                acc.discard(&context_id);
                return;
            }
            next = deltas.next() => match next {
                Some(Ok(delta)) if delta.is_empty() => continue,
                Some(Ok(delta)) => {
                    if comm.on_packet(acc.delta(&context_id, &delta)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(context_id = %context_id, error = %e, "model stream failed mid-turn");
                    break;
                }
                None => break,
            }
        }
    }

    let done = acc.done(&context_id, "");
    if let Packet::Done { text, .. } = &done {
        history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Message::new(context_id.clone(), Role::Assistant, text.clone()));
    }
    let metrics = Packet::Metric {
        context_id: context_id.clone(),
        metrics: vec![Metric::time_taken(started.elapsed())],
    };
    for packet in [done, metrics] {
        if comm.on_packet(packet).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Executor for ModelExecutor {
    fn name(&self) -> &str {
        "model"
    }

    async fn initialize(
        &self,
        comm: Arc<dyn Communication>,
        _config: &ConnectRequest,
    ) -> ExecutorResult<()> {
        let tracer = comm.tracer();
        let span = tracer.start_span(Stage::Connect);
        tracer.add_attributes(
            span,
            &[
                ("executor", self.name().to_string()),
                ("provider", self.model.provider().to_string()),
            ],
        );

        let result = async {
            if self.credential_id != 0 {
                let store = self.credentials.as_ref().ok_or_else(|| {
                    ExecutorError::Model("model needs a credential but no store is configured".into())
                })?;
                let credential = store.get_credential(self.credential_id).await?;
                *self.credential.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential);
            }
            *self.history.write().unwrap_or_else(PoisonError::into_inner) = comm.histories();
            Ok(())
        }
        .await;

        tracer.end_span(span);
        if result.is_ok() {
            info!(provider = self.model.provider(), model = %self.model_name, "✅ Model executor ready");
        }
        result
    }

    async fn execute(&self, comm: Arc<dyn Communication>, packet: Packet) -> ExecutorResult<()> {
        let tracer = comm.tracer();
        let span = tracer.start_span(Stage::Execute);
        tracer.add_attributes(span, &[("context_id", packet.context_id().to_string())]);
        let result = match packet {
            Packet::UserText { context_id, text } => {
                self.start_turn(Arc::clone(&comm), context_id, text).await
            }
            Packet::Interruption { context_id, .. } => {
                self.cancel_inflight(Some(&context_id));
                Ok(())
            }
            Packet::Static { context_id, text } => {
                self.push_history(Message::new(context_id, Role::Assistant, text));
                Ok(())
            }
            other => {
                debug!(kind = other.kind(), "packet not forwarded to model executor");
                Ok(())
            }
        };
        tracer.end_span(span);
        result
    }

    async fn close(&self) -> ExecutorResult<()> {
        self.cancel.cancel();
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::recorder;
    use talkgate_core::{Channel, InMemoryCredentialStore};

    struct ScriptedModel {
        chunks: Vec<&'static str>,
        seen: Mutex<Vec<ModelRequest>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn stream(
            &self,
            request: ModelRequest,
        ) -> ExecutorResult<BoxStream<'static, ExecutorResult<String>>> {
            self.seen.lock().unwrap().push(request);
            let chunks: Vec<ExecutorResult<String>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            Ok(futures_util::stream::iter(chunks).boxed())
        }
    }

    fn executor(model: Arc<ScriptedModel>) -> ModelExecutor {
        ModelExecutor::new(model, "tiny".into(), 0, Options::new(), None)
    }

    #[tokio::test]
    async fn done_carries_all_deltas_and_history_grows() {
        let model = Arc::new(ScriptedModel {
            chunks: vec!["It is ", "", "noon", "."],
            seen: Mutex::new(Vec::new()),
        });
        let exec = executor(Arc::clone(&model));
        let earlier = vec![Message::new("g", Role::Assistant, "Hi Ada")];
        let (comm, mut rx) = recorder(earlier);
        exec.initialize(comm.clone(), &ConnectRequest::new(7, Channel::Web))
            .await
            .unwrap();

        exec.execute(
            comm.clone(),
            Packet::UserText {
                context_id: "c1".into(),
                text: "What time is it?".into(),
            },
        )
        .await
        .unwrap();

        let mut deltas = String::new();
        loop {
            match rx.recv().await.unwrap() {
                Packet::Delta { text, .. } => deltas.push_str(&text),
                Packet::Done { text, .. } => {
                    assert_eq!(text, deltas);
                    assert_eq!(text, "It is noon.");
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        match rx.recv().await.unwrap() {
            Packet::Metric { metrics, .. } => assert_eq!(metrics[0].name, "TIME_TAKEN"),
            other => panic!("unexpected {other:?}"),
        }

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].history.len(), 2);
        assert_eq!(seen[0].history[1].role, Role::User);
        assert_eq!(seen[0].model, "tiny");
        drop(seen);
        assert_eq!(exec.history.read().unwrap().len(), 3);
        exec.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_credential_fails_initialize() {
        let model = Arc::new(ScriptedModel {
            chunks: vec![],
            seen: Mutex::new(Vec::new()),
        });
        let exec = ModelExecutor::new(
            model,
            "tiny".into(),
            99,
            Options::new(),
            Some(Arc::new(InMemoryCredentialStore::new())),
        );
        let (comm, _rx) = recorder(Vec::new());
        let err = exec
            .initialize(comm, &ConnectRequest::new(7, Channel::Web))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Talk(_)));
    }
}
