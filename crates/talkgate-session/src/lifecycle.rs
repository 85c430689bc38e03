//! Connect and disconnect.

use crate::engine::Session;
use crate::link::EngineLink;
use chrono::Utc;
use std::sync::Arc;
use talkgate_core::message::{STATUS_COMPLETE, STATUS_IN_PROGRESS};
use talkgate_core::{
    AssistantDefinition, ConnectRequest, LifecycleState, Metric, Principal, Recording,
    SessionIdentity, Stage, TalkError, TalkResult, WebhookEventKind,
};
use talkgate_executor::Communication;
use tracing::{error, info, instrument, warn};

impl Session {
    #[instrument(skip_all, fields(assistant_id = request.assistant_id, channel = request.channel.as_str()))]
    pub(crate) async fn connect(
        self: &Arc<Self>,
        principal: &Principal,
        request: ConnectRequest,
    ) -> TalkResult<()> {
        principal.validate()?;
        request.validate()?;
        self.transition(LifecycleState::Connecting)?;

        let span = self.tracer.start_span(Stage::Connect);
        self.tracer.add_attributes(
            span,
            &[
                ("assistant_id", request.assistant_id.to_string()),
                ("channel", request.channel.as_str().to_string()),
            ],
        );
        let result = self.establish(&request).await;
        self.tracer.end_span(span);

        let resumed = match result {
            Ok(resumed) => resumed,
            Err(e) => {
                error!(error = %e, "❌ Connect failed");
                self.close_listener().await;
                self.close_speaker().await;
                self.unbind();
                self.transition(LifecycleState::Idle)?;
                return Err(e);
            }
        };

        self.transition(LifecycleState::Active)?;
        self.start_dispatcher();

        self.state.upsert_metrics([Metric::status(STATUS_IN_PROGRESS)]);
        self.persist_metrics(vec![Metric::status(STATUS_IN_PROGRESS)]);
        if !resumed {
            self.greet();
            self.notify(WebhookEventKind::ConversationBegin);
        }
        self.start_behaviors();

        let identity = self.identity()?;
        info!(
            conversation_id = identity.conversation_id,
            resumed,
            "✅ Session active"
        );
        Ok(())
    }

    /// Resolve the assistant, bind the conversation and bring the pipelines up. Returns
    /// whether an existing conversation was resumed.
    async fn establish(self: &Arc<Self>, request: &ConnectRequest) -> TalkResult<bool> {
        let assistant = Arc::new(self.deps.assistants.get_assistant(request.assistant_id).await?);
        let (identity, resumed) = match request.conversation_id {
            Some(conversation_id) => (
                self.on_resume_session(&assistant, conversation_id, request)
                    .await?,
                true,
            ),
            None => (self.on_create_session(&assistant, request).await?, false),
        };
        self.bind(identity.clone(), Arc::clone(&assistant));

        let executor = self.deps.executors.build(&assistant.executor)?;
        let link: Arc<dyn Communication> = Arc::new(EngineLink::new(
            identity,
            Arc::clone(&self.state),
            Arc::clone(&self.tracer),
            self.packet_sender(),
        ));

        let (listener, speaker, ready) = tokio::join!(
            self.connect_listener(),
            self.connect_speaker(),
            executor.initialize(Arc::clone(&link), request),
        );
        if let Err(e) = listener {
            warn!(error = %e, "listener not fully connected, continuing");
        }
        match speaker {
            Err(TalkError::Credential(reason)) => {
                warn!(%reason, "speaker credential unavailable, continuing without speech output")
            }
            Err(e) => warn!(error = %e, "speaker not fully connected, continuing"),
            Ok(()) => {}
        }
        ready?;
        info!(executor = executor.name(), "executor initialized");

        self.attach_executor(executor, link);
        Ok(resumed)
    }

    async fn on_create_session(
        &self,
        assistant: &AssistantDefinition,
        request: &ConnectRequest,
    ) -> TalkResult<SessionIdentity> {
        let mut identity = SessionIdentity {
            conversation_id: 0,
            assistant_id: assistant.id,
            provider_model_id: assistant.provider_model_id,
            channel: request.channel,
            direction: request.direction,
            start_time: Utc::now(),
        };
        identity.conversation_id = self.deps.conversations.create_conversation(&identity).await?;

        self.state.replace_args(&request.args);
        self.state.replace_options(&request.options);
        self.state.replace_metadata(&request.metadata);
        self.state.set_metadata("talk.channel", request.channel.as_str());

        let args = self.state.args();
        let options = self.state.options();
        let metadata = self.state.metadata();
        self.persist_for(&identity, "conversation arguments", move |store, a, c| async move {
            store.apply_conversation_arguments(a, c, &args).await
        });
        self.persist_for(&identity, "conversation options", move |store, a, c| async move {
            store.apply_conversation_options(a, c, &options).await
        });
        self.persist_for(&identity, "conversation metadata", move |store, a, c| async move {
            store.apply_conversation_metadata(a, c, &metadata).await
        });

        info!(conversation_id = identity.conversation_id, "conversation created");
        Ok(identity)
    }

    async fn on_resume_session(
        &self,
        assistant: &AssistantDefinition,
        conversation_id: u64,
        request: &ConnectRequest,
    ) -> TalkResult<SessionIdentity> {
        let record = self
            .deps
            .conversations
            .get_conversation(assistant.id, conversation_id)
            .await?;

        self.state.replace_args(&record.args);
        self.state.replace_options(&record.options);
        self.state.replace_metadata(&record.metadata);
        for message in &record.messages {
            self.state.append_history(message.clone());
        }

        info!(
            conversation_id,
            messages = record.messages.len(),
            "conversation resumed"
        );
        Ok(SessionIdentity {
            conversation_id,
            assistant_id: assistant.id,
            provider_model_id: assistant.provider_model_id,
            channel: request.channel,
            direction: request.direction,
            start_time: Utc::now(),
        })
    }

    #[instrument(skip_all)]
    pub(crate) async fn disconnect(self: &Arc<Self>) -> TalkResult<()> {
        if self.lifecycle() == LifecycleState::Connecting {
            return Err(TalkError::InvalidState("connect still in progress".into()));
        }
        self.transition(LifecycleState::Disconnecting)?;
        self.behaviors.cancel();
        let span = self.tracer.start_span(Stage::Disconnect);
        let identity = self.identity()?;

        let completion = async {
            let elapsed = (Utc::now() - identity.start_time)
                .to_std()
                .unwrap_or_default();
            let metrics = vec![Metric::time_taken(elapsed), Metric::status(STATUS_COMPLETE)];
            self.state.upsert_metrics(metrics.clone());
            self.persist_metrics(metrics);
        };
        tokio::join!(completion, self.close_listener(), self.close_speaker());

        let metadata = self.state.metadata();
        self.persist("conversation metadata", move |store, a, c| async move {
            store.apply_conversation_metadata(a, c, &metadata).await
        });
        self.notify(WebhookEventKind::ConversationCompleted);

        self.tracer.add_attributes(
            span,
            &[("conversation_id", identity.conversation_id.to_string())],
        );
        self.tracer.end_span(span);
        match self.tracer.export().await {
            Ok(spans) => info!(spans, "telemetry exported"),
            Err(e) => warn!(error = %e, "telemetry export failed"),
        }

        match self.executor() {
            Ok(executor) => {
                if let Err(e) = executor.close().await {
                    warn!(error = %e, "executor close failed");
                }
            }
            Err(_) => warn!("no executor to close"),
        }

        let (user_audio, assistant_audio) = self.recorder.take();
        let recording = Recording {
            transcript: self.state.histories(),
            user_audio,
            assistant_audio,
            created_at: Utc::now(),
        };
        self.persist("conversation recording", move |store, a, c| async move {
            store.create_conversation_recording(a, c, &recording).await
        });

        self.cancel.cancel();
        self.worker.shutdown().await;
        self.transition(LifecycleState::Closed)?;
        info!(
            conversation_id = identity.conversation_id,
            dropped_jobs = self.worker.dropped(),
            "👋 Session closed"
        );
        Ok(())
    }
}
