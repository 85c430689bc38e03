//! Packet handling.
//!
//! Executor output and behavior prompts arrive on one queue drained by a single dispatcher
//! task, so packets of one turn are handled in the order they were produced. The listen
//! pipeline hands finished utterances straight to [`Session::on_packet`].

use crate::engine::Session;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use talkgate_core::config::DEFAULT_ERROR_MESSAGE;
use talkgate_core::{
    Directive, InterruptionSource, Message, Metric, Options, Outbound, Packet, Role, Stage,
    TalkResult,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

impl Session {
    pub(crate) fn start_dispatcher(self: &Arc<Self>) {
        let Some(inbox) = self.take_inbox() else {
            warn!("packet dispatcher already running");
            return;
        };
        tokio::spawn(run_dispatcher(Arc::clone(self), inbox));
    }

    pub(crate) async fn on_packet(self: &Arc<Self>, packet: Packet) -> TalkResult<()> {
        match packet {
            Packet::UserText { context_id, text } => self.on_user_text(context_id, text).await,
            Packet::EndOfSpeech { context_id, speech } => {
                self.on_user_text(context_id, speech).await
            }
            Packet::Delta { context_id, text } => {
                if !self.turns.is_current(&context_id) {
                    debug!(context_id = %context_id, "stale delta dropped");
                    return Ok(());
                }
                self.turns.spoke(&context_id);
                self.streamer
                    .send(Outbound::Text {
                        context_id: context_id.clone(),
                        text: text.clone(),
                        completed: false,
                    })
                    .await?;
                self.speak(&context_id, &text).await;
                Ok(())
            }
            Packet::Done { context_id, text } => self.on_done(context_id, text).await,
            Packet::Interruption { context_id, source } => {
                self.on_interrupt(&context_id, source).await
            }
            Packet::Directive {
                context_id,
                directive,
                args,
            } => self.on_directive(context_id, directive, args).await,
            Packet::Static { context_id, text } => self.on_static(context_id, text).await,
            Packet::Metric {
                context_id,
                metrics,
            } => {
                self.on_metrics(context_id, metrics);
                Ok(())
            }
            Packet::Transcript {
                text, completed, ..
            } => {
                self.streamer
                    .send(Outbound::UserTranscript { text, completed })
                    .await
            }
        }
    }

    async fn on_user_text(self: &Arc<Self>, context_id: String, text: String) -> TalkResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.idle.touch();
        if let Some(previous) = self.turns.begin(&context_id) {
            self.on_interrupt(&previous, InterruptionSource::Word).await?;
        }

        let message = Message::new(context_id.clone(), Role::User, text);
        self.state.append_history(message.clone());
        self.persist_message(message);

        let executor = self.executor()?;
        let link = self.link()?;
        let span = self.tracer.start_span(Stage::Execute);
        self.tracer.add_attributes(
            span,
            &[
                ("context_id", context_id.clone()),
                ("executor", executor.name().to_string()),
            ],
        );
        let result = executor
            .execute(
                link,
                Packet::UserText {
                    context_id: context_id.clone(),
                    text: text.to_string(),
                },
            )
            .await;
        self.tracer.end_span(span);

        if let Err(e) = result {
            error!(context_id = %context_id, error = %e, "executor failed to handle turn");
            self.turns.abandon(&context_id);
            self.on_static(context_id, self.error_message()).await?;
        }
        Ok(())
    }

    async fn on_done(self: &Arc<Self>, context_id: String, text: String) -> TalkResult<()> {
        if !self.turns.is_current(&context_id) {
            debug!(context_id = %context_id, "stale done dropped");
            return Ok(());
        }
        self.streamer
            .send(Outbound::Text {
                context_id: context_id.clone(),
                text: text.clone(),
                completed: true,
            })
            .await?;
        self.finish_speaking(&context_id).await;
        let elapsed = self.turns.finish(&context_id);

        let message = Message::new(context_id.clone(), Role::Assistant, text);
        self.state.append_history(message.clone());
        self.persist_message(message);

        if let Some(elapsed) = elapsed {
            let metrics = vec![Metric::time_taken(elapsed)];
            self.persist("message metrics", move |store, a, c| async move {
                store
                    .apply_message_metrics(a, c, &context_id, &metrics)
                    .await
            });
        }
        Ok(())
    }

    /// Side effects run once per context however many sources report the interruption.
    pub(crate) async fn on_interrupt(
        self: &Arc<Self>,
        context_id: &str,
        source: InterruptionSource,
    ) -> TalkResult<()> {
        if !self.turns.mark_interrupted(context_id) {
            debug!(context_id, source = source.as_str(), "interruption already handled");
            return Ok(());
        }
        info!(context_id, source = source.as_str(), "✋ Turn interrupted");
        self.speaker.discard();
        self.recorder.interrupt();
        if source == InterruptionSource::Vad {
            self.turns.abandon(context_id);
        }

        self.streamer
            .send(Outbound::Interruption {
                context_id: context_id.to_string(),
            })
            .await?;

        if source != InterruptionSource::Vad {
            return Ok(());
        }
        if let (Ok(executor), Ok(link)) = (self.executor(), self.link()) {
            let packet = Packet::Interruption {
                context_id: context_id.to_string(),
                source,
            };
            if let Err(e) = executor.execute(link, packet).await {
                warn!(context_id, error = %e, "executor rejected interruption");
            }
        }
        Ok(())
    }

    async fn on_directive(
        self: &Arc<Self>,
        context_id: String,
        directive: Directive,
        args: Options,
    ) -> TalkResult<()> {
        if directive != Directive::EndConversation {
            debug!(context_id = %context_id, directive = directive.as_str(), "forwarding directive");
            return self
                .streamer
                .send(Outbound::Directive {
                    context_id,
                    directive,
                    args,
                })
                .await;
        }

        if self.end_requested.swap(true, Ordering::SeqCst) {
            debug!(context_id = %context_id, "conversation already ending");
            return Ok(());
        }
        let reason = args
            .get_string("reason")
            .unwrap_or_else(|_| "end conversation".to_string());
        info!(context_id = %context_id, %reason, "conversation end requested");
        self.state.set_metadata("talk.end_reason", reason);

        if let Err(e) = self
            .streamer
            .send(Outbound::Directive {
                context_id,
                directive,
                args,
            })
            .await
        {
            warn!(error = %e, "could not tell the transport the conversation ended");
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = session.disconnect().await {
                debug!(error = %e, "scheduled disconnect skipped");
            }
        });
        Ok(())
    }

    pub(crate) async fn on_static(
        self: &Arc<Self>,
        context_id: String,
        text: String,
    ) -> TalkResult<()> {
        self.turns.spoke(&context_id);
        self.streamer
            .send(Outbound::Text {
                context_id: context_id.clone(),
                text: text.clone(),
                completed: true,
            })
            .await?;
        self.speak(&context_id, &text).await;
        self.finish_speaking(&context_id).await;

        if let (Ok(executor), Ok(link)) = (self.executor(), self.link()) {
            if let Err(e) = executor
                .execute(link, Packet::Static { context_id, text })
                .await
            {
                debug!(error = %e, "executor did not take static text");
            }
        }
        Ok(())
    }

    fn on_metrics(&self, context_id: String, metrics: Vec<Metric>) {
        if metrics.is_empty() {
            return;
        }
        self.state.upsert_metrics(metrics.clone());
        let known = self
            .state
            .histories()
            .iter()
            .any(|m| m.id == context_id);
        if known {
            self.persist("message metrics", move |store, a, c| async move {
                store
                    .apply_message_metrics(a, c, &context_id, &metrics)
                    .await
            });
        }
    }

    pub(crate) fn error_message(&self) -> String {
        self.assistant()
            .ok()
            .and_then(|a| a.behavior.error_message.clone())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| {
                let configured = &self.deps.config.behavior.error_message;
                if configured.trim().is_empty() {
                    DEFAULT_ERROR_MESSAGE.to_string()
                } else {
                    configured.clone()
                }
            })
    }
}

async fn run_dispatcher(session: Arc<Session>, mut inbox: mpsc::UnboundedReceiver<Packet>) {
    loop {
        let packet = tokio::select! {
            _ = session.cancel.cancelled() => break,
            packet = inbox.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        let kind = packet.kind();
        if let Err(e) = session.on_packet(packet).await {
            warn!(kind, error = %e, "packet handling failed");
        }
    }
    debug!("packet dispatcher stopped");
}
