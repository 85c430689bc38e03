//! Conversational behaviors layered over the executor: greeting, idle prompts, the
//! session duration cap, and conversation webhooks.

use crate::engine::{new_context_id, Session};
use std::sync::Arc;
use std::time::Duration;
use talkgate_core::config::DEFAULT_IDLE_MESSAGE;
use talkgate_core::{Message, Options, Packet, Role, Stage, WebhookEvent, WebhookEventKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Replace every `{{key}}` with the argument of that name. Unknown placeholders stay as
/// written.
pub(crate) fn render_template(template: &str, args: &Options) -> String {
    let mut out = template.to_string();
    for (key, value) in args.iter() {
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{{{key}}}}}"), &replacement);
    }
    out
}

impl Session {
    /// Speak the assistant's greeting on a new conversation.
    pub(crate) fn greet(&self) {
        let Ok(assistant) = self.assistant() else {
            return;
        };
        let Some(template) = assistant.greeting.as_deref() else {
            return;
        };
        let text = render_template(template, &self.state.args());
        if text.trim().is_empty() {
            return;
        }
        let context_id = new_context_id();
        let message = Message::new(context_id.clone(), Role::Assistant, text.clone());
        self.state.append_history(message.clone());
        self.persist_message(message);
        debug!(context_id = %context_id, "greeting queued");
        self.enqueue(Packet::Static { context_id, text });
    }

    /// Fire `kind` at every webhook subscribed to it.
    pub(crate) fn notify(&self, kind: WebhookEventKind) {
        let (Ok(assistant), Ok(identity)) = (self.assistant(), self.identity()) else {
            return;
        };
        let subscribed: Vec<_> = assistant
            .webhooks
            .iter()
            .filter(|w| w.events.contains(&kind))
            .cloned()
            .collect();
        if subscribed.is_empty() {
            return;
        }

        let span = self.tracer.start_span(Stage::Notify);
        self.tracer.add_attributes(
            span,
            &[
                ("event", format!("{kind:?}")),
                ("webhooks", subscribed.len().to_string()),
            ],
        );
        let event = WebhookEvent {
            kind,
            assistant_id: identity.assistant_id,
            conversation_id: identity.conversation_id,
            metrics: self.state.metrics(),
            messages: self.state.histories(),
        };
        for webhook in subscribed {
            let dispatcher = Arc::clone(&self.deps.webhooks);
            let event = event.clone();
            self.worker.submit("webhook", async move {
                dispatcher.dispatch(&webhook, &event).await
            });
        }
        self.tracer.end_span(span);
    }

    /// Arm the idle and duration timers configured for the assistant.
    pub(crate) fn start_behaviors(self: &Arc<Self>) {
        let Ok(assistant) = self.assistant() else {
            return;
        };
        let behavior = &assistant.behavior;

        if behavior.idle_timeout_secs > 0 {
            let message = behavior
                .idle_message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.idle_message_default());
            tokio::spawn(watch_idle(
                Arc::clone(self),
                Duration::from_secs(behavior.idle_timeout_secs),
                behavior.idle_timeout_backoff.max(1),
                message,
                self.behaviors.clone(),
            ));
        }

        if behavior.max_session_duration_secs > 0 {
            tokio::spawn(cap_duration(
                Arc::clone(self),
                Duration::from_secs(behavior.max_session_duration_secs),
                self.behaviors.clone(),
            ));
        }
    }

    fn idle_message_default(&self) -> String {
        let configured = &self.deps.config.behavior.idle_message;
        if configured.trim().is_empty() {
            DEFAULT_IDLE_MESSAGE.to_string()
        } else {
            configured.clone()
        }
    }
}

async fn watch_idle(
    session: Arc<Session>,
    timeout: Duration,
    backoff: u32,
    message: String,
    cancel: CancellationToken,
) {
    session.idle.touch();
    loop {
        let deadline = session.idle.deadline(timeout);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        if session.idle.deadline(timeout) > tokio::time::Instant::now() {
            // the user spoke while we slept
            continue;
        }
        let strikes = session.idle.strike();
        if strikes >= backoff {
            info!(strikes, "⏳ User idle, ending conversation");
            session.enqueue(Packet::end_conversation(new_context_id(), "idle timeout"));
            return;
        }
        debug!(strikes, "user idle, prompting");
        session.enqueue(Packet::Static {
            context_id: new_context_id(),
            text: message.clone(),
        });
        session.idle.rearm();
    }
}

async fn cap_duration(session: Arc<Session>, limit: Duration, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(limit) => {
            info!(limit_secs = limit.as_secs(), "⏳ Session reached its maximum duration");
            session.enqueue(Packet::end_conversation(
                new_context_id(),
                "max session duration reached",
            ));
        }
    }
}
