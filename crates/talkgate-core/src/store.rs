//! Persistence collaborators: conversations, assistants, credentials.
//!
//! The engine only depends on the traits. The in-memory implementations back the daemon
//! and the test suites.

use crate::assistant::AssistantDefinition;
use crate::error::{TalkError, TalkResult};
use crate::message::{Message, Metric};
use crate::options::Options;
use crate::session::SessionIdentity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Persisted view of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: u64,
    pub assistant_id: u64,
    pub args: Options,
    pub metadata: Options,
    pub options: Options,
    pub metrics: Vec<Metric>,
    pub messages: Vec<Message>,
    pub recordings: Vec<Recording>,
}

/// Everything captured for a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub transcript: Vec<Message>,
    pub user_audio: Vec<u8>,
    pub assistant_audio: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Conversation persistence. Every `apply_*` call is an idempotent upsert keyed by
/// natural key (metric name, metadata key), so repeated calls overwrite.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, identity: &SessionIdentity) -> TalkResult<u64>;

    async fn get_conversation(
        &self,
        assistant_id: u64,
        conversation_id: u64,
    ) -> TalkResult<ConversationRecord>;

    async fn apply_conversation_metadata(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        metadata: &Options,
    ) -> TalkResult<()>;

    async fn apply_conversation_arguments(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        args: &Options,
    ) -> TalkResult<()>;

    async fn apply_conversation_options(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        options: &Options,
    ) -> TalkResult<()>;

    async fn apply_conversation_metrics(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        metrics: &[Metric],
    ) -> TalkResult<()>;

    async fn create_conversation_message(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        message: &Message,
    ) -> TalkResult<()>;

    async fn update_conversation_message(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        message: &Message,
    ) -> TalkResult<()>;

    async fn apply_message_metadata(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        message_id: &str,
        metadata: &Options,
    ) -> TalkResult<()>;

    async fn apply_message_metrics(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        message_id: &str,
        metrics: &[Metric],
    ) -> TalkResult<()>;

    async fn create_conversation_recording(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        recording: &Recording,
    ) -> TalkResult<()>;
}

#[async_trait]
pub trait AssistantCatalog: Send + Sync {
    async fn get_assistant(&self, assistant_id: u64) -> TalkResult<AssistantDefinition>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: u64,
    pub provider: String,
    pub value: Options,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_credential(&self, credential_id: u64) -> TalkResult<Credential>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct InMemoryConversationStore {
    next_id: AtomicU64,
    conversations: DashMap<(u64, u64), ConversationRecord>,
    message_metrics: DashMap<(u64, String), Vec<Metric>>,
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            conversations: DashMap::new(),
            message_metrics: DashMap::new(),
        }
    }
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics recorded against one message.
    pub fn message_metrics(&self, conversation_id: u64, message_id: &str) -> Vec<Metric> {
        self.message_metrics
            .get(&(conversation_id, message_id.to_string()))
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    fn with_record<T>(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        f: impl FnOnce(&mut ConversationRecord) -> T,
    ) -> TalkResult<T> {
        let mut entry = self
            .conversations
            .get_mut(&(assistant_id, conversation_id))
            .ok_or_else(|| {
                TalkError::NotFound(format!(
                    "conversation {conversation_id} of assistant {assistant_id}"
                ))
            })?;
        Ok(f(entry.value_mut()))
    }
}

fn upsert_options(target: &mut Options, with: &Options) {
    *target = target.merged(with);
}

fn upsert_metrics(target: &mut Vec<Metric>, with: &[Metric]) {
    for m in with {
        match target.iter_mut().find(|existing| existing.name == m.name) {
            Some(existing) => *existing = m.clone(),
            None => target.push(m.clone()),
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self, identity: &SessionIdentity) -> TalkResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.conversations.insert(
            (identity.assistant_id, id),
            ConversationRecord {
                id,
                assistant_id: identity.assistant_id,
                ..Default::default()
            },
        );
        Ok(id)
    }

    async fn get_conversation(
        &self,
        assistant_id: u64,
        conversation_id: u64,
    ) -> TalkResult<ConversationRecord> {
        self.with_record(assistant_id, conversation_id, |r| r.clone())
    }

    async fn apply_conversation_metadata(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        metadata: &Options,
    ) -> TalkResult<()> {
        self.with_record(assistant_id, conversation_id, |r| {
            upsert_options(&mut r.metadata, metadata)
        })
    }

    async fn apply_conversation_arguments(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        args: &Options,
    ) -> TalkResult<()> {
        self.with_record(assistant_id, conversation_id, |r| upsert_options(&mut r.args, args))
    }

    async fn apply_conversation_options(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        options: &Options,
    ) -> TalkResult<()> {
        self.with_record(assistant_id, conversation_id, |r| {
            upsert_options(&mut r.options, options)
        })
    }

    async fn apply_conversation_metrics(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        metrics: &[Metric],
    ) -> TalkResult<()> {
        self.with_record(assistant_id, conversation_id, |r| {
            upsert_metrics(&mut r.metrics, metrics)
        })
    }

    async fn create_conversation_message(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        message: &Message,
    ) -> TalkResult<()> {
        self.with_record(assistant_id, conversation_id, |r| {
            r.messages.push(message.clone())
        })
    }

    async fn update_conversation_message(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        message: &Message,
    ) -> TalkResult<()> {
        self.with_record(assistant_id, conversation_id, |r| {
            match r.messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => r.messages.push(message.clone()),
            }
        })
    }

    async fn apply_message_metadata(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        message_id: &str,
        metadata: &Options,
    ) -> TalkResult<()> {
        self.with_record(assistant_id, conversation_id, |r| {
            if let Some(m) = r.messages.iter_mut().find(|m| m.id == message_id) {
                m.meta = m.meta.merged(metadata);
            }
        })
    }

    async fn apply_message_metrics(
        &self,
        _assistant_id: u64,
        conversation_id: u64,
        message_id: &str,
        metrics: &[Metric],
    ) -> TalkResult<()> {
        let mut entry = self
            .message_metrics
            .entry((conversation_id, message_id.to_string()))
            .or_default();
        upsert_metrics(entry.value_mut(), metrics);
        Ok(())
    }

    async fn create_conversation_recording(
        &self,
        assistant_id: u64,
        conversation_id: u64,
        recording: &Recording,
    ) -> TalkResult<()> {
        self.with_record(assistant_id, conversation_id, |r| {
            r.recordings.push(recording.clone())
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAssistantCatalog {
    assistants: DashMap<u64, AssistantDefinition>,
}

impl InMemoryAssistantCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, assistant: AssistantDefinition) {
        self.assistants.insert(assistant.id, assistant);
    }
}

#[async_trait]
impl AssistantCatalog for InMemoryAssistantCatalog {
    async fn get_assistant(&self, assistant_id: u64) -> TalkResult<AssistantDefinition> {
        self.assistants
            .get(&assistant_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| TalkError::NotFound(format!("assistant {assistant_id}")))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    credentials: DashMap<u64, Credential>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: Credential) {
        self.credentials.insert(credential.id, credential);
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_credential(&self, credential_id: u64) -> TalkResult<Credential> {
        self.credentials
            .get(&credential_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| TalkError::Credential(format!("credential {credential_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Channel, Direction};

    fn identity() -> SessionIdentity {
        SessionIdentity {
            conversation_id: 0,
            assistant_id: 7,
            provider_model_id: 1,
            channel: Channel::Web,
            direction: Direction::Inbound,
            start_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn metrics_are_upserted_not_duplicated() {
        let store = InMemoryConversationStore::new();
        let id = store.create_conversation(&identity()).await.unwrap();
        store
            .apply_conversation_metrics(7, id, &[Metric::status("IN_PROGRESS")])
            .await
            .unwrap();
        store
            .apply_conversation_metrics(7, id, &[Metric::status("COMPLETE")])
            .await
            .unwrap();
        let record = store.get_conversation(7, id).await.unwrap();
        assert_eq!(record.metrics.len(), 1);
        assert_eq!(record.metrics[0].value, "COMPLETE");
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let store = InMemoryConversationStore::new();
        let err = store.get_conversation(1, 99).await.unwrap_err();
        assert!(matches!(err, TalkError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_credential_is_a_credential_error() {
        let store = InMemoryCredentialStore::new();
        assert!(matches!(
            store.get_credential(3).await,
            Err(TalkError::Credential(_))
        ));
    }
}
