//! Call contexts: the record that lets a telephony call be resumed across connection
//! and process boundaries.
//!
//! A context is saved when a call is initiated, read (often several times, once per
//! status callback) when the media stream attaches, and removed when the call ends.
//! Entries expire after a TTL so abandoned calls do not accumulate.

use crate::error::{TalkError, TalkResult};
use crate::session::Direction;
use crate::streamer::AuthType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_CALL_CONTEXT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Queued,
    Ringing,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallContext {
    /// Assigned by [`CallContextStore::save`].
    #[serde(default)]
    pub context_id: String,
    pub assistant_id: u64,
    pub conversation_id: u64,
    pub auth_token: String,
    pub auth_type: AuthType,
    pub direction: Direction,
    pub from_number: String,
    pub to_number: String,
    pub provider: String,
    pub status: CallStatus,
    #[serde(default)]
    pub provider_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single-field change applied by status callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum CallContextUpdate {
    Status(CallStatus),
    ConversationId(u64),
    ProviderCallId(String),
}

#[async_trait]
pub trait CallContextStore: Send + Sync {
    /// Store `ctx` under a freshly generated id and return that id.
    async fn save(&self, ctx: CallContext) -> TalkResult<String>;

    async fn get(&self, context_id: &str) -> TalkResult<CallContext>;

    /// Read and remove in one step; a second caller sees `NotFound`.
    async fn get_and_delete(&self, context_id: &str) -> TalkResult<CallContext>;

    async fn delete(&self, context_id: &str) -> TalkResult<()>;

    async fn update(&self, context_id: &str, update: CallContextUpdate) -> TalkResult<CallContext>;
}

#[derive(Debug)]
struct Entry {
    ctx: CallContext,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct InMemoryCallContextStore {
    ttl: Duration,
    entries: DashMap<String, Entry>,
}

impl Default for InMemoryCallContextStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_CALL_CONTEXT_TTL)
    }
}

impl InMemoryCallContextStore {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    /// Periodically purge expired entries until the returned handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "expired call contexts purged");
                }
            }
        })
    }

    fn not_found(context_id: &str) -> TalkError {
        TalkError::NotFound(format!("call context {context_id}"))
    }
}

#[async_trait]
impl CallContextStore for InMemoryCallContextStore {
    async fn save(&self, mut ctx: CallContext) -> TalkResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        ctx.context_id = id.clone();
        self.entries.insert(
            id.clone(),
            Entry {
                ctx,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(id)
    }

    async fn get(&self, context_id: &str) -> TalkResult<CallContext> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(context_id) {
            if entry.expires_at > now {
                return Ok(entry.ctx.clone());
            }
        }
        self.entries.remove_if(context_id, |_, e| e.expires_at <= now);
        Err(Self::not_found(context_id))
    }

    async fn get_and_delete(&self, context_id: &str) -> TalkResult<CallContext> {
        match self.entries.remove(context_id) {
            Some((_, entry)) if entry.expires_at > Instant::now() => Ok(entry.ctx),
            _ => Err(Self::not_found(context_id)),
        }
    }

    async fn delete(&self, context_id: &str) -> TalkResult<()> {
        self.entries.remove(context_id);
        Ok(())
    }

    async fn update(&self, context_id: &str, update: CallContextUpdate) -> TalkResult<CallContext> {
        let mut entry = self
            .entries
            .get_mut(context_id)
            .filter(|e| e.expires_at > Instant::now())
            .ok_or_else(|| Self::not_found(context_id))?;
        match update {
            CallContextUpdate::Status(status) => entry.ctx.status = status,
            CallContextUpdate::ConversationId(id) => entry.ctx.conversation_id = id,
            CallContextUpdate::ProviderCallId(id) => entry.ctx.provider_call_id = Some(id),
        }
        Ok(entry.ctx.clone())
    }
}
