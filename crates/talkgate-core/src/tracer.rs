//! Per-conversation stage tracing, exported once at disconnect.

use crate::error::TalkResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connect,
    Listen,
    Speak,
    Execute,
    Notify,
    Disconnect,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::Listen => "listen",
            Stage::Speak => "speak",
            Stage::Execute => "execute",
            Stage::Notify => "notify",
            Stage::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub stage: Stage,
    pub attributes: Vec<(String, String)>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Tracer: Send + Sync {
    fn start_span(&self, stage: Stage) -> SpanId;

    fn add_attributes(&self, span: SpanId, attributes: &[(&str, String)]);

    fn end_span(&self, span: SpanId);

    /// Ship every finished span. Spans are handed off once; a second export only sees
    /// spans finished after the first.
    async fn export(&self) -> TalkResult<usize>;
}

/// Keeps spans in memory and exports them as structured `tracing` events.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    next: AtomicU64,
    open: DashMap<u64, SpanRecord>,
    finished: Mutex<Vec<SpanRecord>>,
    exported: Mutex<Vec<SpanRecord>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spans shipped by previous exports.
    pub fn exported(&self) -> Vec<SpanRecord> {
        self.exported
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Tracer for RecordingTracer {
    fn start_span(&self, stage: Stage) -> SpanId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.open.insert(
            id,
            SpanRecord {
                stage,
                attributes: Vec::new(),
                started_at: Utc::now(),
                ended_at: None,
            },
        );
        SpanId(id)
    }

    fn add_attributes(&self, span: SpanId, attributes: &[(&str, String)]) {
        if let Some(mut record) = self.open.get_mut(&span.0) {
            record
                .attributes
                .extend(attributes.iter().map(|(k, v)| (k.to_string(), v.clone())));
        }
    }

    fn end_span(&self, span: SpanId) {
        if let Some((_, mut record)) = self.open.remove(&span.0) {
            record.ended_at = Some(Utc::now());
            self.finished
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(record);
        } else {
            debug!(span = span.0, "end_span on unknown or finished span");
        }
    }

    async fn export(&self) -> TalkResult<usize> {
        let batch: Vec<SpanRecord> = std::mem::take(
            &mut *self
                .finished
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for span in &batch {
            let elapsed_ms = span
                .ended_at
                .map(|end| (end - span.started_at).num_milliseconds())
                .unwrap_or_default();
            info!(
                target: "talkgate::trace",
                stage = span.stage.as_str(),
                elapsed_ms,
                attributes = ?span.attributes,
                "span"
            );
        }
        let count = batch.len();
        self.exported
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(batch);
        Ok(count)
    }
}
