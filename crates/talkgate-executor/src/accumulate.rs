//! Per-turn delta accumulation.
//!
//! Backends differ in what their terminal message carries: some repeat the whole turn,
//! some send an empty done. The accumulator makes every backend's `Done` carry the full
//! turn text.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use talkgate_core::Packet;

#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    turns: Mutex<HashMap<String, String>>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delta(&self, context_id: &str, text: &str) -> Packet {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(context_id.to_string())
            .or_default()
            .push_str(text);
        Packet::Delta {
            context_id: context_id.to_string(),
            text: text.to_string(),
        }
    }

    /// Close the turn. An empty `text` is replaced by everything streamed so far.
    pub fn done(&self, context_id: &str, text: &str) -> Packet {
        let streamed = self
            .turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(context_id)
            .unwrap_or_default();
        let text = if text.is_empty() { streamed } else { text.to_string() };
        Packet::Done {
            context_id: context_id.to_string(),
            text,
        }
    }

    pub fn streamed(&self, context_id: &str) -> String {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn discard(&self, context_id: &str) {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(context_id);
    }
}
