//! Session identity and mutable per-session state.
//!
//! Write ownership of [`SessionState`]:
//! - `histories`: appended only by the engine's packet dispatcher (user and assistant turns)
//!   and the greeting behavior, always in order.
//! - `metrics`: upserted by name from disconnect, the packet dispatcher, and backend metric
//!   packets. Repeated writes of one name overwrite.
//! - `metadata`: upserted by key from connect and lifecycle hooks.
//! - `args` / `options`: replaced wholesale during connect/resume, read afterwards.
//!
//! Each group has its own lock so concurrent lifecycle sub-steps never contend on an
//! unrelated field.

use crate::message::{Message, Metric};
use crate::options::Options;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Phone,
    Web,
    Sdk,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Phone => "phone",
            Channel::Web => "web",
            Channel::Sdk => "sdk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle of one talk session: `Idle → Connecting → Active → Disconnecting → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Active,
    Disconnecting,
    Closed,
}

impl LifecycleState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Active)
                | (Connecting, Idle)
                | (Connecting, Disconnecting)
                | (Active, Disconnecting)
                | (Disconnecting, Closed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub conversation_id: u64,
    pub assistant_id: u64,
    pub provider_model_id: u64,
    pub channel: Channel,
    pub direction: Direction,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionState {
    histories: RwLock<Vec<Message>>,
    metrics: DashMap<String, Metric>,
    metadata: DashMap<String, Value>,
    args: DashMap<String, Value>,
    options: DashMap<String, Value>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_history(&self, message: Message) {
        self.histories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    pub fn histories(&self) -> Vec<Message> {
        self.histories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn history_len(&self) -> usize {
        self.histories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn upsert_metrics(&self, metrics: impl IntoIterator<Item = Metric>) {
        for m in metrics {
            self.metrics.insert(m.name.clone(), m);
        }
    }

    pub fn metric(&self, name: &str) -> Option<Metric> {
        self.metrics.get(name).map(|m| m.value().clone())
    }

    /// All metrics, ordered by name.
    pub fn metrics(&self) -> Vec<Metric> {
        let mut out: Vec<Metric> = self.metrics.iter().map(|m| m.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self) -> Options {
        collect(&self.metadata)
    }

    pub fn replace_args(&self, args: &Options) {
        replace(&self.args, args);
    }

    pub fn args(&self) -> Options {
        collect(&self.args)
    }

    pub fn replace_options(&self, options: &Options) {
        replace(&self.options, options);
    }

    pub fn options(&self) -> Options {
        collect(&self.options)
    }

    pub fn replace_metadata(&self, metadata: &Options) {
        replace(&self.metadata, metadata);
    }
}

fn collect(map: &DashMap<String, Value>) -> Options {
    map.iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect()
}

fn replace(map: &DashMap<String, Value>, with: &Options) {
    map.clear();
    for (k, v) in with.iter() {
        map.insert(k.clone(), v.clone());
    }
}
