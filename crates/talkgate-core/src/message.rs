//! Conversation history entries and metrics.

use crate::options::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const METRIC_TIME_TAKEN: &str = "TIME_TAKEN";
pub const METRIC_STATUS: &str = "STATUS";

pub const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
pub const STATUS_COMPLETE: &str = "COMPLETE";
pub const STATUS_FAILED: &str = "FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One history entry. Histories are append-only and chronological.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The turn's context id doubles as the message id.
    pub id: String,
    pub role: Role,
    pub contents: String,
    #[serde(default)]
    pub meta: Options,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, contents: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            contents: contents.into(),
            meta: Options::new(),
            created_at: Utc::now(),
        }
    }
}

/// A named measurement. The name is the natural key: writing the same name twice
/// overwrites rather than duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub description: String,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            description: description.into(),
        }
    }

    /// Elapsed time in nanoseconds.
    pub fn time_taken(elapsed: std::time::Duration) -> Self {
        Self::new(
            METRIC_TIME_TAKEN,
            elapsed.as_nanos().to_string(),
            "Time taken to serve the request",
        )
    }

    pub fn status(status: &str) -> Self {
        Self::new(METRIC_STATUS, status, "Status of the conversation")
    }
}
