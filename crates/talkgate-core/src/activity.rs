//! Analyzer output consumed by the interruption and turn-taking logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an utterance analyzer observed.
///
/// `start_at`/`end_at` are seconds since the analyzer started receiving audio, so an
/// early `SpeechStart` (before one second of audio) can be told apart from real barge-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activity {
    SpeechStart {
        energy: f32,
        confidence: f32,
        start_at: f64,
    },
    SpeechEnd {
        start_at: f64,
        end_at: f64,
        transcript: String,
    },
    System {
        time: DateTime<Utc>,
    },
}

impl Activity {
    pub fn system_now() -> Self {
        Activity::System { time: Utc::now() }
    }
}
