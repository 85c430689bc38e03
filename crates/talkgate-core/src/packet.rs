//! Packets exchanged between the session engine and executor backends.
//!
//! Every turn is correlated by a `context_id`. Within one context a backend emits any
//! number of [`Packet::Delta`] followed by exactly one [`Packet::Done`] whose text is the
//! whole turn, not just the last fragment.

use crate::message::Metric;
use crate::options::Options;
use serde::{Deserialize, Serialize};

/// Who raised an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionSource {
    /// Voice activity detected while the assistant was speaking.
    Vad,
    /// A finalized user utterance arrived.
    Word,
}

impl InterruptionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptionSource::Vad => "vad",
            InterruptionSource::Word => "word",
        }
    }
}

/// Control directives a backend (or the engine itself) can raise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Directive {
    EndConversation,
    TransferConversation,
    Other(String),
}

impl Directive {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "end_conversation" | "disconnect" | "hangup" => Directive::EndConversation,
            "transfer_conversation" | "transfer" => Directive::TransferConversation,
            other => Directive::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Directive::EndConversation => "END_CONVERSATION",
            Directive::TransferConversation => "TRANSFER_CONVERSATION",
            Directive::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    UserText {
        context_id: String,
        text: String,
    },
    /// Streamed fragment of an assistant response.
    Delta {
        context_id: String,
        text: String,
    },
    /// Terminal packet of an assistant response; `text` is the full turn text.
    Done {
        context_id: String,
        text: String,
    },
    Interruption {
        context_id: String,
        source: InterruptionSource,
    },
    Directive {
        context_id: String,
        directive: Directive,
        #[serde(default)]
        args: Options,
    },
    /// Fixed text spoken as-is (greeting, idle prompt, error message).
    Static {
        context_id: String,
        text: String,
    },
    Metric {
        context_id: String,
        metrics: Vec<Metric>,
    },
    Transcript {
        context_id: String,
        text: String,
        confidence: f32,
        language: Option<String>,
        completed: bool,
    },
    /// A finalized utterance handed over by an end-of-speech analyzer.
    EndOfSpeech {
        context_id: String,
        speech: String,
    },
}

impl Packet {
    pub fn context_id(&self) -> &str {
        match self {
            Packet::UserText { context_id, .. }
            | Packet::Delta { context_id, .. }
            | Packet::Done { context_id, .. }
            | Packet::Interruption { context_id, .. }
            | Packet::Directive { context_id, .. }
            | Packet::Static { context_id, .. }
            | Packet::Metric { context_id, .. }
            | Packet::Transcript { context_id, .. }
            | Packet::EndOfSpeech { context_id, .. } => context_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Packet::UserText { .. } => "user_text",
            Packet::Delta { .. } => "delta",
            Packet::Done { .. } => "done",
            Packet::Interruption { .. } => "interruption",
            Packet::Directive { .. } => "directive",
            Packet::Static { .. } => "static",
            Packet::Metric { .. } => "metric",
            Packet::Transcript { .. } => "transcript",
            Packet::EndOfSpeech { .. } => "end_of_speech",
        }
    }

    pub fn end_conversation(context_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Packet::Directive {
            context_id: context_id.into(),
            directive: Directive::EndConversation,
            args: Options::new().with("reason", reason.into()),
        }
    }

    pub fn is_end_conversation(&self) -> bool {
        matches!(
            self,
            Packet::Directive {
                directive: Directive::EndConversation,
                ..
            }
        )
    }
}
