//! Transport-facing surface: what a channel delivers to the engine and what the engine
//! sends back.

use crate::audio::AudioConfig;
use crate::error::{TalkError, TalkResult};
use crate::options::Options;
use crate::packet::Directive;
use crate::session::{Channel, Direction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Bearer,
}

/// Authenticated caller. Produced by the transport before the engine is involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub token: String,
    pub auth_type: AuthType,
}

impl Principal {
    pub fn validate(&self) -> TalkResult<()> {
        if self.token.trim().is_empty() {
            return Err(TalkError::Unauthenticated("empty auth token".into()));
        }
        Ok(())
    }
}

/// Session configuration sent by the client when it attaches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub assistant_id: u64,
    /// Present when resuming an existing conversation.
    #[serde(default)]
    pub conversation_id: Option<u64>,
    pub channel: Channel,
    pub direction: Direction,
    #[serde(default)]
    pub args: Options,
    #[serde(default)]
    pub metadata: Options,
    #[serde(default)]
    pub options: Options,
}

impl ConnectRequest {
    pub fn new(assistant_id: u64, channel: Channel) -> Self {
        Self {
            assistant_id,
            conversation_id: None,
            channel,
            direction: Direction::Inbound,
            args: Options::new(),
            metadata: Options::new(),
            options: Options::new(),
        }
    }

    /// Reject customization the engine cannot persist: empty keys and keys that collide
    /// with engine-owned metadata.
    pub fn validate(&self) -> TalkResult<()> {
        if self.assistant_id == 0 {
            return Err(TalkError::Validation("assistant id is required".into()));
        }
        for (group, opts) in [("args", &self.args), ("metadata", &self.metadata), ("options", &self.options)] {
            for (key, _) in opts.iter() {
                if key.trim().is_empty() {
                    return Err(TalkError::Validation(format!("empty key in {group}")));
                }
            }
        }
        for (key, _) in self.metadata.iter() {
            if key.starts_with("talk.") {
                return Err(TalkError::Validation(format!(
                    "metadata key {key} is reserved"
                )));
            }
        }
        Ok(())
    }
}

/// Frames a transport delivers to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Configuration(ConnectRequest),
    Text(String),
    Audio(Vec<u8>),
}

/// Frames the engine sends to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Text {
        context_id: String,
        text: String,
        completed: bool,
    },
    /// Echo of the user's own transcript.
    UserTranscript {
        text: String,
        completed: bool,
    },
    Audio {
        context_id: String,
        data: Vec<u8>,
        completed: bool,
    },
    Interruption {
        context_id: String,
    },
    Directive {
        context_id: String,
        directive: Directive,
        args: Options,
    },
    Error {
        message: String,
    },
}

/// One implementation per channel (gRPC bidi, WebSocket, AudioSocket, SIP/RTP).
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Next inbound frame; `Ok(None)` once the client hung up.
    async fn recv(&self) -> TalkResult<Option<Inbound>>;

    async fn send(&self, frame: Outbound) -> TalkResult<()>;

    /// Negotiated audio format; `None` for text-only channels.
    fn config(&self) -> Option<AudioConfig>;
}
