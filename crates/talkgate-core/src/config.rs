//! Engine configuration.
//!
//! Layering, lowest to highest priority: built-in defaults, an optional TOML file at
//! `$TALKGATE_CONFIG` (default `config/talkgate`), then `TALKGATE__SECTION__KEY`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_IDLE_MESSAGE: &str = "Are you still there?";
pub const DEFAULT_ERROR_MESSAGE: &str = "Oops! It looks like something went wrong. Let me look into that for you right away. I really appreciate your patience—hang tight while I get this sorted!";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub call_context: CallContextConfig,
    pub behavior: BehaviorDefaults,
    pub speaker: SpeakerConfig,
    pub listener: ListenerConfig,
    pub websocket: WebSocketConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs buffered before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallContextConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CallContextConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl CallContextConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Fallback texts used when an assistant does not configure its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorDefaults {
    pub idle_message: String,
    pub error_message: String,
}

impl Default for BehaviorDefaults {
    fn default() -> Self {
        Self {
            idle_message: DEFAULT_IDLE_MESSAGE.to_string(),
            error_message: DEFAULT_ERROR_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    /// Sentence boundaries applied when the assistant configures none.
    pub default_boundaries: Vec<String>,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            default_boundaries: vec![".".into(), "!".into(), "?".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Silence after the last transcript before the utterance is finalized.
    pub eos_timeout_ms: u64,
    /// WebRTC VAD aggressiveness, 0-3.
    pub vad_mode: u8,
    /// Silence after speech before a `SpeechEnd` activity is emitted.
    pub vad_silence_ms: u64,
    pub vad_min_speech_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            eos_timeout_ms: 1000,
            vad_mode: 2,
            vad_silence_ms: 800,
            vad_min_speech_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub read_poll_ms: u64,
    pub handshake_timeout_secs: u64,
    pub max_message_bytes: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_poll_ms: 100,
            handshake_timeout_secs: 30,
            max_message_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl EngineConfig {
    /// Load from `$TALKGATE_CONFIG` (optional) and the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path =
            std::env::var("TALKGATE_CONFIG").unwrap_or_else(|_| "config/talkgate".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("worker.queue_capacity", 256_i64)?
            .set_default("websocket.read_poll_ms", 100_i64)?
            .set_default("listener.eos_timeout_ms", 1000_i64)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder.add_source(
                config::File::with_name(&path.to_string_lossy()).required(false),
            )
        };

        builder
            .add_source(config::Environment::with_prefix("TALKGATE").separator("__"))
            .build()?
            .try_deserialize()
    }
}
