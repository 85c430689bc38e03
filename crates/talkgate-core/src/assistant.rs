//! Assistant definitions resolved at connect time.

use crate::options::Options;
use crate::webhook::WebhookSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantDefinition {
    pub id: u64,
    pub name: String,
    pub provider_model_id: u64,
    pub executor: ExecutorSpec,
    /// Template spoken when a new conversation starts. `{{key}}` is replaced by the
    /// session argument of the same name.
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub behavior: BehaviorSpec,
    /// Speech-to-text provider; absent for text-only assistants.
    #[serde(default)]
    pub listener: Option<TransformerSpec>,
    /// Text-to-speech provider; absent for text-only assistants.
    #[serde(default)]
    pub speaker: Option<TransformerSpec>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub webhooks: Vec<WebhookSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerSpec {
    pub provider: String,
    pub credential_id: u64,
    #[serde(default)]
    pub options: Options,
}

/// Which executor backend serves the assistant, and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorSpec {
    /// Bidirectional gRPC stream.
    Stream {
        endpoint: String,
        #[serde(default)]
        tls: StreamTls,
    },
    /// JSON over WebSocket.
    WebSocket {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Local model call.
    Model {
        provider: String,
        model: String,
        #[serde(default)]
        credential_id: u64,
        #[serde(default)]
        options: Options,
    },
}

impl ExecutorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorSpec::Stream { .. } => "stream",
            ExecutorSpec::WebSocket { .. } => "websocket",
            ExecutorSpec::Model { .. } => "model",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StreamTls {
    /// Plaintext HTTP/2, for local development only.
    #[default]
    Insecure,
    Tls {
        #[serde(default)]
        ca_cert: Option<PathBuf>,
        #[serde(default)]
        client_cert: Option<PathBuf>,
        #[serde(default)]
        client_key: Option<PathBuf>,
        #[serde(default)]
        domain: Option<String>,
    },
}

/// Conversational behaviors layered on top of the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSpec {
    /// Seconds without user input before the idle message is spoken. `0` disables.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Consecutive idle timeouts tolerated before the conversation is ended.
    #[serde(default = "default_idle_backoff")]
    pub idle_timeout_backoff: u32,
    #[serde(default)]
    pub idle_message: Option<String>,
    /// Hard cap on conversation length in seconds. `0` disables.
    #[serde(default)]
    pub max_session_duration_secs: u64,
    /// Spoken when the executor fails to handle a turn.
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_idle_backoff() -> u32 {
    2
}

impl Default for BehaviorSpec {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 0,
            idle_timeout_backoff: default_idle_backoff(),
            idle_message: None,
            max_session_duration_secs: 0,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_spec_deserializes_from_tagged_json() {
        let spec: ExecutorSpec = serde_json::from_value(serde_json::json!({
            "kind": "stream",
            "endpoint": "http://127.0.0.1:50051",
        }))
        .unwrap();
        assert_eq!(spec.kind(), "stream");
        assert!(matches!(
            spec,
            ExecutorSpec::Stream {
                tls: StreamTls::Insecure,
                ..
            }
        ));
    }

    #[test]
    fn behavior_defaults_keep_backoff() {
        let b: BehaviorSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(b.idle_timeout_backoff, 2);
        assert_eq!(b.idle_timeout_secs, 0);
    }
}
