//! Talkgate daemon.
//!
//! By default it runs one talk session against the terminal: every stdin line is a user
//! turn, every frame the engine sends is printed to stdout as one JSON line. With
//! `$TALKGATE_AUDIOSOCKET_ADDR` set it instead answers Asterisk AudioSocket calls on that
//! address. Logs go to stderr.
//!
//! Assistants come from the JSON file at `$TALKGATE_ASSISTANTS` when set; otherwise a
//! built-in assistant backed by the offline echo model is used.

mod audiosocket;
mod console;
mod echo;

use anyhow::Context;
use console::ConsoleStreamer;
use echo::EchoModel;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use talkgate_core::{
    AssistantDefinition, AudioSocketTelephony, AuthType, BehaviorSpec, Channel, ConnectRequest,
    EngineConfig, ExecutorSpec, HttpWebhookDispatcher, InMemoryAssistantCatalog,
    InMemoryCallContextStore, InMemoryConversationStore, InMemoryCredentialStore, Options,
    Principal, RecordingTracer, TelephonyRegistry,
};
use talkgate_executor::ExecutorFactory;
use talkgate_session::{SessionDeps, TalkEngine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_ASSISTANT_ID: u64 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[talkgate-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Arc::new(EngineConfig::load().context("load engine configuration")?);

    let assistants = InMemoryAssistantCatalog::new();
    match std::env::var("TALKGATE_ASSISTANTS") {
        Ok(path) => {
            for assistant in load_assistants(Path::new(&path))? {
                assistants.insert(assistant);
            }
        }
        Err(_) => assistants.insert(echo_assistant()),
    }

    let credentials = Arc::new(InMemoryCredentialStore::new());
    let executors = ExecutorFactory::new(config.websocket.clone()).with_credentials(credentials.clone());
    executors.register_model(Arc::new(EchoModel));
    let webhooks = HttpWebhookDispatcher::new(Duration::from_secs(config.webhook.timeout_secs))
        .context("build webhook client")?;

    let contexts = Arc::new(InMemoryCallContextStore::with_ttl(config.call_context.ttl()));
    let sweeper = contexts.spawn_sweeper(Duration::from_secs(
        config.call_context.sweep_interval_secs.max(1),
    ));
    let telephony = Arc::new(TelephonyRegistry::new(contexts));
    telephony.register(Arc::new(AudioSocketTelephony));

    let deps = SessionDeps::new(
        Arc::clone(&config),
        Arc::new(assistants),
        Arc::new(InMemoryConversationStore::new()),
        credentials,
        Arc::new(webhooks),
        Arc::new(executors),
    )
    .with_telephony(telephony);

    let assistant_id = std::env::var("TALKGATE_ASSISTANT_ID")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_ASSISTANT_ID);
    let api_key = std::env::var("TALKGATE_API_KEY").unwrap_or_else(|_| "local-console".into());

    if let Ok(addr) = std::env::var("TALKGATE_AUDIOSOCKET_ADDR") {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind AudioSocket listener on {addr}"))?;
        tokio::select! {
            result = audiosocket::serve(listener, deps, assistant_id, api_key) => result?,
            _ = tokio::signal::ctrl_c() => tracing::info!("CTRL-C received; no longer answering calls"),
        }
        sweeper.abort();
        return Ok(());
    }

    let mut request = ConnectRequest::new(assistant_id, Channel::Sdk);
    if let Ok(name) = std::env::var("USER") {
        request.args = Options::new().with("name", name);
    }
    let principal = Principal {
        token: api_key,
        auth_type: AuthType::ApiKey,
    };

    let engine = TalkEngine::new(
        deps,
        Arc::new(ConsoleStreamer::new(request)),
        Arc::new(RecordingTracer::new()),
    );
    tracing::info!(assistant_id, "Talkgate console session starting (type /quit to hang up)");

    tokio::select! {
        result = engine.talk(&principal) => result.context("talk session failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; closing session");
            if let Err(e) = engine.disconnect().await {
                tracing::warn!(error = %e, "session did not close cleanly");
            }
        }
    }
    sweeper.abort();
    Ok(())
}

fn load_assistants(path: &Path) -> anyhow::Result<Vec<AssistantDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read assistants from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse assistants in {}", path.display()))
}

fn echo_assistant() -> AssistantDefinition {
    AssistantDefinition {
        id: DEFAULT_ASSISTANT_ID,
        name: "echo".into(),
        provider_model_id: 0,
        executor: ExecutorSpec::Model {
            provider: "echo".into(),
            model: "echo".into(),
            credential_id: 0,
            options: Options::new(),
        },
        greeting: Some("Hello {{name}}! Say something and I will repeat it.".into()),
        behavior: BehaviorSpec {
            idle_timeout_secs: 30,
            ..BehaviorSpec::default()
        },
        listener: None,
        speaker: None,
        options: Options::new(),
        webhooks: Vec::new(),
    }
}
