//! # Talkgate Core
//!
//! Shared vocabulary of the talk session engine: the packet protocol between engine and
//! executor backends, analyzer activities, per-session state, and the collaborator
//! traits (persistence, credentials, transports, tracing, telephony, webhooks) the engine
//! depends on. Also home of the pieces of the speak path that need no I/O: the sentence
//! tokenizer and the synthesizer chain.

pub mod activity;
pub mod assistant;
pub mod audio;
pub mod callcontext;
pub mod config;
pub mod error;
pub mod message;
pub mod options;
pub mod packet;
pub mod session;
pub mod store;
pub mod streamer;
pub mod synthesizer;
pub mod telephony;
pub mod tokenizer;
pub mod tracer;
pub mod transformer;
pub mod webhook;
pub mod worker;

pub use activity::Activity;
pub use assistant::{AssistantDefinition, BehaviorSpec, ExecutorSpec, StreamTls, TransformerSpec};
pub use audio::{AudioConfig, AudioEncoding};
pub use callcontext::{
    CallContext, CallContextStore, CallContextUpdate, CallStatus, InMemoryCallContextStore,
};
pub use config::EngineConfig;
pub use error::{TalkError, TalkResult};
pub use message::{Message, Metric, Role};
pub use options::Options;
pub use packet::{Directive, InterruptionSource, Packet};
pub use session::{Channel, Direction, LifecycleState, SessionIdentity, SessionState};
pub use store::{
    AssistantCatalog, ConversationRecord, ConversationStore, Credential, CredentialStore,
    InMemoryAssistantCatalog, InMemoryConversationStore, InMemoryCredentialStore, Recording,
};
pub use streamer::{AuthType, ConnectRequest, Inbound, Outbound, Principal, Streamer};
pub use synthesizer::{Synthesizer, SynthesizerChain};
pub use telephony::{AudioSocketTelephony, MediaChannel, MediaStreamer, Telephony, TelephonyRegistry};
pub use tokenizer::{Sentence, SentenceTokenizer};
pub use tracer::{RecordingTracer, SpanId, Stage, Tracer};
pub use transformer::{
    NoTransformers, SpeechToText, SynthesizedAudio, TextToSpeech, Transcript, TransformerFactory,
};
pub use webhook::{
    HttpWebhookDispatcher, RetryPolicy, WebhookDispatcher, WebhookEvent, WebhookEventKind,
    WebhookSpec,
};
pub use worker::BackgroundWorker;
