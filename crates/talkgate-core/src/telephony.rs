//! Telephony capability: one small implementation per provider behind one trait.
//!
//! Provider glue reduces to four operations: place a call, accept an inbound call,
//! interpret a status callback, and turn an attached media connection into a
//! [`Streamer`]. Media sockets are pumped into a [`MediaChannel`] by the transport layer,
//! so providers only deal with framing.

use crate::audio::AudioConfig;
use crate::callcontext::{CallContext, CallContextStore, CallContextUpdate, CallStatus};
use crate::error::{TalkError, TalkResult};
use crate::options::Options;
use crate::session::{Channel, Direction};
use crate::store::Credential;
use crate::streamer::{AuthType, ConnectRequest, Inbound, Outbound, Streamer};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Raw media bytes in both directions for one attached call.
pub struct MediaChannel {
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub outbound: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
pub trait Telephony: Send + Sync {
    fn provider(&self) -> &str;

    /// Place an outbound call for `ctx`; returns the provider's call id.
    async fn create_call(&self, ctx: &CallContext, credential: &Credential) -> TalkResult<String>;

    /// Build a call context from a provider's inbound-call request.
    async fn receive_call(&self, request: &Options) -> TalkResult<CallContext>;

    /// Interpret a provider status callback for `ctx`.
    async fn callback(&self, ctx: &CallContext, payload: &Options) -> TalkResult<CallStatus>;

    /// Wrap an attached media connection.
    fn streamer(&self, ctx: &CallContext, media: MediaChannel) -> TalkResult<Arc<dyn Streamer>>;
}

/// Providers by name, plus the call-context plumbing shared by all of them.
pub struct TelephonyRegistry {
    providers: DashMap<String, Arc<dyn Telephony>>,
    contexts: Arc<dyn CallContextStore>,
}

impl TelephonyRegistry {
    pub fn new(contexts: Arc<dyn CallContextStore>) -> Self {
        Self {
            providers: DashMap::new(),
            contexts,
        }
    }

    pub fn register(&self, provider: Arc<dyn Telephony>) {
        self.providers.insert(provider.provider().to_string(), provider);
    }

    pub fn provider(&self, name: &str) -> TalkResult<Arc<dyn Telephony>> {
        self.providers
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| TalkError::NotFound(format!("telephony provider {name}")))
    }

    /// Save an outbound call context and ask the provider to dial it.
    pub async fn create_call(&self, ctx: CallContext, credential: &Credential) -> TalkResult<String> {
        let provider = self.provider(&ctx.provider)?;
        let context_id = self.contexts.save(ctx).await?;
        let ctx = self.contexts.get(&context_id).await?;
        match provider.create_call(&ctx, credential).await {
            Ok(call_id) => {
                self.contexts
                    .update(&context_id, CallContextUpdate::ProviderCallId(call_id.clone()))
                    .await?;
                info!(context_id = %context_id, call_id = %call_id, provider = %ctx.provider, "call created");
                Ok(context_id)
            }
            Err(e) => {
                warn!(context_id = %context_id, error = %e, "call creation failed");
                self.contexts
                    .update(&context_id, CallContextUpdate::Status(CallStatus::Failed))
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn receive_call(&self, provider: &str, request: &Options) -> TalkResult<String> {
        let ctx = self.provider(provider)?.receive_call(request).await?;
        self.contexts.save(ctx).await
    }

    /// Apply a status callback; terminal statuses remove the context.
    pub async fn callback(&self, context_id: &str, payload: &Options) -> TalkResult<CallStatus> {
        let ctx = self.contexts.get(context_id).await?;
        let status = self.provider(&ctx.provider)?.callback(&ctx, payload).await?;
        match status {
            CallStatus::Completed | CallStatus::Failed => {
                self.contexts.delete(context_id).await?;
            }
            _ => {
                self.contexts
                    .update(context_id, CallContextUpdate::Status(status))
                    .await?;
            }
        }
        Ok(status)
    }

    pub async fn context(&self, context_id: &str) -> TalkResult<CallContext> {
        self.contexts.get(context_id).await
    }

    /// Release a finished call's context.
    pub async fn hang_up(&self, context_id: &str) -> TalkResult<()> {
        let ctx = self.contexts.get_and_delete(context_id).await?;
        info!(context_id, provider = %ctx.provider, "call released");
        Ok(())
    }

    /// Resolve `context_id` and build the provider's streamer for the attached media.
    pub async fn attach(&self, context_id: &str, media: MediaChannel) -> TalkResult<Arc<dyn Streamer>> {
        let ctx = self
            .contexts
            .update(context_id, CallContextUpdate::Status(CallStatus::InProgress))
            .await?;
        self.provider(&ctx.provider)?.streamer(&ctx, media)
    }
}

/// How media bytes are framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Every chunk is one audio frame.
    Raw,
    /// Asterisk AudioSocket: `kind(1) | len(2, big endian) | payload`.
    AudioSocket,
}

const KIND_HANGUP: u8 = 0x00;
const KIND_UUID: u8 = 0x01;
const KIND_AUDIO: u8 = 0x10;
const KIND_ERROR: u8 = 0xff;

pub fn encode_audiosocket(kind: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(3 + len);
    out.push(kind);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&payload[..len]);
    out
}

/// A call's media connection presented as a [`Streamer`]. The first frame delivered is
/// the configuration rebuilt from the call context, so the engine resumes the call's
/// conversation without a client-side handshake.
pub struct MediaStreamer {
    configuration: Mutex<Option<ConnectRequest>>,
    audio: AudioConfig,
    framing: Framing,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    pending: Mutex<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    hung_up: AtomicBool,
}

impl MediaStreamer {
    pub fn new(ctx: &CallContext, media: MediaChannel, audio: AudioConfig, framing: Framing) -> Self {
        let mut request = ConnectRequest::new(ctx.assistant_id, Channel::Phone);
        request.direction = ctx.direction;
        request.conversation_id = (ctx.conversation_id != 0).then_some(ctx.conversation_id);
        request.metadata.insert("telephony.provider", ctx.provider.clone());
        request.metadata.insert("telephony.context_id", ctx.context_id.clone());
        request.args.insert("from_number", ctx.from_number.clone());
        request.args.insert("to_number", ctx.to_number.clone());
        Self {
            configuration: Mutex::new(Some(request)),
            audio,
            framing,
            inbound: Mutex::new(media.inbound),
            pending: Mutex::new(Vec::new()),
            outbound: media.outbound,
            hung_up: AtomicBool::new(false),
        }
    }

    /// Pop one complete AudioSocket frame from the pending buffer.
    fn next_frame(pending: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
        if pending.len() < 3 {
            return None;
        }
        let len = u16::from_be_bytes([pending[1], pending[2]]) as usize;
        if pending.len() < 3 + len {
            return None;
        }
        let kind = pending[0];
        let payload = pending[3..3 + len].to_vec();
        pending.drain(..3 + len);
        Some((kind, payload))
    }
}

#[async_trait]
impl Streamer for MediaStreamer {
    async fn recv(&self) -> TalkResult<Option<Inbound>> {
        if let Some(request) = self.configuration.lock().await.take() {
            return Ok(Some(Inbound::Configuration(request)));
        }
        if self.hung_up.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut inbound = self.inbound.lock().await;
        loop {
            if self.framing == Framing::AudioSocket {
                let mut pending = self.pending.lock().await;
                while let Some((kind, payload)) = Self::next_frame(&mut pending) {
                    match kind {
                        KIND_AUDIO => return Ok(Some(Inbound::Audio(payload))),
                        KIND_HANGUP => {
                            self.hung_up.store(true, Ordering::SeqCst);
                            return Ok(None);
                        }
                        KIND_ERROR => {
                            return Err(TalkError::Transport(format!(
                                "audiosocket error frame: {payload:?}"
                            )))
                        }
                        KIND_UUID => debug!("audiosocket call uuid received"),
                        other => debug!(kind = other, "unknown audiosocket frame ignored"),
                    }
                }
            }
            match inbound.recv().await {
                None => return Ok(None),
                Some(bytes) => match self.framing {
                    Framing::Raw => return Ok(Some(Inbound::Audio(bytes))),
                    Framing::AudioSocket => self.pending.lock().await.extend_from_slice(&bytes),
                },
            }
        }
    }

    async fn send(&self, frame: Outbound) -> TalkResult<()> {
        let bytes = match frame {
            Outbound::Audio { data, .. } => match self.framing {
                Framing::Raw => data,
                Framing::AudioSocket => encode_audiosocket(KIND_AUDIO, &data),
            },
            Outbound::Directive { .. } if self.framing == Framing::AudioSocket => {
                encode_audiosocket(KIND_HANGUP, &[])
            }
            _ => return Ok(()),
        };
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| TalkError::Transport("media channel closed".into()))
    }

    fn config(&self) -> Option<AudioConfig> {
        Some(self.audio)
    }
}

/// Asterisk AudioSocket: inbound only, 8kHz signed linear PCM, no status callbacks.
#[derive(Debug, Default)]
pub struct AudioSocketTelephony;

#[async_trait]
impl Telephony for AudioSocketTelephony {
    fn provider(&self) -> &str {
        "audiosocket"
    }

    async fn create_call(&self, _ctx: &CallContext, _credential: &Credential) -> TalkResult<String> {
        Err(TalkError::Validation(
            "audiosocket cannot place outbound calls".into(),
        ))
    }

    async fn receive_call(&self, request: &Options) -> TalkResult<CallContext> {
        Ok(CallContext {
            context_id: String::new(),
            assistant_id: request.get_u64("assistant_id")?,
            conversation_id: request.get_u64("conversation_id").unwrap_or(0),
            auth_token: request.get_string("auth_token")?,
            auth_type: AuthType::ApiKey,
            direction: Direction::Inbound,
            from_number: request.get_string("from").unwrap_or_default(),
            to_number: request.get_string("to").unwrap_or_default(),
            provider: self.provider().to_string(),
            status: CallStatus::Ringing,
            provider_call_id: request.get_string("uuid").ok(),
            created_at: Utc::now(),
        })
    }

    async fn callback(&self, ctx: &CallContext, _payload: &Options) -> TalkResult<CallStatus> {
        Ok(ctx.status)
    }

    fn streamer(&self, ctx: &CallContext, media: MediaChannel) -> TalkResult<Arc<dyn Streamer>> {
        let audio = AudioConfig {
            sample_rate: 8000,
            encoding: crate::audio::AudioEncoding::Linear16,
            channels: 1,
        };
        Ok(Arc::new(MediaStreamer::new(ctx, media, audio, Framing::AudioSocket)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callcontext::InMemoryCallContextStore;

    fn inbound_request() -> Options {
        Options::new()
            .with("assistant_id", 3)
            .with("auth_token", "key")
            .with("from", "+100")
            .with("conversation_id", 12)
    }

    #[tokio::test]
    async fn attach_rebuilds_configuration_and_decodes_frames() {
        let registry = TelephonyRegistry::new(Arc::new(InMemoryCallContextStore::default()));
        registry.register(Arc::new(AudioSocketTelephony));
        let context_id = registry
            .receive_call("audiosocket", &inbound_request())
            .await
            .unwrap();

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let streamer = registry
            .attach(&context_id, MediaChannel { inbound: in_rx, outbound: out_tx })
            .await
            .unwrap();

        match streamer.recv().await.unwrap() {
            Some(Inbound::Configuration(req)) => {
                assert_eq!(req.assistant_id, 3);
                assert_eq!(req.conversation_id, Some(12));
                assert_eq!(req.channel, Channel::Phone);
            }
            other => panic!("expected configuration, got {other:?}"),
        }

        // A frame split across two socket reads, then a hangup.
        let frame = encode_audiosocket(KIND_AUDIO, &[1, 2, 3, 4]);
        in_tx.send(frame[..2].to_vec()).await.unwrap();
        in_tx.send(frame[2..].to_vec()).await.unwrap();
        in_tx.send(encode_audiosocket(KIND_HANGUP, &[])).await.unwrap();
        assert_eq!(
            streamer.recv().await.unwrap(),
            Some(Inbound::Audio(vec![1, 2, 3, 4]))
        );
        assert_eq!(streamer.recv().await.unwrap(), None);

        streamer
            .send(Outbound::Audio {
                context_id: "c".into(),
                data: vec![9],
                completed: false,
            })
            .await
            .unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), vec![KIND_AUDIO, 0, 1, 9]);
    }

    #[tokio::test]
    async fn terminal_callback_removes_context() {
        let contexts = Arc::new(InMemoryCallContextStore::default());
        let registry = TelephonyRegistry::new(contexts.clone());
        registry.register(Arc::new(AudioSocketTelephony));
        let context_id = registry
            .receive_call("audiosocket", &inbound_request())
            .await
            .unwrap();
        contexts
            .update(&context_id, CallContextUpdate::Status(CallStatus::Completed))
            .await
            .unwrap();
        let status = registry.callback(&context_id, &Options::new()).await.unwrap();
        assert_eq!(status, CallStatus::Completed);
        assert!(contexts.get(&context_id).await.is_err());
    }

    #[tokio::test]
    async fn hang_up_releases_the_context_once() {
        let registry = TelephonyRegistry::new(Arc::new(InMemoryCallContextStore::default()));
        registry.register(Arc::new(AudioSocketTelephony));
        let context_id = registry
            .receive_call("audiosocket", &inbound_request())
            .await
            .unwrap();
        assert_eq!(registry.context(&context_id).await.unwrap().assistant_id, 3);

        tokio_test::assert_ok!(registry.hang_up(&context_id).await);
        assert!(matches!(
            registry.hang_up(&context_id).await,
            Err(TalkError::NotFound(_))
        ));
        assert!(registry.context(&context_id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let registry = TelephonyRegistry::new(Arc::new(InMemoryCallContextStore::default()));
        assert!(registry.provider("nope").is_err());
    }
}
