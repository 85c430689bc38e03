//! The session engine: one [`TalkEngine`] per conversation attached to one transport.
//!
//! All pipelines share a single [`Session`] behind an `Arc`. Mutable fields are grouped by
//! owner, each with its own lock:
//! - `lifecycle`: only the connect/disconnect transitions write it
//! - `identity`, `assistant`, `executor`, `link`: written once while connecting, read after
//! - `state`: see [`SessionState`] for its own field ownership
//! - `turns`: the packet handlers
//! - `listener` / `speaker`: their pipelines
//! - `recorder`: appended by both pipelines, drained once at disconnect

use crate::deps::SessionDeps;
use crate::listen::Listener;
use crate::recorder::Recorder;
use crate::speak::Speaker;
use crate::turns::{IdleWatch, Turns};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use talkgate_core::{
    AssistantDefinition, BackgroundWorker, ConnectRequest, ConversationStore, LifecycleState,
    MediaChannel, Message, Metric, Packet, Principal, SessionIdentity, SessionState, Streamer,
    TalkError, TalkResult, Tracer,
};
use talkgate_executor::{Communication, Executor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub(crate) struct Session {
    pub(crate) deps: SessionDeps,
    pub(crate) streamer: Arc<dyn Streamer>,
    pub(crate) tracer: Arc<dyn Tracer>,
    pub(crate) state: Arc<SessionState>,
    lifecycle: Mutex<LifecycleState>,
    identity: RwLock<Option<SessionIdentity>>,
    assistant: RwLock<Option<Arc<AssistantDefinition>>>,
    executor: RwLock<Option<Arc<dyn Executor>>>,
    link: RwLock<Option<Arc<dyn Communication>>>,
    pub(crate) listener: Listener,
    pub(crate) speaker: Speaker,
    pub(crate) recorder: Arc<Recorder>,
    pub(crate) turns: Turns,
    pub(crate) idle: IdleWatch,
    pub(crate) worker: BackgroundWorker,
    /// Session-wide; cancelled once teardown is done.
    pub(crate) cancel: CancellationToken,
    /// Idle and duration timers; cancelled as soon as disconnect starts.
    pub(crate) behaviors: CancellationToken,
    pub(crate) end_requested: AtomicBool,
    packets: mpsc::UnboundedSender<Packet>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Packet>>>,
}

impl Session {
    pub(crate) fn new(deps: SessionDeps, streamer: Arc<dyn Streamer>, tracer: Arc<dyn Tracer>) -> Self {
        let (packets, inbox) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = BackgroundWorker::start(deps.config.worker.queue_capacity);
        let recorder = Arc::new(Recorder::new(streamer.config().unwrap_or_default()));
        Self {
            deps,
            streamer,
            tracer,
            state: Arc::new(SessionState::new()),
            lifecycle: Mutex::new(LifecycleState::Idle),
            identity: RwLock::new(None),
            assistant: RwLock::new(None),
            executor: RwLock::new(None),
            link: RwLock::new(None),
            listener: Listener::default(),
            speaker: Speaker::default(),
            recorder,
            turns: Turns::default(),
            idle: IdleWatch::default(),
            worker,
            behaviors: cancel.child_token(),
            cancel,
            end_requested: AtomicBool::new(false),
            packets,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    pub(crate) fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`, refusing illegal successors. Leaving a torn-down session always
    /// reports [`TalkError::SessionClosed`].
    pub(crate) fn transition(&self, next: LifecycleState) -> TalkResult<LifecycleState> {
        let mut current = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if !current.can_transition_to(next) {
            return Err(match *current {
                LifecycleState::Disconnecting | LifecycleState::Closed => TalkError::SessionClosed,
                other => TalkError::InvalidState(format!("cannot move from {other:?} to {next:?}")),
            });
        }
        let previous = std::mem::replace(&mut *current, next);
        info!(from = ?previous, to = ?next, "session state changed");
        Ok(previous)
    }

    /// Entry points driven by the client are only served while active.
    pub(crate) fn ensure_active(&self) -> TalkResult<()> {
        match self.lifecycle() {
            LifecycleState::Active => Ok(()),
            LifecycleState::Disconnecting | LifecycleState::Closed => Err(TalkError::SessionClosed),
            other => Err(TalkError::InvalidState(format!("session is {other:?}"))),
        }
    }

    pub(crate) fn identity(&self) -> TalkResult<SessionIdentity> {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TalkError::InvalidState("session has no conversation yet".into()))
    }

    pub(crate) fn assistant(&self) -> TalkResult<Arc<AssistantDefinition>> {
        self.assistant
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TalkError::InvalidState("assistant not resolved".into()))
    }

    pub(crate) fn executor(&self) -> TalkResult<Arc<dyn Executor>> {
        self.executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TalkError::InvalidState("executor not initialized".into()))
    }

    pub(crate) fn link(&self) -> TalkResult<Arc<dyn Communication>> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TalkError::InvalidState("executor not initialized".into()))
    }

    pub(crate) fn bind(&self, identity: SessionIdentity, assistant: Arc<AssistantDefinition>) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Some(identity);
        *self.assistant.write().unwrap_or_else(PoisonError::into_inner) = Some(assistant);
    }

    pub(crate) fn attach_executor(&self, executor: Arc<dyn Executor>, link: Arc<dyn Communication>) {
        *self.executor.write().unwrap_or_else(PoisonError::into_inner) = Some(executor);
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    /// Forget everything a failed connect left behind so it can be retried.
    pub(crate) fn unbind(&self) {
        self.identity.write().unwrap_or_else(PoisonError::into_inner).take();
        self.assistant.write().unwrap_or_else(PoisonError::into_inner).take();
        self.executor.write().unwrap_or_else(PoisonError::into_inner).take();
        self.link.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub(crate) fn packet_sender(&self) -> mpsc::UnboundedSender<Packet> {
        self.packets.clone()
    }

    pub(crate) fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<Packet>> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Queue a packet behind everything the executor already delivered.
    pub(crate) fn enqueue(&self, packet: Packet) {
        if self.packets.send(packet).is_err() {
            debug!("packet dispatcher gone, packet discarded");
        }
    }

    /// Run a persistence job on the background worker for `identity`'s conversation.
    pub(crate) fn persist_for<F, Fut>(&self, identity: &SessionIdentity, name: &'static str, job: F)
    where
        F: FnOnce(Arc<dyn ConversationStore>, u64, u64) -> Fut,
        Fut: Future<Output = TalkResult<()>> + Send + 'static,
    {
        let store = Arc::clone(&self.deps.conversations);
        self.worker.submit(
            name,
            job(store, identity.assistant_id, identity.conversation_id),
        );
    }

    pub(crate) fn persist<F, Fut>(&self, name: &'static str, job: F)
    where
        F: FnOnce(Arc<dyn ConversationStore>, u64, u64) -> Fut,
        Fut: Future<Output = TalkResult<()>> + Send + 'static,
    {
        match self.identity() {
            Ok(identity) => self.persist_for(&identity, name, job),
            Err(_) => debug!(job = name, "no conversation to persist into"),
        }
    }

    pub(crate) fn persist_message(&self, message: Message) {
        self.persist("create message", move |store, assistant, conversation| async move {
            store
                .create_conversation_message(assistant, conversation, &message)
                .await
        });
    }

    pub(crate) fn persist_metrics(&self, metrics: Vec<Metric>) {
        self.persist("conversation metrics", move |store, assistant, conversation| async move {
            store
                .apply_conversation_metrics(assistant, conversation, &metrics)
                .await
        });
    }
}

pub(crate) fn new_context_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A talk session bound to one transport.
///
/// Lifecycle: `Idle → Connecting → Active → Disconnecting → Closed`. Must be created inside
/// a tokio runtime; the background persistence worker starts immediately.
pub struct TalkEngine {
    inner: Arc<Session>,
}

impl TalkEngine {
    pub fn new(deps: SessionDeps, streamer: Arc<dyn Streamer>, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            inner: Arc::new(Session::new(deps, streamer, tracer)),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle()
    }

    /// Identity of the bound conversation, once connected.
    pub fn identity(&self) -> Option<SessionIdentity> {
        self.inner.identity().ok()
    }

    /// Live session state (history, metrics, metadata, args, options).
    pub fn session_state(&self) -> &SessionState {
        &self.inner.state
    }

    /// Token cancelled when the session is torn down. Cancelling it stops [`TalkEngine::talk`].
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Persistence jobs dropped because the background queue was full.
    pub fn dropped_jobs(&self) -> u64 {
        self.inner.worker.dropped()
    }

    pub async fn connect(&self, principal: &Principal, request: ConnectRequest) -> TalkResult<()> {
        self.inner.connect(principal, request).await
    }

    pub async fn disconnect(&self) -> TalkResult<()> {
        self.inner.disconnect().await
    }

    pub async fn listen_audio(&self, frame: &[u8]) -> TalkResult<()> {
        self.inner.listen_audio(frame).await
    }

    pub async fn listen_text(&self, text: &str) -> TalkResult<()> {
        self.inner.listen_text(text).await
    }

    /// Serve the transport until it hangs up or the session ends.
    pub async fn talk(&self, principal: &Principal) -> TalkResult<()> {
        self.inner.talk(principal).await
    }

    /// Serve a phone call whose media just attached. The call context supplies the
    /// credentials and the conversation to resume; it is released when the call ends.
    /// Returns the finished engine.
    #[instrument(skip(deps, tracer, media))]
    pub async fn answer_call(
        deps: SessionDeps,
        tracer: Arc<dyn Tracer>,
        context_id: &str,
        media: MediaChannel,
    ) -> TalkResult<TalkEngine> {
        let telephony = Arc::clone(&deps.telephony);
        let call = telephony.context(context_id).await?;
        let streamer = telephony.attach(context_id, media).await?;
        let principal = Principal {
            token: call.auth_token,
            auth_type: call.auth_type,
        };

        let engine = TalkEngine::new(deps, streamer, tracer);
        let result = engine.talk(&principal).await;
        if let Err(e) = telephony.hang_up(context_id).await {
            warn!(error = %e, "call context already gone");
        }
        result.map(|()| engine)
    }
}

impl Drop for TalkEngine {
    fn drop(&mut self) {
        // Background tasks hold the session; stop them if teardown never ran.
        self.inner.cancel.cancel();
    }
}
