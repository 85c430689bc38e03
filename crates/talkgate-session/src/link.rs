//! The engine side of the executor protocol.
//!
//! Backends never hold the session itself: they get an [`EngineLink`] carrying the
//! identity, a view of the shared state, and the sending half of the packet queue that the
//! dispatcher drains in order.

use async_trait::async_trait;
use std::sync::Arc;
use talkgate_core::{
    Message, Options, Packet, SessionIdentity, SessionState, TalkError, TalkResult, Tracer,
};
use talkgate_executor::Communication;
use tokio::sync::mpsc;

pub(crate) struct EngineLink {
    identity: SessionIdentity,
    state: Arc<SessionState>,
    tracer: Arc<dyn Tracer>,
    packets: mpsc::UnboundedSender<Packet>,
}

impl EngineLink {
    pub(crate) fn new(
        identity: SessionIdentity,
        state: Arc<SessionState>,
        tracer: Arc<dyn Tracer>,
        packets: mpsc::UnboundedSender<Packet>,
    ) -> Self {
        Self {
            identity,
            state,
            tracer,
            packets,
        }
    }
}

#[async_trait]
impl Communication for EngineLink {
    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn histories(&self) -> Vec<Message> {
        self.state.histories()
    }

    fn args(&self) -> Options {
        self.state.args()
    }

    fn options(&self) -> Options {
        self.state.options()
    }

    fn tracer(&self) -> Arc<dyn Tracer> {
        Arc::clone(&self.tracer)
    }

    async fn on_packet(&self, packet: Packet) -> TalkResult<()> {
        self.packets
            .send(packet)
            .map_err(|_| TalkError::SessionClosed)
    }
}
