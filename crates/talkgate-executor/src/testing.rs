//! Fake engine side used by the backend tests.

use crate::Communication;
use async_trait::async_trait;
use std::sync::Arc;
use talkgate_core::{
    Channel, Direction, Message, Options, Packet, RecordingTracer, SessionIdentity, TalkError,
    TalkResult, Tracer,
};
use tokio::sync::mpsc;

pub(crate) struct Recorder {
    identity: SessionIdentity,
    tracer: Arc<RecordingTracer>,
    history: Vec<Message>,
    packets: mpsc::UnboundedSender<Packet>,
}

pub(crate) fn recorder(history: Vec<Message>) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Packet>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let recorder = Recorder {
        identity: SessionIdentity {
            conversation_id: 42,
            assistant_id: 7,
            provider_model_id: 1,
            channel: Channel::Web,
            direction: Direction::Inbound,
            start_time: chrono::Utc::now(),
        },
        tracer: Arc::new(RecordingTracer::new()),
        history,
        packets: tx,
    };
    (Arc::new(recorder), rx)
}

#[async_trait]
impl Communication for Recorder {
    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn histories(&self) -> Vec<Message> {
        self.history.clone()
    }

    fn args(&self) -> Options {
        Options::new().with("name", "Ada")
    }

    fn options(&self) -> Options {
        Options::new()
    }

    fn tracer(&self) -> Arc<dyn Tracer> {
        self.tracer.clone()
    }

    async fn on_packet(&self, packet: Packet) -> TalkResult<()> {
        self.packets.send(packet).map_err(|_| TalkError::SessionClosed)
    }
}
