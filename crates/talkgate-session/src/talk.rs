//! The transport loop.

use crate::engine::Session;
use std::sync::Arc;
use talkgate_core::{Inbound, LifecycleState, Outbound, Principal, TalkError, TalkResult};
use tracing::{debug, error, info, instrument, warn};

impl Session {
    /// Read frames until the client hangs up or the session is torn down, then make sure
    /// the session is disconnected.
    #[instrument(skip_all)]
    pub(crate) async fn talk(self: &Arc<Self>, principal: &Principal) -> TalkResult<()> {
        principal.validate()?;
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("session cancelled, leaving talk loop");
                    break;
                }
                frame = self.streamer.recv() => frame,
            };
            match frame {
                Ok(Some(Inbound::Configuration(request))) => {
                    let first = self.lifecycle() == LifecycleState::Idle;
                    if let Err(e) = self.connect(principal, request).await {
                        if let Err(send) = self
                            .streamer
                            .send(Outbound::Error {
                                message: e.to_string(),
                            })
                            .await
                        {
                            warn!(error = %send, "configuration error not delivered");
                        }
                        if first {
                            return Err(e);
                        }
                        // the running session is left as it was
                        warn!(error = %e, "configuration ignored on a connected session");
                    }
                }
                Ok(Some(Inbound::Text(text))) => {
                    if let Err(e) = self.listen_text(&text).await {
                        warn!(error = %e, "text frame not handled");
                    }
                }
                Ok(Some(Inbound::Audio(frame))) => {
                    if let Err(e) = self.listen_audio(&frame).await {
                        debug!(error = %e, "audio frame not handled");
                    }
                }
                Ok(None) | Err(TalkError::EndOfStream) => {
                    info!("client hung up");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "transport failed");
                    break;
                }
            }
        }

        if self.lifecycle() == LifecycleState::Active {
            match self.disconnect().await {
                Ok(()) | Err(TalkError::SessionClosed) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
