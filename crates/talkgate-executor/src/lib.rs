//! # Talkgate Executor
//!
//! Uniform protocol between the session engine and the backend that produces assistant
//! responses. A backend receives user turns through [`Executor::execute`] and reports
//! everything it produces (deltas, the terminal done, interruptions, directives, metrics)
//! through [`Communication::on_packet`].
//!
//! Three backends ship, selected once per session by [`ExecutorFactory::build`]:
//! - [`stream::StreamExecutor`]: bidirectional gRPC stream
//! - [`websocket::WebSocketExecutor`]: JSON messages over a WebSocket
//! - [`model::ModelExecutor`]: a [`model::LanguageModel`] called in-process

pub mod accumulate;
pub mod error;
pub mod model;
pub mod mtls;
pub mod proto;
pub mod stream;
#[cfg(test)]
mod testing;
pub mod websocket;

pub use accumulate::DeltaAccumulator;
pub use error::{ExecutorError, ExecutorResult};
pub use model::{LanguageModel, ModelExecutor, ModelRequest};
pub use stream::StreamExecutor;
pub use websocket::WebSocketExecutor;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use talkgate_core::config::WebSocketConfig;
use talkgate_core::{
    ConnectRequest, CredentialStore, ExecutorSpec, Message, Options, Packet, SessionIdentity,
    TalkResult, Tracer,
};

/// The engine as seen by a backend.
#[async_trait]
pub trait Communication: Send + Sync {
    fn identity(&self) -> &SessionIdentity;

    fn histories(&self) -> Vec<Message>;

    fn args(&self) -> Options;

    fn options(&self) -> Options;

    fn tracer(&self) -> Arc<dyn Tracer>;

    /// Hand a backend packet to the engine. Packets are processed in the order they are
    /// delivered.
    async fn on_packet(&self, packet: Packet) -> TalkResult<()>;
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(
        &self,
        comm: Arc<dyn Communication>,
        config: &ConnectRequest,
    ) -> ExecutorResult<()>;

    /// Deliver one packet upstream. `UserText` starts a turn; `Interruption` tells the
    /// backend the current turn was barged in on.
    async fn execute(&self, comm: Arc<dyn Communication>, packet: Packet) -> ExecutorResult<()>;

    async fn close(&self) -> ExecutorResult<()>;
}

/// Builds the executor an assistant is configured for.
pub struct ExecutorFactory {
    models: DashMap<String, Arc<dyn LanguageModel>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    websocket: WebSocketConfig,
}

impl ExecutorFactory {
    pub fn new(websocket: WebSocketConfig) -> Self {
        Self {
            models: DashMap::new(),
            credentials: None,
            websocket,
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Make an in-process model available under its provider name.
    pub fn register_model(&self, model: Arc<dyn LanguageModel>) {
        self.models.insert(model.provider().to_string(), model);
    }

    pub fn build(&self, spec: &ExecutorSpec) -> ExecutorResult<Arc<dyn Executor>> {
        let executor: Arc<dyn Executor> = match spec {
            ExecutorSpec::Stream { endpoint, tls } => {
                Arc::new(StreamExecutor::new(endpoint.clone(), tls.clone()))
            }
            ExecutorSpec::WebSocket { url, headers } => Arc::new(WebSocketExecutor::new(
                url.clone(),
                headers.clone(),
                self.websocket.clone(),
            )),
            ExecutorSpec::Model {
                provider,
                model,
                credential_id,
                options,
            } => {
                let backend = self
                    .models
                    .get(provider)
                    .map(|m| Arc::clone(m.value()))
                    .ok_or_else(|| ExecutorError::UnknownProvider(provider.clone()))?;
                Arc::new(ModelExecutor::new(
                    backend,
                    model.clone(),
                    *credential_id,
                    options.clone(),
                    self.credentials.clone(),
                ))
            }
        };
        Ok(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use talkgate_core::StreamTls;

    #[test]
    fn factory_selects_backend_by_kind() {
        let factory = ExecutorFactory::new(WebSocketConfig::default());
        let stream = factory
            .build(&ExecutorSpec::Stream {
                endpoint: "http://127.0.0.1:50051".into(),
                tls: StreamTls::Insecure,
            })
            .unwrap();
        assert_eq!(stream.name(), "stream");

        let ws = factory
            .build(&ExecutorSpec::WebSocket {
                url: "ws://127.0.0.1:9000".into(),
                headers: BTreeMap::new(),
            })
            .unwrap();
        assert_eq!(ws.name(), "websocket");
    }

    #[test]
    fn unknown_model_provider_is_rejected() {
        let factory = ExecutorFactory::new(WebSocketConfig::default());
        let result = factory.build(&ExecutorSpec::Model {
            provider: "nowhere".into(),
            model: "m".into(),
            credential_id: 0,
            options: Options::new(),
        });
        assert!(matches!(result, Err(ExecutorError::UnknownProvider(_))));
    }
}
