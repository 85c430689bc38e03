//! Collaborators a session is built from. One bundle is shared by every session of a
//! process; the engine clones the `Arc`s it needs.

use std::sync::Arc;
use talkgate_core::{
    AssistantCatalog, ConversationStore, CredentialStore, EngineConfig, InMemoryCallContextStore,
    NoTransformers, TelephonyRegistry, TransformerFactory, WebhookDispatcher,
};
use talkgate_executor::ExecutorFactory;

#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<EngineConfig>,
    pub assistants: Arc<dyn AssistantCatalog>,
    pub conversations: Arc<dyn ConversationStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub transformers: Arc<dyn TransformerFactory>,
    pub webhooks: Arc<dyn WebhookDispatcher>,
    pub executors: Arc<ExecutorFactory>,
    /// Providers and call contexts for sessions attached to phone calls.
    pub telephony: Arc<TelephonyRegistry>,
}

impl SessionDeps {
    /// Bundle without speech providers or telephony providers; swap them in with
    /// [`SessionDeps::with_transformers`] and [`SessionDeps::with_telephony`].
    pub fn new(
        config: Arc<EngineConfig>,
        assistants: Arc<dyn AssistantCatalog>,
        conversations: Arc<dyn ConversationStore>,
        credentials: Arc<dyn CredentialStore>,
        webhooks: Arc<dyn WebhookDispatcher>,
        executors: Arc<ExecutorFactory>,
    ) -> Self {
        let contexts = Arc::new(InMemoryCallContextStore::with_ttl(config.call_context.ttl()));
        Self {
            config,
            assistants,
            conversations,
            credentials,
            transformers: Arc::new(NoTransformers),
            webhooks,
            executors,
            telephony: Arc::new(TelephonyRegistry::new(contexts)),
        }
    }

    pub fn with_transformers(mut self, transformers: Arc<dyn TransformerFactory>) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn with_telephony(mut self, telephony: Arc<TelephonyRegistry>) -> Self {
        self.telephony = telephony;
        self
    }
}
