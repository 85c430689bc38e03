//! Conversation webhooks with fixed-backoff retry.

use crate::error::{TalkError, TalkResult};
use crate::message::{Message, Metric};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    ConversationBegin,
    ConversationCompleted,
    ConversationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_statuses: Vec<u16>,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_statuses: vec![408, 429, 500, 502, 503, 504],
            backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSpec {
    pub url: String,
    pub events: Vec<WebhookEventKind>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub kind: WebhookEventKind,
    pub assistant_id: u64,
    pub conversation_id: u64,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[async_trait]
pub trait WebhookDispatcher: Send + Sync {
    async fn dispatch(&self, spec: &WebhookSpec, event: &WebhookEvent) -> TalkResult<()>;
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Delivered,
    Status(u16),
}

/// Run `send` until it delivers, returns a status outside the retryable set, or the
/// policy's retries are exhausted. Returns the number of attempts made on success.
pub async fn retry_with_policy<F, Fut>(policy: &RetryPolicy, mut send: F) -> TalkResult<u32>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = TalkResult<Attempt>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let status = match send(attempt).await {
            Ok(Attempt::Delivered) => return Ok(attempt),
            Ok(Attempt::Status(status)) => status,
            Err(e) => return Err(e),
        };
        if !policy.retry_statuses.contains(&status) {
            return Err(TalkError::Webhook(format!("non-retryable status {status}")));
        }
        if attempt > policy.max_retries {
            return Err(TalkError::Webhook(format!(
                "gave up after {attempt} attempts, last status {status}"
            )));
        }
        debug!(attempt, status, "webhook attempt failed, retrying");
        tokio::time::sleep(Duration::from_millis(policy.backoff_ms)).await;
    }
}

/// Posts events as JSON.
#[derive(Debug, Clone)]
pub struct HttpWebhookDispatcher {
    client: reqwest::Client,
}

impl HttpWebhookDispatcher {
    pub fn new(timeout: Duration) -> TalkResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TalkError::Webhook(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookDispatcher for HttpWebhookDispatcher {
    async fn dispatch(&self, spec: &WebhookSpec, event: &WebhookEvent) -> TalkResult<()> {
        if !spec.events.contains(&event.kind) {
            return Ok(());
        }
        let attempts = retry_with_policy(&spec.retry, |_| {
            let mut request = self.client.post(&spec.url).json(event);
            for (k, v) in &spec.headers {
                request = request.header(k, v);
            }
            async move {
                let response = request.send().await.map_err(|e| {
                    warn!(error = %e, "webhook request failed");
                    TalkError::Webhook(e.to_string())
                })?;
                if response.status().is_success() {
                    Ok(Attempt::Delivered)
                } else {
                    Ok(Attempt::Status(response.status().as_u16()))
                }
            }
        })
        .await?;
        debug!(url = %spec.url, attempts, kind = ?event.kind, "webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            retry_statuses: vec![503],
            backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn retries_retryable_statuses_until_delivered() {
        let calls = AtomicU32::new(0);
        let attempts = retry_with_policy(&policy(), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(if n < 3 {
                    Attempt::Status(503)
                } else {
                    Attempt::Delivered
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_status() {
        let calls = AtomicU32::new(0);
        let result = retry_with_policy(&policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Attempt::Status(400)) }
        })
        .await;
        assert!(matches!(result, Err(TalkError::Webhook(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result = retry_with_policy(&policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Attempt::Status(503)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
