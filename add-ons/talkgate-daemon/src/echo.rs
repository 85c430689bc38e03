//! Offline language model: repeats the caller, word by word.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use std::time::Duration;
use talkgate_core::Role;
use talkgate_executor::{ExecutorResult, LanguageModel, ModelRequest};

/// Pause between streamed words, so interruptions can be tried by hand.
const WORD_DELAY: Duration = Duration::from_millis(120);

pub struct EchoModel;

#[async_trait]
impl LanguageModel for EchoModel {
    fn provider(&self) -> &str {
        "echo"
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> ExecutorResult<BoxStream<'static, ExecutorResult<String>>> {
        let last = request
            .history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.contents.clone())
            .unwrap_or_default();
        let words: Vec<String> = format!("You said: {last}.")
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let deltas = futures_util::stream::iter(words).then(|word| async move {
            tokio::time::sleep(WORD_DELAY).await;
            Ok(word)
        });
        Ok(deltas.boxed())
    }
}
