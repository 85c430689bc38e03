//! Silence-based end-of-speech detection over transcripts.
//!
//! Every completed transcript extends the pending utterance and restarts the silence
//! timer; interim text only restarts the timer. When the timer runs out with a non-empty
//! utterance, a `SpeechEnd` carrying the whole utterance is emitted.

use crate::analyzer::TextAnalyzer;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use talkgate_core::{Activity, Options};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

pub const TIMEOUT_OPTION: &str = "microphone.eos.timeout";

struct TextEvent {
    text: String,
    completed: bool,
}

struct Running {
    events: mpsc::UnboundedSender<TextEvent>,
    task: JoinHandle<()>,
}

pub struct SilenceEndOfSpeech {
    timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl SilenceEndOfSpeech {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            running: Mutex::new(None),
        }
    }

    /// Reads `microphone.eos.timeout` (milliseconds), else `fallback`.
    pub fn from_options(options: &Options, fallback: Duration) -> Self {
        let timeout = options
            .get_u64(TIMEOUT_OPTION)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(fallback);
        Self::new(timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

async fn watch_silence(
    timeout: Duration,
    mut events: mpsc::UnboundedReceiver<TextEvent>,
    activities: mpsc::UnboundedSender<Activity>,
) {
    let origin = Instant::now();
    let mut utterance = String::new();
    let mut started: Option<f64> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.completed {
                    let text = event.text.trim();
                    if !text.is_empty() {
                        if !utterance.is_empty() {
                            utterance.push(' ');
                        }
                        utterance.push_str(text);
                        started.get_or_insert_with(|| origin.elapsed().as_secs_f64());
                    }
                }
                if !utterance.is_empty() {
                    deadline = Some(Instant::now() + timeout);
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                let transcript = std::mem::take(&mut utterance);
                let end_at = origin.elapsed().as_secs_f64();
                info!(chars = transcript.len(), "end of speech after silence");
                let activity = Activity::SpeechEnd {
                    start_at: started.take().unwrap_or(end_at),
                    end_at,
                    transcript,
                };
                if activities.send(activity).is_err() {
                    break;
                }
            }
        }
    }
    debug!("end-of-speech watcher stopped");
}

#[async_trait]
impl TextAnalyzer for SilenceEndOfSpeech {
    fn name(&self) -> &str {
        "silence_eos"
    }

    async fn initialize(&self, activities: mpsc::UnboundedSender<Activity>) -> VoiceResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(watch_silence(self.timeout, rx, activities));
        let previous = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Running { events: tx, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(())
    }

    async fn analyze(&self, text: &str, completed: bool) -> VoiceResult<()> {
        let guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let running = guard
            .as_ref()
            .ok_or_else(|| VoiceError::NotInitialized(self.name().into()))?;
        running
            .events
            .send(TextEvent {
                text: text.to_string(),
                completed,
            })
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    async fn close(&self) -> VoiceResult<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_option_overrides_fallback() {
        let options = Options::new().with(TIMEOUT_OPTION, 250);
        let eos = SilenceEndOfSpeech::from_options(&options, Duration::from_secs(1));
        assert_eq!(eos.timeout(), Duration::from_millis(250));

        let eos = SilenceEndOfSpeech::from_options(&Options::new(), Duration::from_secs(1));
        assert_eq!(eos.timeout(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn emits_once_after_silence() {
        let eos = SilenceEndOfSpeech::new(Duration::from_millis(500));
        let (tx, mut rx) = mpsc::unbounded_channel();
        eos.initialize(tx).await.unwrap();

        eos.analyze("book a table", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        eos.analyze("for", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        eos.analyze("for two", true).await.unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        match rx.recv().await.unwrap() {
            Activity::SpeechEnd { transcript, .. } => assert_eq!(transcript, "book a table for two"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        eos.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn interim_text_alone_never_fires() {
        let eos = SilenceEndOfSpeech::new(Duration::from_millis(200));
        let (tx, mut rx) = mpsc::unbounded_channel();
        eos.initialize(tx).await.unwrap();
        eos.analyze("hel", false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
