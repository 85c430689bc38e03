//! Bookkeeping for conversational turns.

use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Which turn is current, when each turn started, and which were interrupted.
#[derive(Default)]
pub(crate) struct Turns {
    current: Mutex<Option<String>>,
    last_spoken: Mutex<Option<String>>,
    started: DashMap<String, Instant>,
    interrupted: DashSet<String>,
}

impl Turns {
    /// Make `context_id` the current turn; returns the turn it replaces.
    pub(crate) fn begin(&self, context_id: &str) -> Option<String> {
        self.started.insert(context_id.to_string(), Instant::now());
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(context_id.to_string())
    }

    pub(crate) fn current(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Output of any other turn is stale.
    pub(crate) fn is_current(&self, context_id: &str) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(context_id)
    }

    /// Stop accepting output for `context_id` if it is the current turn.
    pub(crate) fn abandon(&self, context_id: &str) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() == Some(context_id) {
            current.take();
        }
        self.started.remove(context_id);
    }

    /// Close out a completed turn so the next one does not interrupt it. Returns the
    /// elapsed time since it began; `None` when it was never started here.
    pub(crate) fn finish(&self, context_id: &str) -> Option<Duration> {
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() == Some(context_id) {
                current.take();
            }
        }
        self.started
            .remove(context_id)
            .map(|(_, started)| started.elapsed())
    }

    pub(crate) fn spoke(&self, context_id: &str) {
        *self
            .last_spoken
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(context_id.to_string());
    }

    /// The turn an interruption should land on: the current one, else whatever was spoken
    /// last (a greeting or idle prompt).
    pub(crate) fn interrupt_target(&self) -> Option<String> {
        self.current().or_else(|| {
            self.last_spoken
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// `true` the first time a context is interrupted, `false` afterwards.
    pub(crate) fn mark_interrupted(&self, context_id: &str) -> bool {
        self.interrupted.insert(context_id.to_string())
    }
}

/// Tracks user silence for the idle-timeout behavior.
pub(crate) struct IdleWatch {
    last_input: Mutex<Instant>,
    strikes: AtomicU32,
}

impl Default for IdleWatch {
    fn default() -> Self {
        Self {
            last_input: Mutex::new(Instant::now()),
            strikes: AtomicU32::new(0),
        }
    }
}

impl IdleWatch {
    /// User input arrived.
    pub(crate) fn touch(&self) {
        self.rearm();
        self.strikes.store(0, Ordering::SeqCst);
    }

    /// Restart the silence window without forgiving earlier timeouts.
    pub(crate) fn rearm(&self) {
        *self.last_input.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn deadline(&self, timeout: Duration) -> Instant {
        *self.last_input.lock().unwrap_or_else(PoisonError::into_inner) + timeout
    }

    /// Count one timeout; returns the consecutive total.
    pub(crate) fn strike(&self) -> u32 {
        self.strikes.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_of_replaced_turn_is_stale() {
        let turns = Turns::default();
        assert_eq!(turns.begin("a"), None);
        assert_eq!(turns.begin("b").as_deref(), Some("a"));
        assert!(!turns.is_current("a"));
        assert!(turns.is_current("b"));

        turns.abandon("a");
        assert!(turns.is_current("b"));
        turns.abandon("b");
        assert_eq!(turns.current(), None);
    }

    #[test]
    fn interruptions_coalesce_per_context() {
        let turns = Turns::default();
        assert!(turns.mark_interrupted("a"));
        assert!(!turns.mark_interrupted("a"));
        assert!(turns.mark_interrupted("b"));
    }

    #[test]
    fn interrupt_target_falls_back_to_last_spoken() {
        let turns = Turns::default();
        assert_eq!(turns.interrupt_target(), None);
        turns.spoke("greeting");
        assert_eq!(turns.interrupt_target().as_deref(), Some("greeting"));
        turns.begin("t1");
        assert_eq!(turns.interrupt_target().as_deref(), Some("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn input_resets_strikes_and_deadline() {
        let idle = IdleWatch::default();
        let timeout = Duration::from_secs(5);
        let first = idle.deadline(timeout);
        assert_eq!(idle.strike(), 1);
        assert_eq!(idle.strike(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        idle.touch();
        assert_eq!(idle.deadline(timeout) - first, Duration::from_secs(2));
        assert_eq!(idle.strike(), 1);
    }

    #[test]
    fn finish_reports_elapsed_once_and_releases_the_turn() {
        let turns = Turns::default();
        turns.begin("a");
        assert!(turns.finish("a").is_some());
        assert!(turns.finish("a").is_none());
        assert_eq!(turns.current(), None);
        assert_eq!(turns.begin("b"), None);

        // finishing an older turn leaves the newer one current
        turns.begin("c");
        turns.finish("b");
        assert!(turns.is_current("c"));
    }
}
