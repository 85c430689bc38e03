//! Captures both sides of the call for the conversation recording.

use std::sync::{Mutex, PoisonError};
use talkgate_core::AudioConfig;
use tokio::time::Instant;
use tracing::debug;

/// Assistant audio is assumed to play back-to-back in real time from the moment it is
/// sent, so an interruption can cut off whatever the caller never heard.
pub(crate) struct Recorder {
    format: AudioConfig,
    tracks: Mutex<Tracks>,
}

#[derive(Default)]
struct Tracks {
    user: Vec<u8>,
    assistant: Vec<Segment>,
}

struct Segment {
    data: Vec<u8>,
    plays_at: Instant,
}

impl Recorder {
    pub(crate) fn new(format: AudioConfig) -> Self {
        Self {
            format,
            tracks: Mutex::new(Tracks::default()),
        }
    }

    pub(crate) fn user(&self, frame: &[u8]) {
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .user
            .extend_from_slice(frame);
    }

    pub(crate) fn assistant(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut tracks = self.tracks.lock().unwrap_or_else(PoisonError::into_inner);
        let plays_at = tracks
            .assistant
            .last()
            .map(|last| last.plays_at + self.format.duration_of(last.data.len()))
            .map_or(now, |queued| queued.max(now));
        tracks.assistant.push(Segment {
            data: chunk.to_vec(),
            plays_at,
        });
    }

    /// Drop assistant audio the caller talked over: the segment playing now is cut at the
    /// current position and queued segments are discarded.
    pub(crate) fn interrupt(&self) {
        let now = Instant::now();
        let mut tracks = self.tracks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = tracks.assistant.len();
        tracks.assistant.retain(|segment| segment.plays_at < now);
        let dropped = before - tracks.assistant.len();

        let mut cut = 0;
        if let Some(playing) = tracks.assistant.last_mut() {
            let heard = self.format.bytes_in(now - playing.plays_at);
            if heard < playing.data.len() {
                cut = playing.data.len() - heard;
                playing.data.truncate(heard);
            }
        }
        debug!(dropped, cut, "assistant audio trimmed at interruption");
    }

    /// `(user, assistant)` audio captured so far, leaving the recorder empty.
    pub(crate) fn take(&self) -> (Vec<u8>, Vec<u8>) {
        let mut tracks = self.tracks.lock().unwrap_or_else(PoisonError::into_inner);
        let user = std::mem::take(&mut tracks.user);
        let assistant = std::mem::take(&mut tracks.assistant)
            .into_iter()
            .flat_map(|segment| segment.data)
            .collect();
        (user, assistant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // 1s of 16kHz 16-bit mono
    const SECOND: usize = 32_000;

    #[tokio::test(start_paused = true)]
    async fn both_sides_are_kept_in_arrival_order() {
        let recorder = Recorder::new(AudioConfig::default());
        recorder.user(&[1, 2]);
        recorder.assistant(&[9; 4]);
        recorder.user(&[3]);
        recorder.assistant(&[]);

        assert_eq!(recorder.take(), (vec![1, 2, 3], vec![9; 4]));
        assert_eq!(recorder.take(), (Vec::new(), Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_cuts_what_was_not_heard() {
        let recorder = Recorder::new(AudioConfig::default());
        recorder.assistant(&vec![1; SECOND]);
        recorder.assistant(&vec![2; SECOND]);

        // half way through the first second
        tokio::time::advance(Duration::from_millis(500)).await;
        recorder.interrupt();

        let (_, assistant) = recorder.take();
        assert_eq!(assistant, vec![1; SECOND / 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_after_an_interruption_plays_from_then() {
        let recorder = Recorder::new(AudioConfig::default());
        recorder.assistant(&vec![1; SECOND]);
        tokio::time::advance(Duration::from_millis(250)).await;
        recorder.interrupt();

        recorder.assistant(&vec![2; SECOND]);
        tokio::time::advance(Duration::from_secs(2)).await;
        // everything already played out
        recorder.interrupt();

        let (_, assistant) = recorder.take();
        assert_eq!(assistant.len(), SECOND / 4 + SECOND);
        assert!(assistant[SECOND / 4..].iter().all(|b| *b == 2));
    }
}
