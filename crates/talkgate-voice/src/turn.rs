//! Turn-taking state for the VAD analyzer.
//!
//! Converts per-window speech decisions into `SpeechStart` / `SpeechEnd` activities.
//! Time is measured in audio time (samples seen so far), not wall-clock time, so results
//! do not depend on how fast frames arrive.

use std::time::Duration;
use talkgate_core::Activity;
use tracing::{debug, info, warn};

/// Configuration for turn detection
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Silence duration before a turn ends (default: 800ms)
    pub silence_threshold: Duration,

    /// Continuous speech needed before a turn starts (default: 200ms)
    pub min_speech_duration: Duration,

    /// Maximum turn duration before the turn is forcibly ended (default: 30s)
    pub max_turn_duration: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_millis(800),
            min_speech_duration: Duration::from_millis(200),
            max_turn_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TurnState {
    Idle,
    /// Speech seen, not yet long enough to count.
    Candidate { since: f64 },
    Speaking { since: f64 },
    SilenceDetected { since: f64, silent_from: f64 },
}

/// One classified window.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub start: f64,
    pub end: f64,
    pub probability: f32,
    pub energy: f32,
}

/// Tracks one speaker's turns.
pub struct TurnTracker {
    config: TurnConfig,
    threshold: f32,
    state: TurnState,
    peak_energy: f32,
}

impl TurnTracker {
    pub fn new(config: TurnConfig, threshold: f32) -> Self {
        Self {
            config,
            threshold,
            state: TurnState::Idle,
            peak_energy: 0.0,
        }
    }

    /// Feed one window and return the activity it completes, if any.
    pub fn process(&mut self, window: Window) -> Option<Activity> {
        let is_speech = window.probability > self.threshold;
        let min_speech = self.config.min_speech_duration.as_secs_f64();
        let silence = self.config.silence_threshold.as_secs_f64();

        match (self.state, is_speech) {
            (TurnState::Idle, true) => {
                self.peak_energy = window.energy;
                self.state = TurnState::Candidate {
                    since: window.start,
                };
                self.promote(window, min_speech)
            }
            (TurnState::Idle, false) => None,

            (TurnState::Candidate { .. }, true) => {
                self.peak_energy = self.peak_energy.max(window.energy);
                self.promote(window, min_speech)
            }
            (TurnState::Candidate { .. }, false) => {
                debug!("speech candidate too short, discarded");
                self.state = TurnState::Idle;
                None
            }

            (TurnState::Speaking { since }, true) => {
                if window.end - since >= self.config.max_turn_duration.as_secs_f64() {
                    warn!("⏱️ Max turn duration reached, ending turn");
                    self.state = TurnState::Idle;
                    return Some(Activity::SpeechEnd {
                        start_at: since,
                        end_at: window.end,
                        transcript: String::new(),
                    });
                }
                None
            }
            (TurnState::Speaking { since }, false) => {
                self.state = TurnState::SilenceDetected {
                    since,
                    silent_from: window.start,
                };
                self.end_if_silent(window, silence)
            }

            (TurnState::SilenceDetected { since, .. }, true) => {
                debug!("🎤 Speech resumed");
                self.state = TurnState::Speaking { since };
                None
            }
            (TurnState::SilenceDetected { .. }, false) => self.end_if_silent(window, silence),
        }
    }

    fn promote(&mut self, window: Window, min_speech: f64) -> Option<Activity> {
        let TurnState::Candidate { since } = self.state else {
            return None;
        };
        if window.end - since + f64::EPSILON < min_speech {
            return None;
        }
        info!(start_at = since, "🎤 Speech started");
        self.state = TurnState::Speaking { since };
        Some(Activity::SpeechStart {
            energy: self.peak_energy,
            confidence: window.probability,
            start_at: since,
        })
    }

    fn end_if_silent(&mut self, window: Window, silence: f64) -> Option<Activity> {
        let TurnState::SilenceDetected { since, silent_from } = self.state else {
            return None;
        };
        if window.end - silent_from + f64::EPSILON < silence {
            return None;
        }
        info!(start_at = since, end_at = silent_from, "✅ Silence threshold reached, ending turn");
        self.state = TurnState::Idle;
        Some(Activity::SpeechEnd {
            start_at: since,
            end_at: silent_from,
            transcript: String::new(),
        })
    }

    pub fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.peak_energy = 0.0;
    }
}
