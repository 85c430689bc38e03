//! # Talkgate Voice - Utterance Analyzers
//!
//! Decides when the user starts and stops talking. Audio analyzers watch raw frames,
//! text analyzers watch transcripts; both report [`talkgate_core::Activity`] values that
//! the session engine turns into interruptions and turns.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Listen pipeline                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │  Audio frame │ → │  WebRTC VAD  │ → │ Turn tracker │ ──┐    │
//! │  │  (transport) │   │ (30ms, thread)│  │  (800ms gap) │   │    │
//! │  └──────────────┘   └──────────────┘   └──────────────┘   │    │
//! │  ┌──────────────┐   ┌──────────────────────┐              ▼    │
//! │  │  Transcript  │ → │ Silence end-of-speech│ ──────→  Activity │
//! │  │    (STT)     │   │  (resettable timer)  │                   │
//! │  └──────────────┘   └──────────────────────┘                   │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod analyzer;
pub mod audio;
pub mod end_of_speech;
pub mod error;
pub mod turn;
pub mod vad;

pub use analyzer::{AudioAnalyzer, TextAnalyzer, VadAnalyzer};
pub use end_of_speech::SilenceEndOfSpeech;
pub use error::{VoiceError, VoiceResult};
pub use turn::{TurnConfig, TurnTracker};
pub use vad::{EnergyClassifier, FrameClassifier, VadConfig, VadDetector};
