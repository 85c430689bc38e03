//! Voice Activity Detection using WebRTC VAD
//!
//! Frames are classified in fixed 30ms windows, the largest window WebRTC VAD accepts.
//! The WebRTC handle is not `Send`, so detectors are created and used on the analyzer's
//! own thread (see [`crate::analyzer::VadAnalyzer`]).

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
        }
    }
}

impl VadConfig {
    /// Samples in one 30ms window.
    pub fn chunk_size(&self) -> usize {
        (self.sample_rate as usize * 30) / 1000
    }
}

/// Classifies one window of samples as speech or not.
pub trait FrameClassifier {
    /// Speech probability in `0.0..=1.0` for exactly one window.
    fn classify(&mut self, samples: &[i16]) -> VoiceResult<f32>;
}

/// Voice Activity Detector using WebRTC VAD
pub struct VadDetector {
    vad: Vad,
    chunk_size: usize,
}

impl VadDetector {
    /// Create a new VAD detector with the given configuration
    pub fn new(config: &VadConfig) -> VoiceResult<Self> {
        info!(
            sample_rate = config.sample_rate,
            mode = config.mode,
            "🎙️ Initializing WebRTC VAD"
        );

        if config.mode > 3 {
            return Err(VoiceError::Config(format!(
                "VAD mode must be 0-3, got {}",
                config.mode
            )));
        }

        let sample_rate = match config.sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::VadInit(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {other}"
                )))
            }
        };

        let mode = match config.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(sample_rate);

        Ok(Self {
            vad,
            chunk_size: config.chunk_size(),
        })
    }

    /// Get the expected chunk size in samples
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl FrameClassifier for VadDetector {
    fn classify(&mut self, samples: &[i16]) -> VoiceResult<f32> {
        if samples.len() != self.chunk_size {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.chunk_size,
                samples.len()
            )));
        }
        let is_speech = self
            .vad
            .is_voice_segment(samples)
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {e:?}")))?;
        debug!("VAD result: {}", if is_speech { "SPEECH" } else { "SILENCE" });
        Ok(if is_speech { 1.0 } else { 0.0 })
    }
}

/// Energy-threshold classifier, used where WebRTC VAD cannot run (unsupported sample
/// rates) and in deterministic tests.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    /// Normalized RMS energy at and above which a window counts as speech.
    pub threshold: f32,
}

impl FrameClassifier for EnergyClassifier {
    fn classify(&mut self, samples: &[i16]) -> VoiceResult<f32> {
        let energy = crate::audio::rms_energy(samples);
        Ok(if energy >= self.threshold { 1.0 } else { 0.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vad_initialization() {
        let detector = VadDetector::new(&VadConfig::default()).unwrap();
        assert_eq!(detector.chunk_size(), 480); // 30ms at 16kHz
    }

    #[test]
    fn test_invalid_sample_rate() {
        let config = VadConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(VadDetector::new(&config).is_err());
    }

    #[test]
    fn test_chunk_size_validation() {
        let mut detector = VadDetector::new(&VadConfig::default()).unwrap();
        assert!(detector.classify(&[0i16; 100]).is_err());
    }

    #[test]
    fn test_silence_detection() {
        let mut detector = VadDetector::new(&VadConfig::default()).unwrap();
        assert_eq!(detector.classify(&[0i16; 480]).unwrap(), 0.0);
    }

    #[test]
    fn energy_classifier_thresholds() {
        let mut c = EnergyClassifier { threshold: 0.1 };
        assert_eq!(c.classify(&[0; 240]).unwrap(), 0.0);
        assert_eq!(c.classify(&[10_000; 240]).unwrap(), 1.0);
    }
}
