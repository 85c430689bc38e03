//! Audio format negotiated once per session.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM.
    Linear16,
    Mulaw,
    Alaw,
}

impl AudioEncoding {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::Linear16 => 2,
            AudioEncoding::Mulaw | AudioEncoding::Alaw => 1,
        }
    }
}

/// Sample-rate/encoding contract. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            encoding: AudioEncoding::Linear16,
            channels: 1,
        }
    }
}

impl AudioConfig {
    /// Telephony default: 8kHz mu-law mono.
    pub fn telephony() -> Self {
        Self {
            sample_rate: 8000,
            encoding: AudioEncoding::Mulaw,
            channels: 1,
        }
    }

    /// Playback duration of `len` bytes in this format.
    pub fn duration_of(&self, len: usize) -> Duration {
        let bytes_per_second =
            self.sample_rate as u64 * self.channels as u64 * self.encoding.bytes_per_sample() as u64;
        if bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(len as u64 * 1_000_000_000 / bytes_per_second)
    }

    /// Bytes played in `duration`, rounded down to a whole sample frame.
    pub fn bytes_in(&self, duration: Duration) -> usize {
        let frame = self.channels as usize * self.encoding.bytes_per_sample();
        if frame == 0 {
            return 0;
        }
        let bytes_per_second = self.sample_rate as u128 * frame as u128;
        let bytes = (duration.as_nanos() * bytes_per_second / 1_000_000_000) as usize;
        bytes - bytes % frame
    }
}
