//! Frame decoding for the analyzers.
//!
//! Transports hand the engine raw bytes in the session's negotiated encoding; the VAD
//! works on signed 16-bit samples.

use crate::error::{VoiceError, VoiceResult};
use talkgate_core::AudioEncoding;

/// Decode one transport frame into 16-bit samples.
pub fn decode_samples(frame: &[u8], encoding: AudioEncoding) -> VoiceResult<Vec<i16>> {
    match encoding {
        AudioEncoding::Linear16 => {
            if frame.len() % 2 != 0 {
                return Err(VoiceError::AudioFormat(format!(
                    "linear16 frame has odd length {}",
                    frame.len()
                )));
            }
            Ok(frame
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect())
        }
        AudioEncoding::Mulaw => Ok(frame.iter().map(|&b| mulaw_to_linear(b)).collect()),
        AudioEncoding::Alaw => Ok(frame.iter().map(|&b| alaw_to_linear(b)).collect()),
    }
}

fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0f) as i32;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let exponent = ((a >> 4) & 0x07) as i32;
    let mantissa = (a & 0x0f) as i32;
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    if a & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Root-mean-square energy normalized to `0.0..=1.0`.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum / samples.len() as f64).sqrt() / i16::MAX as f64).min(1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear16_is_little_endian() {
        let samples = decode_samples(&[0x01, 0x00, 0xff, 0xff], AudioEncoding::Linear16).unwrap();
        assert_eq!(samples, vec![1, -1]);
        assert!(decode_samples(&[0x01], AudioEncoding::Linear16).is_err());
    }

    #[test]
    fn g711_silence_decodes_near_zero() {
        // 0xff is mu-law digital silence, 0xd5 is A-law digital silence.
        assert_eq!(decode_samples(&[0xff], AudioEncoding::Mulaw).unwrap(), vec![0]);
        assert_eq!(decode_samples(&[0xd5], AudioEncoding::Alaw).unwrap(), vec![8]);
        let loud = decode_samples(&[0x80], AudioEncoding::Mulaw).unwrap();
        assert!(loud[0] > 30000);
    }

    #[test]
    fn energy_of_silence_and_full_scale() {
        assert_eq!(rms_energy(&[0; 160]), 0.0);
        assert!(rms_energy(&[i16::MAX; 160]) > 0.99);
    }
}
