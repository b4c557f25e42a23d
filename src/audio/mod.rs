//! # Audio Module
//!
//! Everything the gateway does with raw audio bytes lives here:
//! - **codec**: resampling, G.711 mu-law companding and the `normalize` pipeline
//! - **wav**: canonical 44-byte RIFF/WAVE framing and parsing
//! - **buffer**: caller-utterance buffering with trailing-silence detection
//!
//! ## Key Rust Concepts Used:
//! - **Pure functions**: the codec never touches shared state, so it is safe to call from any task
//! - **Enums with data**: `AudioEncoding` tags what the bytes in an `AudioFrame` actually are

pub mod buffer;
pub mod codec;
pub mod wav;

use serde::{Deserialize, Serialize};

/// Sample rate the telephony platform plays back (8 kHz).
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// What kind of bytes an [`AudioFrame`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Little-endian linear PCM (8-bit unsigned or 16-bit signed)
    Linear,
    /// Headerless G.711 mu-law
    Mulaw,
    /// A complete RIFF/WAVE container
    Wav,
}

impl AudioEncoding {
    /// MIME type reported to the caller for this encoding.
    pub fn content_type(&self) -> &'static str {
        match self {
            AudioEncoding::Linear => codec::PCM_CONTENT_TYPE,
            AudioEncoding::Mulaw => "audio/basic",
            AudioEncoding::Wav => codec::WAV_CONTENT_TYPE,
        }
    }
}

/// A chunk of audio plus the format needed to interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
    pub encoding: AudioEncoding,
}

impl AudioFrame {
    /// 8 kHz, 8-bit, mono mu-law as delivered by the telephony platform.
    pub fn telephony_mulaw(data: Vec<u8>) -> Self {
        Self {
            data,
            sample_rate: TELEPHONY_SAMPLE_RATE,
            bit_depth: 8,
            channels: 1,
            encoding: AudioEncoding::Mulaw,
        }
    }

    /// A WAV container already framed for telephony playback.
    pub fn telephony_wav(data: Vec<u8>) -> Self {
        Self {
            data,
            sample_rate: TELEPHONY_SAMPLE_RATE,
            bit_depth: 8,
            channels: 1,
            encoding: AudioEncoding::Wav,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn content_type(&self) -> &'static str {
        self.encoding.content_type()
    }

    /// Playback length in milliseconds (0 for WAV containers and malformed formats).
    pub fn duration_ms(&self) -> u64 {
        let bytes_per_sample = (self.bit_depth as u64 / 8) * self.channels.max(1) as u64;
        if self.encoding == AudioEncoding::Wav || bytes_per_sample == 0 || self.sample_rate == 0 {
            return 0;
        }
        let samples = self.data.len() as u64 / bytes_per_sample;
        samples * 1000 / self.sample_rate as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telephony_frame_duration() {
        let frame = AudioFrame::telephony_mulaw(vec![0xFF; 8000]);
        assert_eq!(frame.duration_ms(), 1000);
        assert_eq!(frame.content_type(), "audio/basic");
    }

    #[test]
    fn test_wav_frame_has_no_duration() {
        let frame = AudioFrame::telephony_wav(vec![0; 100]);
        assert_eq!(frame.duration_ms(), 0);
        assert_eq!(frame.content_type(), "audio/wav");
    }
}
