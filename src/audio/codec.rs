//! # Audio Codec Pipeline
//!
//! Stateless transforms that turn backend speech into something the telephony
//! platform can play: 16 kHz → 8 kHz decimation, G.711 mu-law companding and
//! WAV framing, composed by [`normalize`].
//!
//! ## Key Rust Concepts:
//! - **Pure functions**: no shared state, identical input always gives identical output
//! - **Tagged results**: [`Normalized`] makes the pass-through fallback explicit instead of
//!   hiding it behind an exception or a sentinel value
//!
//! ## Fidelity note:
//! Decimation keeps every second sample with no anti-aliasing filter. Content above
//! 4 kHz folds back into the audible band; this is acceptable for telephony speech.

use super::wav::{self, WavSpec};
use super::TELEPHONY_SAMPLE_RATE;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, warn};

pub const PCM_CONTENT_TYPE: &str = "audio/pcm";
pub const WAV_CONTENT_TYPE: &str = "audio/wav";

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Why a buffer could not be converted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioConversionError {
    #[error("audio buffer is empty")]
    Empty,

    #[error("odd-length buffer of {0} bytes cannot hold 16-bit samples")]
    OddLength(usize),

    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("unsupported source sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("malformed WAV container: {0}")]
    MalformedWav(String),
}

/// Outcome of [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    /// Telephony-ready WAV (8 kHz, 8-bit mu-law)
    Converted {
        bytes: Vec<u8>,
        content_type: &'static str,
    },
    /// Conversion failed; the original bytes are handed through untouched
    Passthrough {
        bytes: Vec<u8>,
        content_type: &'static str,
        reason: AudioConversionError,
    },
}

impl Normalized {
    #[cfg(test)]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Normalized::Converted { bytes, .. } | Normalized::Passthrough { bytes, .. } => bytes,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Normalized::Converted { content_type, .. }
            | Normalized::Passthrough { content_type, .. } => content_type,
        }
    }

    #[cfg(test)]
    pub fn is_converted(&self) -> bool {
        matches!(self, Normalized::Converted { .. })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Normalized::Converted { bytes, .. } | Normalized::Passthrough { bytes, .. } => bytes,
        }
    }
}

/// Halve the sample rate by keeping every second sample.
///
/// - Empty input returns empty output.
/// - 16-bit input must have an even byte length.
/// - 8-bit input keeps every second byte.
pub fn resample_16k_to_8k(pcm: &[u8], bit_depth: u16) -> Result<Vec<u8>, AudioConversionError> {
    if pcm.is_empty() {
        return Ok(Vec::new());
    }
    match bit_depth {
        16 => {
            if pcm.len() % 2 != 0 {
                return Err(AudioConversionError::OddLength(pcm.len()));
            }
            // Each 4-byte chunk holds two samples; the trailing chunk may hold one
            Ok(pcm.chunks(4).flat_map(|pair| pair[..2].iter().copied()).collect())
        }
        8 => Ok(pcm.iter().step_by(2).copied().collect()),
        other => Err(AudioConversionError::UnsupportedBitDepth(other)),
    }
}

/// Encode one signed 16-bit sample as a G.711 mu-law byte.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };

    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent: i32 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode one G.711 mu-law byte back to linear.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let inverted = !byte as i32;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = inverted & 0x0F;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if inverted & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compand a linear PCM buffer into mu-law, one output byte per input sample.
///
/// 8-bit input is treated as unsigned and widened with `(s - 128) * 256` first.
pub fn pcm_to_mulaw(pcm: &[u8], bit_depth: u16) -> Result<Vec<u8>, AudioConversionError> {
    match bit_depth {
        16 => {
            if pcm.len() % 2 != 0 {
                return Err(AudioConversionError::OddLength(pcm.len()));
            }
            let mut cursor = Cursor::new(pcm);
            let mut encoded = Vec::with_capacity(pcm.len() / 2);
            while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
                encoded.push(linear_to_mulaw(sample));
            }
            Ok(encoded)
        }
        8 => Ok(pcm
            .iter()
            .map(|&s| linear_to_mulaw((s as i16 - 128) * 256))
            .collect()),
        other => Err(AudioConversionError::UnsupportedBitDepth(other)),
    }
}

/// Decode any linear or mu-law buffer to signed 16-bit samples (used for level checks).
pub fn decode_samples(data: &[u8], bit_depth: u16, mulaw: bool) -> Vec<i16> {
    if mulaw {
        return data.iter().map(|&b| mulaw_to_linear(b)).collect();
    }
    match bit_depth {
        16 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect(),
        8 => data.iter().map(|&s| (s as i16 - 128) * 256).collect(),
        _ => Vec::new(),
    }
}

/// Convert backend PCM into an 8 kHz mu-law WAV ready for playback.
///
/// Never fails: any conversion error is logged and the input comes back as
/// [`Normalized::Passthrough`] with content type `audio/pcm`.
pub fn normalize(pcm: &[u8], source_rate: u32, bit_depth: u16) -> Normalized {
    match convert(pcm, source_rate, bit_depth) {
        Ok(bytes) => {
            debug!(
                input_bytes = pcm.len(),
                output_bytes = bytes.len(),
                source_rate,
                bit_depth,
                "Normalized backend audio to 8kHz mu-law WAV"
            );
            Normalized::Converted {
                bytes,
                content_type: WAV_CONTENT_TYPE,
            }
        }
        Err(reason) => {
            warn!(
                input_bytes = pcm.len(),
                source_rate,
                bit_depth,
                error = %reason,
                "Audio conversion failed, passing original bytes through"
            );
            Normalized::Passthrough {
                bytes: pcm.to_vec(),
                content_type: PCM_CONTENT_TYPE,
                reason,
            }
        }
    }
}

fn convert(pcm: &[u8], source_rate: u32, bit_depth: u16) -> Result<Vec<u8>, AudioConversionError> {
    if pcm.is_empty() {
        return Err(AudioConversionError::Empty);
    }
    let decimated = match source_rate {
        16000 => resample_16k_to_8k(pcm, bit_depth)?,
        TELEPHONY_SAMPLE_RATE => pcm.to_vec(),
        other => return Err(AudioConversionError::UnsupportedSampleRate(other)),
    };
    let companded = pcm_to_mulaw(&decimated, bit_depth)?;
    Ok(wav::frame(&WavSpec::telephony_mulaw(), &companded))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_resample_is_pure_and_keeps_even_samples() {
        let input = pcm16(&[1, 2, 3, 4, 5]);
        let first = resample_16k_to_8k(&input, 16).unwrap();
        assert_eq!(first, resample_16k_to_8k(&input, 16).unwrap());
        assert_eq!(first, pcm16(&[1, 3, 5]));
    }

    #[test]
    fn test_resample_empty_input() {
        assert_eq!(resample_16k_to_8k(&[], 16), Ok(Vec::new()));
        assert_eq!(resample_16k_to_8k(&[], 8), Ok(Vec::new()));
    }

    #[test]
    fn test_resample_odd_length_16bit_is_error() {
        assert_eq!(
            resample_16k_to_8k(&[1, 2, 3], 16),
            Err(AudioConversionError::OddLength(3))
        );
    }

    #[test]
    fn test_resample_8bit() {
        assert_eq!(resample_16k_to_8k(&[10, 11, 12, 13, 14], 8).unwrap(), vec![10, 12, 14]);
    }

    #[test]
    fn test_mulaw_known_values() {
        assert_eq!(linear_to_mulaw(0), 0xFF);
        assert_eq!(linear_to_mulaw(32767), 0x80);
        assert_eq!(linear_to_mulaw(-32768), 0x00);
        assert_eq!(linear_to_mulaw(-1), 0x7F);
    }

    #[test]
    fn test_mulaw_is_deterministic_and_length_preserving() {
        let samples: Vec<i16> = (-50..50).map(|i| i * 600).collect();
        let input = pcm16(&samples);
        let encoded = pcm_to_mulaw(&input, 16).unwrap();
        assert_eq!(encoded.len(), samples.len());
        assert_eq!(encoded, pcm_to_mulaw(&input, 16).unwrap());
    }

    #[test]
    fn test_mulaw_decode_tracks_input() {
        assert_eq!(mulaw_to_linear(0xFF), 0);
        for sample in [-20000i16, -1000, -50, 0, 50, 1000, 20000] {
            let decoded = mulaw_to_linear(linear_to_mulaw(sample)) as i32;
            let error = (decoded - sample as i32).abs();
            // Quantisation step grows with magnitude; 1/16 of the value plus the bias floor
            assert!(error <= (sample as i32).abs() / 16 + 8, "{sample} -> {decoded}");
        }
    }

    #[test]
    fn test_8bit_pcm_widening() {
        // 128 is the unsigned midpoint, i.e. silence
        assert_eq!(pcm_to_mulaw(&[128, 128], 8).unwrap(), vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_normalize_16k_scenario() {
        // 16000 bytes = 8000 samples at 16 kHz -> 4000 samples -> 4000 mu-law bytes
        let pcm = vec![0x10; 16000];
        let result = normalize(&pcm, 16000, 16);
        assert!(result.is_converted());
        assert_eq!(result.content_type(), "audio/wav");
        assert_eq!(result.bytes().len(), 4044);

        let parsed = wav::parse(result.bytes()).unwrap();
        assert!(parsed.spec.is_telephony_mulaw());
        assert_eq!(parsed.data.len(), 4000);
    }

    #[test]
    fn test_normalize_8000_byte_reply() {
        let pcm = vec![0x10; 8000];
        assert_eq!(resample_16k_to_8k(&pcm, 16).unwrap().len(), 4000);
        assert_eq!(normalize(&pcm, 16000, 16).bytes().len(), 2044);
    }

    #[test]
    fn test_normalize_8k_skips_resampling() {
        let pcm = pcm16(&[0; 100]);
        let result = normalize(&pcm, 8000, 16);
        assert_eq!(result.bytes().len(), wav::HEADER_LEN + 100);
    }

    #[test]
    fn test_normalize_never_fails() {
        let odd = normalize(&[1, 2, 3], 16000, 16);
        assert_eq!(
            odd,
            Normalized::Passthrough {
                bytes: vec![1, 2, 3],
                content_type: "audio/pcm",
                reason: AudioConversionError::OddLength(3),
            }
        );

        let empty = normalize(&[], 16000, 16);
        assert!(!empty.is_converted());
        assert!(empty.bytes().is_empty());

        let rate = normalize(&[0, 0], 44100, 16);
        assert_eq!(rate.content_type(), "audio/pcm");

        let depth = normalize(&[0, 0, 0], 16000, 24);
        assert_eq!(depth.into_bytes(), vec![0, 0, 0]);
    }
}
