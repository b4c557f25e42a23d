//! # WAV Container Framing
//!
//! Builds and reads the canonical 44-byte RIFF/WAVE header used for telephony prompts.
//!
//! ## Header Layout (all little-endian):
//! ```text
//! 0  "RIFF"  4  riff_size (36 + data)  8  "WAVE"
//! 12 "fmt "  16 16  20 format_tag  22 channels  24 sample_rate
//! 28 byte_rate  32 block_align  34 bits_per_sample
//! 36 "data"  40 data_size  44 payload...
//! ```

use super::codec::AudioConversionError;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Size of the canonical header written by [`frame`].
pub const HEADER_LEN: usize = 44;

/// WAVE_FORMAT_PCM
pub const FORMAT_PCM: u16 = 1;

/// WAVE_FORMAT_MULAW
pub const FORMAT_MULAW: u16 = 7;

/// The format fields carried in a `fmt ` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    pub format_tag: u16,
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
}

impl WavSpec {
    /// 8 kHz, 8-bit, mono mu-law: what the telephony platform plays.
    pub fn telephony_mulaw() -> Self {
        Self {
            format_tag: FORMAT_MULAW,
            sample_rate: super::TELEPHONY_SAMPLE_RATE,
            bit_depth: 8,
            channels: 1,
        }
    }

    #[cfg(test)]
    pub fn pcm(sample_rate: u32, bit_depth: u16, channels: u16) -> Self {
        Self {
            format_tag: FORMAT_PCM,
            sample_rate,
            bit_depth,
            channels,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.channels * (self.bit_depth / 8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    pub fn is_telephony_mulaw(&self) -> bool {
        *self == Self::telephony_mulaw()
    }
}

/// A parsed WAV file: its format plus the raw `data` chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedWav {
    pub spec: WavSpec,
    pub data: Vec<u8>,
}

/// Prepend a canonical 44-byte header to `payload`.
///
/// The result is always exactly `HEADER_LEN + payload.len()` bytes.
pub fn frame(spec: &WavSpec, payload: &[u8]) -> Vec<u8> {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut header[4..8], 36 + payload.len() as u32);
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut header[16..20], 16);
    LittleEndian::write_u16(&mut header[20..22], spec.format_tag);
    LittleEndian::write_u16(&mut header[22..24], spec.channels);
    LittleEndian::write_u32(&mut header[24..28], spec.sample_rate);
    LittleEndian::write_u32(&mut header[28..32], spec.byte_rate());
    LittleEndian::write_u16(&mut header[32..34], spec.block_align());
    LittleEndian::write_u16(&mut header[34..36], spec.bit_depth);
    header[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut header[40..44], payload.len() as u32);

    let mut wav = Vec::with_capacity(HEADER_LEN + payload.len());
    wav.extend_from_slice(&header);
    wav.extend_from_slice(payload);
    wav
}

/// Parse a RIFF/WAVE file, walking chunks until `data` is found.
///
/// Unknown chunks (`LIST`, `fact`, ...) are skipped. A `data` chunk whose declared
/// size runs past the end of the buffer is truncated to what is actually there.
pub fn parse(bytes: &[u8]) -> Result<ParsedWav, AudioConversionError> {
    let malformed = |msg: &str| AudioConversionError::MalformedWav(msg.to_string());

    let mut cursor = Cursor::new(bytes);
    let mut tag = [0u8; 4];

    cursor.read_exact(&mut tag).map_err(|_| malformed("missing RIFF tag"))?;
    if &tag != b"RIFF" {
        return Err(malformed("missing RIFF tag"));
    }
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| malformed("truncated RIFF size"))?;
    cursor.read_exact(&mut tag).map_err(|_| malformed("missing WAVE tag"))?;
    if &tag != b"WAVE" {
        return Err(malformed("missing WAVE tag"));
    }

    let mut spec: Option<WavSpec> = None;
    loop {
        if cursor.read_exact(&mut tag).is_err() {
            return Err(malformed("no data chunk"));
        }
        let size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed("truncated chunk size"))? as usize;
        let start = cursor.position() as usize;

        match &tag {
            b"fmt " => {
                if size < 16 {
                    return Err(malformed("fmt chunk too small"));
                }
                let read = |c: &mut Cursor<&[u8]>| -> std::io::Result<WavSpec> {
                    let format_tag = c.read_u16::<LittleEndian>()?;
                    let channels = c.read_u16::<LittleEndian>()?;
                    let sample_rate = c.read_u32::<LittleEndian>()?;
                    let _byte_rate = c.read_u32::<LittleEndian>()?;
                    let _block_align = c.read_u16::<LittleEndian>()?;
                    let bit_depth = c.read_u16::<LittleEndian>()?;
                    Ok(WavSpec { format_tag, sample_rate, bit_depth, channels })
                };
                spec = Some(read(&mut cursor).map_err(|_| malformed("truncated fmt chunk"))?);
            }
            b"data" => {
                let spec = spec.ok_or_else(|| malformed("data chunk before fmt chunk"))?;
                let end = (start + size).min(bytes.len());
                return Ok(ParsedWav {
                    spec,
                    data: bytes[start..end].to_vec(),
                });
            }
            _ => {}
        }

        // Chunks are word aligned
        let next = start + size + (size & 1);
        if next > bytes.len() {
            return Err(malformed("chunk runs past end of file"));
        }
        cursor.set_position(next as u64);
    }
}
