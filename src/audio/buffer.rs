//! # Caller Utterance Buffer
//!
//! Accumulates caller audio frames into a single utterance so a backend that
//! expects whole utterances is not flooded with 20 ms telephony packets.
//!
//! ## Key Features:
//! - **Speech gate**: leading silence is dropped until the caller starts speaking
//! - **Trailing-silence flush**: once speech has started, the utterance is released
//!   after `silence_duration_ms` of continuous silence
//! - **Size cap**: the utterance is released early when it reaches `max_buffer_bytes`
//!
//! Silence is measured from the frames themselves (samples / sample rate), not the
//! wall clock, so the buffer behaves the same regardless of network jitter.

use super::codec;
use super::{AudioEncoding, AudioFrame};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for utterance buffering behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtteranceBufferConfig {
    /// Hard cap on buffered bytes before a forced flush
    pub max_buffer_bytes: usize,

    /// Peak linear amplitude below which a frame counts as silence
    pub silence_threshold: u16,

    /// Continuous trailing silence that ends an utterance
    pub silence_duration_ms: u64,
}

impl Default for UtteranceBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 160_000, // 20s of 8kHz mu-law
            silence_threshold: 500,
            silence_duration_ms: 2000,
        }
    }
}

/// Per-conversation utterance accumulator.
#[derive(Debug)]
pub struct UtteranceBuffer {
    config: UtteranceBufferConfig,
    data: Vec<u8>,
    template: Option<AudioFrame>,
    waiting_for_speech: bool,
    trailing_silence_ms: u64,
}

impl UtteranceBuffer {
    pub fn new(config: UtteranceBufferConfig) -> Self {
        Self {
            config,
            data: Vec::new(),
            template: None,
            waiting_for_speech: true,
            trailing_silence_ms: 0,
        }
    }

    /// Add a caller frame. Returns a complete utterance once one is ready.
    ///
    /// WAV containers are not buffered; they are returned immediately as-is.
    pub fn push(&mut self, frame: &AudioFrame) -> Option<AudioFrame> {
        if frame.encoding == AudioEncoding::Wav {
            return Some(frame.clone());
        }

        if let Some(template) = &self.template {
            if template.sample_rate != frame.sample_rate
                || template.bit_depth != frame.bit_depth
                || template.encoding != frame.encoding
            {
                warn!(
                    buffered_bytes = self.data.len(),
                    "Caller audio format changed mid-utterance, discarding buffered audio"
                );
                self.reset();
            }
        }

        let silent = self.is_silent(frame);
        if self.waiting_for_speech {
            if silent {
                return None;
            }
            debug!("Speech detected, starting utterance");
            self.waiting_for_speech = false;
        }

        if self.template.is_none() {
            self.template = Some(AudioFrame {
                data: Vec::new(),
                ..frame.clone()
            });
        }
        self.data.extend_from_slice(&frame.data);

        if silent {
            self.trailing_silence_ms += frame.duration_ms();
        } else {
            self.trailing_silence_ms = 0;
        }

        if self.trailing_silence_ms >= self.config.silence_duration_ms {
            debug!(
                bytes = self.data.len(),
                silence_ms = self.trailing_silence_ms,
                "Trailing silence reached, releasing utterance"
            );
            return self.take();
        }
        if self.data.len() >= self.config.max_buffer_bytes {
            warn!(
                bytes = self.data.len(),
                limit = self.config.max_buffer_bytes,
                "Utterance buffer limit reached, releasing early"
            );
            return self.take();
        }
        None
    }

    /// Release whatever has been buffered so far (e.g. on conversation end).
    pub fn take(&mut self) -> Option<AudioFrame> {
        let template = self.template.take()?;
        let data = std::mem::take(&mut self.data);
        self.reset();
        Some(AudioFrame { data, ..template })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn reset(&mut self) {
        self.data.clear();
        self.template = None;
        self.waiting_for_speech = true;
        self.trailing_silence_ms = 0;
    }

    fn is_silent(&self, frame: &AudioFrame) -> bool {
        let samples = codec::decode_samples(
            &frame.data,
            frame.bit_depth,
            frame.encoding == AudioEncoding::Mulaw,
        );
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        peak < self.config.silence_threshold
    }
}
