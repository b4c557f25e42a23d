//! # Local Playback Connector
//!
//! A backend that needs no network: it answers with canned prompt files.
//!
//! | caller input  | reply                                 |
//! |---------------|---------------------------------------|
//! | start         | welcome prompt, barge-in disabled     |
//! | DTMF `5`      | transfer prompt, status transfer      |
//! | DTMF `6`      | goodbye prompt, status goodbye        |
//! | anything else | silence                               |
//!
//! Prompts are read once at construction. Files already in 8 kHz mu-law WAV are
//! played verbatim; linear PCM WAV files are converted through the codec pipeline.

use super::{AgentInfo, CallerInput, Connector, ConnectorError, ConnectorResponse, ReplyStatus, SessionContext};
use crate::audio::codec::{self, Normalized};
use crate::audio::wav::{self, FORMAT_PCM};
use crate::audio::{AudioEncoding, AudioFrame};
use crate::config::{ConnectorConfig, LocalPlaybackConfig};
use crate::error::{AppResult, GatewayError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const TRANSFER_TEXT: &str = "Transferring you to an agent. Please wait.";
const GOODBYE_TEXT: &str = "Thank you for calling. Goodbye!";

struct Prompts {
    welcome: AudioFrame,
    transfer: AudioFrame,
    goodbye: AudioFrame,
    error: AudioFrame,
}

pub struct LocalPlaybackConnector {
    name: String,
    agent_id: String,
    is_default: bool,
    welcome_text: String,
    prompts: Prompts,
}

pub(super) fn construct(config: &ConnectorConfig) -> AppResult<Arc<dyn Connector>> {
    match config {
        ConnectorConfig::LocalPlayback(local) => Ok(Arc::new(LocalPlaybackConnector::new(local))),
        other => Err(GatewayError::Configuration(format!(
            "connector '{}' is not a local playback connector",
            other.name()
        ))),
    }
}

impl LocalPlaybackConnector {
    pub fn new(config: &LocalPlaybackConfig) -> Self {
        let base = config.audio_base_path.as_path();
        let prompts = Prompts {
            welcome: load_prompt(base, &config.prompts.welcome),
            transfer: load_prompt(base, &config.prompts.transfer),
            goodbye: load_prompt(base, &config.prompts.goodbye),
            error: load_prompt(base, &config.prompts.error),
        };
        info!(
            connector = %config.name,
            agent_id = %config.agent_id,
            base_path = %base.display(),
            "Local playback connector ready"
        );
        Self {
            name: config.name.clone(),
            agent_id: config.agent_id.clone(),
            is_default: config.is_default,
            welcome_text: config.welcome_text.clone(),
            prompts,
        }
    }
}

/// Read one prompt file. Missing or unreadable files become empty audio.
fn load_prompt(base: &Path, file: &str) -> AudioFrame {
    let path = base.join(file);
    match std::fs::read(&path) {
        Ok(bytes) => prepare_prompt(&path, bytes),
        Err(err) => {
            error!(path = %path.display(), error = %err, "Prompt file unavailable, using empty audio");
            AudioFrame::telephony_wav(Vec::new())
        }
    }
}

fn prepare_prompt(path: &Path, bytes: Vec<u8>) -> AudioFrame {
    let parsed = match wav::parse(&bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Prompt is not a WAV file, playing as-is");
            return AudioFrame::telephony_wav(bytes);
        }
    };

    if parsed.spec.is_telephony_mulaw() {
        return AudioFrame::telephony_wav(bytes);
    }

    if parsed.spec.format_tag == FORMAT_PCM && parsed.spec.channels == 1 {
        match codec::normalize(&parsed.data, parsed.spec.sample_rate, parsed.spec.bit_depth) {
            Normalized::Converted { bytes: converted, .. } => {
                debug!(path = %path.display(), "Converted prompt to 8kHz mu-law");
                return AudioFrame::telephony_wav(converted);
            }
            Normalized::Passthrough { reason, .. } => {
                warn!(path = %path.display(), error = %reason, "Prompt could not be converted, playing as-is");
            }
        }
    } else {
        warn!(
            path = %path.display(),
            format = parsed.spec.format_tag,
            channels = parsed.spec.channels,
            "Unsupported prompt format, playing as-is"
        );
    }

    AudioFrame {
        data: bytes,
        sample_rate: parsed.spec.sample_rate,
        bit_depth: parsed.spec.bit_depth,
        channels: parsed.spec.channels,
        encoding: AudioEncoding::Wav,
    }
}

#[async_trait]
impl Connector for LocalPlaybackConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_agents(&self) -> Vec<AgentInfo> {
        vec![AgentInfo {
            agent_id: self.agent_id.clone(),
            display_name: self.agent_id.clone(),
            is_default: self.is_default,
        }]
    }

    async fn start(&self, ctx: &SessionContext) -> Result<ConnectorResponse, ConnectorError> {
        info!(conversation_id = %ctx.conversation_id, "Playing welcome prompt");
        Ok(ConnectorResponse::speak(
            self.welcome_text.clone(),
            self.prompts.welcome.clone(),
            ReplyStatus::Continue,
        ))
    }

    async fn send(
        &self,
        ctx: &SessionContext,
        input: CallerInput,
    ) -> Result<ConnectorResponse, ConnectorError> {
        match input {
            CallerInput::Dtmf(digits) if digits == "5" => {
                info!(conversation_id = %ctx.conversation_id, "DTMF 5, transferring caller");
                Ok(ConnectorResponse::speak(TRANSFER_TEXT, self.prompts.transfer.clone(), ReplyStatus::Transfer))
            }
            CallerInput::Dtmf(digits) if digits == "6" => {
                info!(conversation_id = %ctx.conversation_id, "DTMF 6, ending call");
                Ok(ConnectorResponse::speak(GOODBYE_TEXT, self.prompts.goodbye.clone(), ReplyStatus::Goodbye))
            }
            CallerInput::Dtmf(digits) => {
                info!(conversation_id = %ctx.conversation_id, %digits, "DTMF digits entered");
                Ok(ConnectorResponse::silence())
            }
            CallerInput::Event { name } => {
                info!(conversation_id = %ctx.conversation_id, event = %name, "Caller event");
                Ok(ConnectorResponse::silence())
            }
            CallerInput::Audio(frame) => {
                debug!(conversation_id = %ctx.conversation_id, bytes = frame.data.len(), "Caller audio ignored");
                Ok(ConnectorResponse::silence())
            }
        }
    }

    async fn end(&self, ctx: &SessionContext) -> Result<(), ConnectorError> {
        debug!(conversation_id = %ctx.conversation_id, "Local playback session ended");
        Ok(())
    }

    fn fallback_audio(&self) -> Option<AudioFrame> {
        Some(self.prompts.error.clone()).filter(|frame| !frame.is_empty())
    }
}
