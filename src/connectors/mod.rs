//! # Backend Connectors
//!
//! A connector adapts one virtual-agent backend to the gateway's common
//! start / send / end / list_agents contract.
//!
//! ## Key Rust Concepts:
//! - **Trait objects**: the router holds `Arc<dyn Connector>`, so backends are chosen
//!   at runtime from configuration without the gateway knowing their concrete types
//! - **async-trait**: lets the trait declare `async fn` methods and stay object safe
//! - **Static registry**: connectors are built from a type-tag → constructor table;
//!   adding a backend means adding one row to [`REGISTRY`]

pub mod external;
pub mod local;

use crate::audio::AudioFrame;
use crate::config::ConnectorConfig;
use crate::error::{AppResult, GatewayError};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// One agent a connector can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub display_name: String,
    pub is_default: bool,
}

/// Identifies the conversation a connector call belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub conversation_id: String,
    pub agent_id: String,
    pub customer_org_id: String,
}

/// Caller input forwarded to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerInput {
    Audio(AudioFrame),
    Dtmf(String),
    Event { name: String },
}

impl CallerInput {
    pub fn kind(&self) -> &'static str {
        match self {
            CallerInput::Audio(_) => "audio",
            CallerInput::Dtmf(_) => "dtmf",
            CallerInput::Event { .. } => "event",
        }
    }
}

/// Where the backend wants the conversation to go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// The bot spoke (or will speak) and expects more input
    Continue,
    /// Nothing to say for this input
    Silence,
    /// Hand the caller over to a human agent
    Transfer,
    /// The bot ended the call
    Goodbye,
}

impl ReplyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplyStatus::Transfer | ReplyStatus::Goodbye)
    }
}

/// A backend's answer to start or send.
///
/// Audio with [`crate::audio::AudioEncoding::Linear`] is raw PCM and gets normalized by
/// the gateway; WAV and mu-law audio are played as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorResponse {
    pub text: Option<String>,
    pub audio: Option<AudioFrame>,
    pub barge_in: bool,
    pub status: ReplyStatus,
}

impl ConnectorResponse {
    pub fn silence() -> Self {
        Self {
            text: None,
            audio: None,
            barge_in: false,
            status: ReplyStatus::Silence,
        }
    }

    pub fn speak(text: impl Into<String>, audio: AudioFrame, status: ReplyStatus) -> Self {
        Self {
            text: Some(text.into()),
            audio: Some(audio),
            barge_in: false,
            status,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("no backend session for conversation '{0}'")]
    UnknownSession(String),

    #[error("agent '{0}' is not served by this connector")]
    UnknownAgent(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Capability interface every backend implements.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Configured connector name (for logs and the monitoring snapshot).
    fn name(&self) -> &str;

    /// Agents this connector serves. Discovery failures yield an empty list.
    async fn list_agents(&self) -> Vec<AgentInfo>;

    /// Open a backend session and return the greeting, if any.
    async fn start(&self, ctx: &SessionContext) -> Result<ConnectorResponse, ConnectorError>;

    /// Forward caller input and return the backend's reply.
    async fn send(
        &self,
        ctx: &SessionContext,
        input: CallerInput,
    ) -> Result<ConnectorResponse, ConnectorError>;

    /// Close the backend session and release its resources.
    async fn end(&self, ctx: &SessionContext) -> Result<(), ConnectorError>;

    /// Audio to play alongside a generic error message.
    fn fallback_audio(&self) -> Option<AudioFrame> {
        None
    }
}

type Constructor = fn(&ConnectorConfig) -> AppResult<Arc<dyn Connector>>;

/// Type tag → constructor.
const REGISTRY: &[(&str, Constructor)] = &[
    ("local_playback", local::construct),
    ("external_voice_ai", external::construct),
];

/// Build the connector described by `config`.
pub fn build_connector(config: &ConnectorConfig) -> AppResult<Arc<dyn Connector>> {
    let tag = config.type_tag();
    let (_, construct) = REGISTRY
        .iter()
        .find(|(registered, _)| *registered == tag)
        .ok_or_else(|| {
            GatewayError::Configuration(format!("no connector registered for type '{}'", tag))
        })?;
    construct(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExternalVoiceAiConfig, LocalPlaybackConfig};

    #[test]
    fn test_registry_builds_each_type() {
        let dir = tempfile::tempdir().unwrap();
        let local = ConnectorConfig::LocalPlayback(LocalPlaybackConfig {
            audio_base_path: dir.path().to_path_buf(),
            ..LocalPlaybackConfig::default()
        });
        assert_eq!(build_connector(&local).unwrap().name(), "local");

        let external = ConnectorConfig::ExternalVoiceAi(ExternalVoiceAiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..ExternalVoiceAiConfig::default()
        });
        assert_eq!(build_connector(&external).unwrap().name(), "external");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ReplyStatus::Transfer.is_terminal());
        assert!(ReplyStatus::Goodbye.is_terminal());
        assert!(!ReplyStatus::Continue.is_terminal());
        assert!(!ReplyStatus::Silence.is_terminal());
    }
}
