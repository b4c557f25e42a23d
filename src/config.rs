//! # Configuration Management
//!
//! This module loads the gateway configuration once at startup from multiple sources:
//! - TOML configuration file (gateway.toml)
//! - Environment variables (with GATEWAY_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! The resulting [`AppConfig`] is immutable for the life of the process; it is shared
//! behind an `Arc` and never updated at runtime.
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between TOML/environment data and Rust structs
//! - **Internally tagged enums**: `#[serde(tag = "type")]` picks the connector variant
//!   from a `type = "..."` field, which is how the connector registry is driven
//! - **`#[serde(default)]`**: Missing fields fall back to the `Default` impl
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables
//! 2. Environment variables (GATEWAY_SERVER__PORT, GATEWAY_AUTH__ENFORCE, etc.)
//! 3. Configuration file (gateway.toml)
//! 4. Default values (defined in the Default impls)

use crate::audio::buffer::UtteranceBufferConfig;
use crate::auth::validator::DEFAULT_SCHEMA_UUID;
use crate::error::{AppResult, GatewayError};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub connectors: Vec<ConnectorConfig>,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Conversation lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Conversations idle longer than this are ended by the sweeper
    pub idle_timeout_secs: u64,

    /// How often the idle sweeper runs
    pub sweep_interval_secs: u64,

    /// Consecutive backend failures that force a conversation to end
    pub max_consecutive_failures: u32,

    /// Capacity of each stream's inbound and outbound channels
    pub stream_buffer: usize,

    /// Lifecycle events kept for the monitoring snapshot
    pub recent_event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            sweep_interval_secs: 30,
            max_consecutive_failures: 3,
            stream_buffer: 64,
            recent_event_capacity: 100,
        }
    }
}

/// Bearer token validation settings.
///
/// `enabled = false` skips validation entirely; `enabled = true, enforce = false`
/// validates and logs failures without rejecting anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub enforce: bool,

    /// This gateway's public URL as registered with the contact center
    pub datasource_url: String,
    pub datasource_schema_uuid: String,

    /// Required `aud`; when unset the claim only has to be present
    pub audience: Option<String>,

    /// Required `sub`; when unset the claim only has to be present
    pub expected_subject: Option<String>,

    pub key_cache_ttl_minutes: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            enforce: false,
            datasource_url: String::new(),
            datasource_schema_uuid: DEFAULT_SCHEMA_UUID.to_string(),
            audience: None,
            expected_subject: None,
            key_cache_ttl_minutes: 60,
        }
    }
}

/// One backend connector. The `type` field selects the implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorConfig {
    LocalPlayback(LocalPlaybackConfig),
    ExternalVoiceAi(ExternalVoiceAiConfig),
}

impl ConnectorConfig {
    pub fn name(&self) -> &str {
        match self {
            ConnectorConfig::LocalPlayback(c) => &c.name,
            ConnectorConfig::ExternalVoiceAi(c) => &c.name,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            ConnectorConfig::LocalPlayback(_) => "local_playback",
            ConnectorConfig::ExternalVoiceAi(_) => "external_voice_ai",
        }
    }
}

/// Canned-prompt responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPlaybackConfig {
    pub name: String,
    pub agent_id: String,
    /// Claim the default-agent slot in the router
    pub is_default: bool,
    pub audio_base_path: PathBuf,
    pub prompts: PromptFiles,
    pub welcome_text: String,
}

impl Default for LocalPlaybackConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            agent_id: "Local Playback".to_string(),
            is_default: true,
            audio_base_path: PathBuf::from("audio"),
            prompts: PromptFiles::default(),
            welcome_text: "Hello, welcome to the voice virtual agent gateway. How can I help you today?"
                .to_string(),
        }
    }
}

/// File names (relative to `audio_base_path`) of the canned prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptFiles {
    pub welcome: String,
    pub transfer: String,
    pub goodbye: String,
    pub error: String,
}

impl Default for PromptFiles {
    fn default() -> Self {
        Self {
            welcome: "welcome.wav".to_string(),
            transfer: "transferring.wav".to_string(),
            goodbye: "goodbye.wav".to_string(),
            error: "error.wav".to_string(),
        }
    }
}

/// Cloud conversational-AI backend reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalVoiceAiConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub region: String,
    /// Utterance sent right after a session opens, to make the bot greet the caller
    pub initial_trigger_text: Option<String>,
    pub request_timeout_secs: u64,
    pub discovery_retry: DiscoveryRetryConfig,
    /// Buffer caller audio into utterances; off when unset
    pub utterance_buffering: Option<UtteranceBufferConfig>,
}

impl Default for ExternalVoiceAiConfig {
    fn default() -> Self {
        Self {
            name: "external".to_string(),
            base_url: String::new(),
            api_key: None,
            region: "us-east-1".to_string(),
            initial_trigger_text: None,
            request_timeout_secs: 10,
            discovery_retry: DiscoveryRetryConfig::default(),
            utterance_buffering: None,
        }
    }
}

/// Bounded exponential backoff for agent discovery at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryRetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for DiscoveryRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 50051,
            },
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            connectors: vec![ConnectorConfig::LocalPlayback(LocalPlaybackConfig::default())],
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `GATEWAY_SERVER__PORT=9000`: Override server port
    /// - `GATEWAY_AUTH__ENABLED=true`: Turn on token validation
    /// - `GATEWAY_GATEWAY__IDLE_TIMEOUT_SECS=120`: Shorter idle timeout
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("gateway").required(false))
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Deployment platforms set these without any prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Any failure here is fatal: the gateway refuses to start.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(GatewayError::Configuration(msg));

        if self.server.port == 0 {
            return invalid("Server port cannot be 0".to_string());
        }
        if self.gateway.idle_timeout_secs == 0 || self.gateway.sweep_interval_secs == 0 {
            return invalid("Idle timeout and sweep interval must be greater than 0".to_string());
        }
        if self.gateway.max_consecutive_failures == 0 {
            return invalid("max_consecutive_failures must be greater than 0".to_string());
        }
        if self.gateway.stream_buffer == 0 {
            return invalid("stream_buffer must be greater than 0".to_string());
        }
        if self.auth.enabled && self.auth.enforce && self.auth.datasource_url.is_empty() {
            return invalid("auth.enforce requires auth.datasource_url".to_string());
        }
        if self.connectors.is_empty() {
            return invalid("At least one connector must be configured".to_string());
        }

        let mut names = HashSet::new();
        for connector in &self.connectors {
            if !names.insert(connector.name()) {
                return invalid(format!("Duplicate connector name '{}'", connector.name()));
            }
            match connector {
                ConnectorConfig::LocalPlayback(local) if local.agent_id.is_empty() => {
                    return invalid(format!("Connector '{}' has an empty agent_id", local.name));
                }
                ConnectorConfig::ExternalVoiceAi(external)
                    if !(external.base_url.starts_with("http://")
                        || external.base_url.starts_with("https://")) =>
                {
                    return invalid(format!(
                        "Connector '{}' needs an http(s) base_url",
                        external.name
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
