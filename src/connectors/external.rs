//! # External Voice-AI Connector
//!
//! Bridges conversations to a cloud conversational-AI service over a JSON REST API:
//!
//! | call       | request                                    |
//! |------------|--------------------------------------------|
//! | discovery  | `GET  {base}/bots`                         |
//! | start      | `POST {base}/bots/{bot_id}/sessions`       |
//! | send       | `POST {base}/sessions/{id}/utterances`     |
//! | end        | `DELETE {base}/sessions/{id}`              |
//!
//! Requests carry `Authorization: Bearer <api_key>` and an `X-Region` header.
//! Replies contain raw PCM (usually 16 kHz, 16-bit) which the gateway normalizes
//! for telephony playback.
//!
//! ## State:
//! The connector keeps a `conversation_id → backend session` map. Each entry may
//! also own an [`UtteranceBuffer`] when caller audio buffering is enabled.

use super::{AgentInfo, CallerInput, Connector, ConnectorError, ConnectorResponse, ReplyStatus, SessionContext};
use crate::audio::buffer::{UtteranceBuffer, UtteranceBufferConfig};
use crate::audio::{AudioEncoding, AudioFrame};
use crate::config::{ConnectorConfig, DiscoveryRetryConfig, ExternalVoiceAiConfig};
use crate::error::{AppResult, GatewayError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct BotList {
    #[serde(default)]
    bots: Vec<Bot>,
}

#[derive(Debug, Deserialize)]
struct Bot {
    bot_id: String,
    bot_name: String,
}

#[derive(Debug, Serialize)]
struct OpenSessionRequest<'a> {
    conversation_id: &'a str,
    customer_org_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Debug, Default, Serialize)]
struct UtteranceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<AudioEncoding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bit_depth: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dtmf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UtteranceResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    audio: Option<String>,
    #[serde(default = "default_reply_rate")]
    sample_rate: u32,
    #[serde(default = "default_reply_bit_depth")]
    bit_depth: u16,
    #[serde(default)]
    barge_in: bool,
    #[serde(default)]
    status: Option<String>,
}

fn default_reply_rate() -> u32 {
    16000
}

fn default_reply_bit_depth() -> u16 {
    16
}

struct BackendSession {
    session_id: String,
    buffer: Option<UtteranceBuffer>,
}

pub struct ExternalVoiceAiConnector {
    name: String,
    base_url: String,
    api_key: Option<String>,
    region: String,
    initial_trigger_text: Option<String>,
    retry: DiscoveryRetryConfig,
    buffering: Option<UtteranceBufferConfig>,
    http: reqwest::Client,
    /// agent_id → backend bot id, filled by discovery
    bots: RwLock<HashMap<String, String>>,
    sessions: Mutex<HashMap<String, BackendSession>>,
}

pub(super) fn construct(config: &ConnectorConfig) -> AppResult<Arc<dyn Connector>> {
    match config {
        ConnectorConfig::ExternalVoiceAi(external) => {
            Ok(Arc::new(ExternalVoiceAiConnector::new(external)?))
        }
        other => Err(GatewayError::Configuration(format!(
            "connector '{}' is not an external voice-AI connector",
            other.name()
        ))),
    }
}

impl ExternalVoiceAiConnector {
    pub fn new(config: &ExternalVoiceAiConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Configuration(format!("HTTP client for '{}': {}", config.name, e)))?;

        Ok(Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            region: config.region.clone(),
            initial_trigger_text: config.initial_trigger_text.clone(),
            retry: config.discovery_retry.clone(),
            buffering: config.utterance_buffering.clone(),
            http,
            bots: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-Region", &self.region);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ConnectorError> {
        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ConnectorError::Unavailable(e.to_string())
            } else {
                ConnectorError::Http(e)
            }
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ConnectorError::Backend {
            status: status.as_u16(),
            message,
        })
    }

    async fn discover_once(&self) -> Result<Vec<Bot>, ConnectorError> {
        let response = self.execute(self.request(reqwest::Method::GET, "/bots")).await?;
        let list: BotList = response
            .json()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        Ok(list.bots)
    }

    /// Backoff before retry `attempt` (0-indexed): `min(base * 2^attempt, max)`.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt);
        let raw = self.retry.base_delay_ms.saturating_mul(exp);
        Duration::from_millis(raw.min(self.retry.max_delay_ms))
    }

    async fn send_utterance(
        &self,
        ctx: &SessionContext,
        session_id: &str,
        body: UtteranceRequest,
    ) -> Result<ConnectorResponse, ConnectorError> {
        let path = format!("/sessions/{}/utterances", session_id);
        let response = self
            .execute(self.request(reqwest::Method::POST, &path).json(&body))
            .await?;
        let reply: UtteranceResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;
        debug!(
            conversation_id = %ctx.conversation_id,
            status = ?reply.status,
            has_audio = reply.audio.is_some(),
            "Backend replied"
        );
        translate_reply(reply)
    }

    /// Run `input` through the session's utterance buffer, if any.
    /// `None` means the buffer is still collecting and nothing should be sent yet.
    async fn buffered(&self, ctx: &SessionContext, frame: AudioFrame) -> Result<Option<(String, AudioFrame)>, ConnectorError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&ctx.conversation_id)
            .ok_or_else(|| ConnectorError::UnknownSession(ctx.conversation_id.clone()))?;
        let ready = match session.buffer.as_mut() {
            Some(buffer) => buffer.push(&frame),
            None => Some(frame),
        };
        Ok(ready.map(|frame| (session.session_id.clone(), frame)))
    }

    async fn session_id(&self, ctx: &SessionContext) -> Result<String, ConnectorError> {
        self.sessions
            .lock()
            .await
            .get(&ctx.conversation_id)
            .map(|s| s.session_id.clone())
            .ok_or_else(|| ConnectorError::UnknownSession(ctx.conversation_id.clone()))
    }
}

fn translate_reply(reply: UtteranceResponse) -> Result<ConnectorResponse, ConnectorError> {
    let audio = match reply.audio.filter(|a| !a.is_empty()) {
        Some(encoded) => {
            let data = BASE64
                .decode(encoded)
                .map_err(|e| ConnectorError::InvalidResponse(format!("audio is not base64: {}", e)))?;
            Some(AudioFrame {
                data,
                sample_rate: reply.sample_rate,
                bit_depth: reply.bit_depth,
                channels: 1,
                encoding: AudioEncoding::Linear,
            })
        }
        None => None,
    };
    let text = reply.text.filter(|t| !t.is_empty());

    let status = match reply.status.as_deref() {
        Some("transfer") => ReplyStatus::Transfer,
        Some("goodbye") | Some("completed") => ReplyStatus::Goodbye,
        _ if audio.is_none() && text.is_none() => ReplyStatus::Silence,
        _ => ReplyStatus::Continue,
    };

    Ok(ConnectorResponse {
        text,
        audio,
        barge_in: reply.barge_in,
        status,
    })
}

#[async_trait]
impl Connector for ExternalVoiceAiConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_agents(&self) -> Vec<AgentInfo> {
        for attempt in 0..=self.retry.max_retries {
            match self.discover_once().await {
                Ok(bots) => {
                    let mut registry = self.bots.write().await;
                    let agents: Vec<AgentInfo> = bots
                        .into_iter()
                        .map(|bot| {
                            let agent_id = format!("{}: {}", self.name, bot.bot_name);
                            registry.insert(agent_id.clone(), bot.bot_id);
                            AgentInfo {
                                display_name: agent_id.clone(),
                                agent_id,
                                is_default: false,
                            }
                        })
                        .collect();
                    info!(connector = %self.name, count = agents.len(), "Discovered backend agents");
                    return agents;
                }
                Err(err) if attempt < self.retry.max_retries => {
                    let delay = self.retry_delay(attempt);
                    warn!(
                        connector = %self.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Agent discovery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(connector = %self.name, error = %err, "Agent discovery failed, registering no agents");
                }
            }
        }
        Vec::new()
    }

    async fn start(&self, ctx: &SessionContext) -> Result<ConnectorResponse, ConnectorError> {
        let bot_id = self
            .bots
            .read()
            .await
            .get(&ctx.agent_id)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownAgent(ctx.agent_id.clone()))?;

        let path = format!("/bots/{}/sessions", bot_id);
        let body = OpenSessionRequest {
            conversation_id: &ctx.conversation_id,
            customer_org_id: &ctx.customer_org_id,
        };
        let opened: OpenSessionResponse = self
            .execute(self.request(reqwest::Method::POST, &path).json(&body))
            .await?
            .json()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))?;

        info!(
            conversation_id = %ctx.conversation_id,
            session_id = %opened.session_id,
            "Backend session opened"
        );
        self.sessions.lock().await.insert(
            ctx.conversation_id.clone(),
            BackendSession {
                session_id: opened.session_id.clone(),
                buffer: self.buffering.clone().map(UtteranceBuffer::new),
            },
        );

        match &self.initial_trigger_text {
            Some(trigger) => {
                let body = UtteranceRequest {
                    text: Some(trigger.clone()),
                    ..UtteranceRequest::default()
                };
                match self.send_utterance(ctx, &opened.session_id, body).await {
                    Ok(reply) => Ok(reply),
                    Err(err) => {
                        // The session is already open on the backend; close it before failing.
                        if let Err(close_err) = self.end(ctx).await {
                            warn!(
                                conversation_id = %ctx.conversation_id,
                                session_id = %opened.session_id,
                                error = %close_err,
                                "Failed to close backend session after trigger failure"
                            );
                        }
                        Err(err)
                    }
                }
            }
            None => Ok(ConnectorResponse::silence()),
        }
    }

    async fn send(
        &self,
        ctx: &SessionContext,
        input: CallerInput,
    ) -> Result<ConnectorResponse, ConnectorError> {
        let (session_id, body) = match input {
            CallerInput::Audio(frame) => match self.buffered(ctx, frame).await? {
                Some((session_id, utterance)) => (
                    session_id,
                    UtteranceRequest {
                        audio: Some(BASE64.encode(&utterance.data)),
                        encoding: Some(utterance.encoding),
                        sample_rate: Some(utterance.sample_rate),
                        bit_depth: Some(utterance.bit_depth),
                        ..UtteranceRequest::default()
                    },
                ),
                None => return Ok(ConnectorResponse::silence()),
            },
            CallerInput::Dtmf(digits) => (
                self.session_id(ctx).await?,
                UtteranceRequest {
                    dtmf: Some(digits),
                    ..UtteranceRequest::default()
                },
            ),
            CallerInput::Event { name } => (
                self.session_id(ctx).await?,
                UtteranceRequest {
                    event: Some(name),
                    ..UtteranceRequest::default()
                },
            ),
        };
        self.send_utterance(ctx, &session_id, body).await
    }

    async fn end(&self, ctx: &SessionContext) -> Result<(), ConnectorError> {
        let Some(session) = self.sessions.lock().await.remove(&ctx.conversation_id) else {
            debug!(conversation_id = %ctx.conversation_id, "No backend session to close");
            return Ok(());
        };
        let path = format!("/sessions/{}", session.session_id);
        self.execute(self.request(reqwest::Method::DELETE, &path)).await?;
        info!(
            conversation_id = %ctx.conversation_id,
            session_id = %session.session_id,
            "Backend session closed"
        );
        Ok(())
    }
}
