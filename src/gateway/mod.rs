//! # Transport Gateway
//!
//! Terminates caller streams and drives each conversation through its lifecycle:
//!
//! ```text
//! UNBORN --START--> ACTIVE --END / terminal reply / failures / idle / stream close--> ENDED
//! ```
//!
//! UNBORN means "no registry entry". Every inbound request passes the auth gate first,
//! then the conversation's state machine, then the resolved connector. Raw PCM coming
//! back from a connector is normalized into 8 kHz mu-law WAV before it is emitted.
//!
//! ## Key Rust Concepts:
//! - **Per-entry async mutex**: one conversation's events never interleave, different
//!   conversations never block each other
//! - **mpsc channels**: a stream is an inbound receiver plus an outbound sender; the
//!   worker loop ends (and implicitly ENDs its conversations) when the inbound side closes

pub mod conversation;
pub mod messages;

use crate::audio::codec;
use crate::audio::{AudioEncoding, AudioFrame};
use crate::auth::{AuthError, AuthGate, AuthOutcome, AuthPolicy};
use crate::config::GatewayConfig;
use crate::connectors::{AgentInfo, CallerInput, ConnectorResponse, ReplyStatus};
use crate::error::{AppResult, GatewayError};
use crate::router::VirtualAgentRouter;
use chrono::{DateTime, Utc};
use conversation::{Conversation, ConversationHandle, ConversationRegistry, ConversationState, ConversationSummary, Slot};
use messages::{CallerRequest, GatewayResponse, RequestKind, ResponseKind, SessionStatus};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const FALLBACK_TEXT: &str = "I'm sorry, something went wrong. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Start,
    Message,
    End,
    AuthRejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub conversation_id: String,
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Read-only monitoring view.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub conversations: Vec<ConversationSummary>,
    /// Ids whose lock was held when the snapshot was taken
    pub busy_conversations: Vec<String>,
    pub recent_events: Vec<LifecycleEvent>,
}

/// Why a conversation is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Caller,
    Transfer,
    Completed,
    Failures,
    Idle,
    StreamClosed,
    Shutdown,
}

impl EndReason {
    fn as_str(&self) -> &'static str {
        match self {
            EndReason::Caller => "caller_end",
            EndReason::Transfer => "transfer",
            EndReason::Completed => "completed",
            EndReason::Failures => "backend_failures",
            EndReason::Idle => "idle_timeout",
            EndReason::StreamClosed => "stream_closed",
            EndReason::Shutdown => "shutdown",
        }
    }
}

pub struct TransportGateway {
    router: Arc<VirtualAgentRouter>,
    auth: AuthGate,
    config: GatewayConfig,
    conversations: ConversationRegistry,
    events: Mutex<VecDeque<LifecycleEvent>>,
}

impl TransportGateway {
    pub fn new(router: Arc<VirtualAgentRouter>, auth: AuthGate, config: GatewayConfig) -> Self {
        Self {
            router,
            auth,
            config,
            conversations: ConversationRegistry::new(),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.router.list_all_agents()
    }

    pub fn auth_policy(&self) -> AuthPolicy {
        self.auth.policy()
    }

    /// Run the auth gate for a request that does not go through a stream.
    pub async fn authorize(&self, authorization: Option<&str>) -> Result<AuthOutcome, AuthError> {
        self.auth.check(authorization).await
    }

    /// Run one caller stream until its inbound side closes.
    ///
    /// Requests are handled in arrival order and each produces exactly one response.
    /// `authorization` is the stream-level token; a request's own field overrides it.
    pub async fn process_stream(
        self: Arc<Self>,
        stream_id: Uuid,
        authorization: Option<String>,
        mut inbound: mpsc::Receiver<CallerRequest>,
        outbound: mpsc::Sender<GatewayResponse>,
    ) {
        info!(%stream_id, "Caller stream opened");
        let mut touched = HashSet::new();
        while let Some(request) = inbound.recv().await {
            if !request.conversation_id.is_empty() {
                touched.insert(request.conversation_id.clone());
            }
            let response = self.handle(stream_id, request, authorization.as_deref()).await;
            if outbound.send(response).await.is_err() {
                debug!(%stream_id, "Outbound side closed");
                break;
            }
        }
        self.detach_stream(stream_id, &touched).await;
        info!(%stream_id, "Caller stream closed");
    }

    /// Handle one request from `stream_id`. Errors become error responses.
    pub async fn handle(
        &self,
        stream_id: Uuid,
        request: CallerRequest,
        stream_authorization: Option<&str>,
    ) -> GatewayResponse {
        let conversation_id = request.conversation_id.clone();
        let token = request.authorization.as_deref().or(stream_authorization);
        if let Err(err) = self.auth.check(token).await {
            self.record(LifecycleKind::AuthRejected, &conversation_id, None, Some(err.kind().to_string()))
                .await;
            return error_response(&conversation_id, &GatewayError::Authentication(err), SessionStatus::Error);
        }

        let result = match request.kind {
            RequestKind::Start => self.start(stream_id, request).await,
            RequestKind::End => self.end(request).await,
            RequestKind::Audio | RequestKind::Dtmf | RequestKind::Event => {
                self.message(stream_id, request).await
            }
        };

        result.unwrap_or_else(|err| {
            debug!(conversation_id = %conversation_id, code = err.code(), error = %err, "Request failed");
            error_response(&conversation_id, &err, SessionStatus::Error)
        })
    }

    async fn start(&self, stream_id: Uuid, request: CallerRequest) -> AppResult<GatewayResponse> {
        let agent_id = match request.agent_id.as_str() {
            "" => self
                .router
                .default_agent()
                .map(|agent| agent.agent_id.clone())
                .ok_or_else(|| GatewayError::UnknownAgent(String::new()))?,
            requested => requested.to_string(),
        };

        // Resolve before touching the registry so an unknown agent creates nothing.
        let connector = self.router.lookup(&agent_id)?;
        let conversation_id = request.conversation_id.clone();

        let (handle, mut conversation) = loop {
            let slot = self
                .conversations
                .get_or_insert(&conversation_id, || {
                    Conversation::new(
                        conversation_id.clone(),
                        agent_id.clone(),
                        request.customer_org_id.clone(),
                        connector.clone(),
                    )
                })
                .await;
            match slot {
                Slot::Existing(handle) => {
                    let mut existing = handle.lock().await;
                    if !existing.is_active() {
                        // Ended while we waited; the id is free again.
                        drop(existing);
                        self.conversations.remove(&conversation_id, &handle).await;
                        continue;
                    }
                    existing.streams.insert(stream_id);
                    existing.touch();
                    debug!(conversation_id = %conversation_id, "Duplicate START acknowledged");
                    return Ok(GatewayResponse::new(conversation_id, ResponseKind::Start, SessionStatus::Active));
                }
                Slot::Created(handle, guard) => break (handle, guard),
            }
        };

        conversation.streams.insert(stream_id);
        let ctx = conversation.session_context();
        info!(
            conversation_id = %conversation_id,
            agent_id = %agent_id,
            connector = %connector.name(),
            "Starting conversation"
        );

        match connector.start(&ctx).await {
            Ok(reply) => {
                self.record(LifecycleKind::Start, &conversation_id, Some(&agent_id), None).await;
                let status = reply.status;
                let mut response = render(&conversation_id, reply, ResponseKind::Start);
                conversation.welcome_sent = !response.audio_content.is_empty();
                conversation.touch();
                if status.is_terminal() {
                    self.finish(&mut conversation, &handle, terminal_reason(status)).await;
                    response.response_kind = ResponseKind::End;
                }
                Ok(response)
            }
            Err(err) => {
                error!(conversation_id = %conversation_id, error = %err, "Backend failed to start conversation");
                let fallback = connector.fallback_audio();
                if let Err(end_err) = connector.end(&ctx).await {
                    warn!(conversation_id = %conversation_id, error = %end_err, "Backend failed to end session");
                }
                conversation.state = ConversationState::Ended;
                self.conversations.remove(&conversation_id, &handle).await;
                self.record(LifecycleKind::End, &conversation_id, Some(&agent_id), Some("start_failed".into()))
                    .await;
                let mut response = error_response(&conversation_id, &GatewayError::Connector(err), SessionStatus::Error);
                attach_audio(&mut response, fallback);
                Ok(response)
            }
        }
    }

    async fn message(&self, stream_id: Uuid, request: CallerRequest) -> AppResult<GatewayResponse> {
        let conversation_id = request.conversation_id.clone();
        let input = caller_input(request)?;
        let handle = self
            .conversations
            .get(&conversation_id)
            .await
            .ok_or_else(|| GatewayError::UnknownConversation(conversation_id.clone()))?;
        let mut conversation = handle.lock().await;
        if !conversation.is_active() {
            return Err(GatewayError::UnknownConversation(conversation_id));
        }
        conversation.streams.insert(stream_id);
        conversation.touch();

        let ctx = conversation.session_context();
        let kind = input.kind();
        let connector = conversation.connector.clone();
        match connector.send(&ctx, input).await {
            Ok(reply) => {
                conversation.consecutive_failures = 0;
                conversation.touch();
                self.record(LifecycleKind::Message, &conversation_id, Some(&ctx.agent_id), Some(kind.to_string()))
                    .await;
                let status = reply.status;
                let mut response = render(&conversation_id, reply, ResponseKind::Response);
                if status.is_terminal() {
                    self.finish(&mut conversation, &handle, terminal_reason(status)).await;
                    response.response_kind = ResponseKind::End;
                }
                Ok(response)
            }
            Err(err) => {
                conversation.consecutive_failures += 1;
                let failures = conversation.consecutive_failures;
                warn!(
                    conversation_id = %conversation_id,
                    failures,
                    limit = self.config.max_consecutive_failures,
                    error = %err,
                    "Backend call failed"
                );
                let fallback = connector.fallback_audio();
                let err = GatewayError::Connector(err);
                let mut response = if failures >= self.config.max_consecutive_failures {
                    self.finish(&mut conversation, &handle, EndReason::Failures).await;
                    let mut response = error_response(&conversation_id, &err, SessionStatus::Error);
                    response.response_kind = ResponseKind::End;
                    response
                } else {
                    error_response(&conversation_id, &err, SessionStatus::Active)
                };
                attach_audio(&mut response, fallback);
                Ok(response)
            }
        }
    }

    async fn end(&self, request: CallerRequest) -> AppResult<GatewayResponse> {
        let conversation_id = request.conversation_id;
        let done = GatewayResponse::new(conversation_id.clone(), ResponseKind::End, SessionStatus::Completed);
        let Some(handle) = self.conversations.get(&conversation_id).await else {
            debug!(conversation_id = %conversation_id, "END for unknown conversation, nothing to do");
            return Ok(done);
        };
        let mut conversation = handle.lock().await;
        if conversation.is_active() {
            self.finish(&mut conversation, &handle, EndReason::Caller).await;
        }
        Ok(done)
    }

    /// Release backend resources and retire the registry entry.
    /// The caller holds the conversation lock.
    async fn finish(&self, conversation: &mut Conversation, handle: &ConversationHandle, reason: EndReason) {
        if !conversation.is_active() {
            return;
        }
        let ctx = conversation.session_context();
        if let Err(err) = conversation.connector.end(&ctx).await {
            warn!(conversation_id = %ctx.conversation_id, error = %err, "Backend failed to end session");
        }
        conversation.state = ConversationState::Ended;
        self.conversations.remove(&ctx.conversation_id, handle).await;
        info!(conversation_id = %ctx.conversation_id, reason = reason.as_str(), "Conversation ended");
        self.record(LifecycleKind::End, &ctx.conversation_id, Some(&ctx.agent_id), Some(reason.as_str().into()))
            .await;
    }

    /// Detach a closed stream from the conversations it used, ending those that no other
    /// stream still uses. Conversations the stream never touched are not locked.
    pub async fn detach_stream(&self, stream_id: Uuid, conversation_ids: &HashSet<String>) {
        for conversation_id in conversation_ids {
            let Some(handle) = self.conversations.get(conversation_id).await else {
                continue;
            };
            let mut conversation = handle.lock().await;
            if !conversation.streams.remove(&stream_id) {
                continue;
            }
            if conversation.streams.is_empty() {
                self.finish(&mut conversation, &handle, EndReason::StreamClosed).await;
            }
        }
    }

    /// End every conversation idle for at least the configured timeout.
    /// Conversations busy with a request are skipped. Returns how many were ended.
    pub async fn sweep_idle(&self) -> usize {
        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let mut ended = 0;
        for handle in self.conversations.handles().await {
            let Ok(mut conversation) = handle.try_lock() else {
                continue;
            };
            if conversation.is_active() && conversation.idle_for() >= timeout {
                self.finish(&mut conversation, &handle, EndReason::Idle).await;
                ended += 1;
            }
        }
        if ended > 0 {
            info!(ended, "Idle sweep ended conversations");
        }
        ended
    }

    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gateway.sweep_idle().await;
            }
        })
    }

    /// End every live conversation.
    pub async fn shutdown(&self) {
        let handles = self.conversations.handles().await;
        info!(count = handles.len(), "Ending live conversations");
        for handle in handles {
            let mut conversation = handle.lock().await;
            self.finish(&mut conversation, &handle, EndReason::Shutdown).await;
        }
    }

    /// Never waits on a conversation; entries mid-request are listed in `busy_conversations`.
    pub async fn snapshot(&self) -> GatewaySnapshot {
        let mut conversations = Vec::new();
        let mut busy_conversations = Vec::new();
        for (conversation_id, handle) in self.conversations.entries().await {
            match handle.try_lock() {
                Ok(conversation) => conversations.push(conversation.summary()),
                Err(_) => busy_conversations.push(conversation_id),
            }
        }
        conversations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        busy_conversations.sort();
        let recent_events = self.events.lock().await.iter().cloned().collect();
        GatewaySnapshot {
            conversations,
            busy_conversations,
            recent_events,
        }
    }

    pub async fn active_conversations(&self) -> usize {
        self.conversations.len().await
    }

    async fn record(&self, kind: LifecycleKind, conversation_id: &str, agent_id: Option<&str>, reason: Option<String>) {
        let capacity = self.config.recent_event_capacity;
        if capacity == 0 {
            return;
        }
        let mut events = self.events.lock().await;
        while events.len() >= capacity {
            events.pop_front();
        }
        events.push_back(LifecycleEvent {
            kind,
            conversation_id: conversation_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            timestamp: Utc::now(),
            reason,
        });
    }
}

fn caller_input(request: CallerRequest) -> AppResult<CallerInput> {
    match request.kind {
        RequestKind::Audio => Ok(CallerInput::Audio(AudioFrame::telephony_mulaw(request.audio_content))),
        RequestKind::Dtmf => request
            .text_content
            .filter(|digits| !digits.is_empty())
            .map(CallerInput::Dtmf)
            .ok_or_else(|| GatewayError::InvalidRequest("DTMF request without digits".into())),
        RequestKind::Event => request
            .text_content
            .filter(|name| !name.is_empty())
            .map(|name| CallerInput::Event { name })
            .ok_or_else(|| GatewayError::InvalidRequest("EVENT request without a name".into())),
        RequestKind::Start | RequestKind::End => Err(GatewayError::InvalidRequest(format!(
            "{:?} is not a caller message",
            request.kind
        ))),
    }
}

fn terminal_reason(status: ReplyStatus) -> EndReason {
    match status {
        ReplyStatus::Transfer => EndReason::Transfer,
        _ => EndReason::Completed,
    }
}

/// Turn a connector reply into an outbound response, normalizing raw PCM.
fn render(conversation_id: &str, reply: ConnectorResponse, kind: ResponseKind) -> GatewayResponse {
    let status = match reply.status {
        ReplyStatus::Transfer => SessionStatus::Transfer,
        ReplyStatus::Goodbye => SessionStatus::Completed,
        ReplyStatus::Continue | ReplyStatus::Silence => SessionStatus::Active,
    };
    let silent = reply.audio.as_ref().map_or(true, AudioFrame::is_empty) && reply.text.is_none();
    let kind = match kind {
        ResponseKind::Response if silent => ResponseKind::Silence,
        other => other,
    };

    let mut response = GatewayResponse::new(conversation_id, kind, status);
    response.text_content = reply.text;
    response.barge_in_enabled = reply.barge_in;
    attach_audio(&mut response, reply.audio);
    response
}

fn attach_audio(response: &mut GatewayResponse, audio: Option<AudioFrame>) {
    let Some(frame) = audio.filter(|frame| !frame.is_empty()) else {
        return;
    };
    match frame.encoding {
        AudioEncoding::Linear => {
            let normalized = codec::normalize(&frame.data, frame.sample_rate, frame.bit_depth);
            response.content_type = Some(normalized.content_type().to_string());
            response.audio_content = normalized.into_bytes();
        }
        AudioEncoding::Mulaw | AudioEncoding::Wav => {
            response.content_type = Some(frame.content_type().to_string());
            response.audio_content = frame.data;
        }
    }
}

fn error_response(conversation_id: &str, err: &GatewayError, status: SessionStatus) -> GatewayResponse {
    let mut response = GatewayResponse::new(conversation_id, ResponseKind::Error, status);
    response.text_content = Some(match err {
        GatewayError::Connector(_) => FALLBACK_TEXT.to_string(),
        GatewayError::Authentication(AuthError::MissingToken) => "authorization required".to_string(),
        other => other.to_string(),
    });
    response.error_code = Some(err.code().to_string());
    response
}
