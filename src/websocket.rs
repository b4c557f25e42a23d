//! # Caller Stream WebSocket
//!
//! Exposes the gateway's bidirectional caller stream at `/ws/conversation`.
//!
//! ## Protocol:
//! - **Text frames**: JSON [`CallerRequest`]s; audio is base64 in `audio_content`
//! - **Binary frames**: raw 8 kHz mu-law audio for the socket's current conversation
//!   (the last one this socket STARTed)
//! - **Server → client**: one JSON [`GatewayResponse`] per request
//! - **Authorization**: the upgrade request's `Authorization` header applies to every
//!   frame unless the frame carries its own `authorization` field
//!
//! ## Actor Model:
//! Each socket is an actix actor. Requests are handed to a gateway worker task over an
//! mpsc channel; responses come back as a second stream the actor writes out. Closing
//! the socket drops the inbound sender, which ends the worker and implicitly ENDs the
//! socket's conversations.

use crate::error::GatewayError;
use crate::gateway::messages::{CallerRequest, GatewayResponse, RequestKind, ResponseKind, SessionStatus};
use crate::gateway::TransportGateway;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{http::header, web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct CallerStreamSocket {
    stream_id: Uuid,
    gateway: Arc<TransportGateway>,
    authorization: Option<String>,
    buffer: usize,
    inbound: Option<mpsc::Sender<CallerRequest>>,
    current_conversation: Option<String>,
    /// Control requests waiting for room in the backlog
    pending_sends: usize,
    last_heartbeat: Instant,
}

impl CallerStreamSocket {
    pub fn new(gateway: Arc<TransportGateway>, authorization: Option<String>, buffer: usize) -> Self {
        Self {
            stream_id: Uuid::new_v4(),
            gateway,
            authorization,
            buffer: buffer.max(1),
            inbound: None,
            current_conversation: None,
            pending_sends: 0,
            last_heartbeat: Instant::now(),
        }
    }

    /// Queue `request` for the gateway worker.
    ///
    /// When the backlog is full, audio frames are shed. Control requests wait for room in
    /// a spawned future while the actor keeps draining responses; later requests queue
    /// behind them so arrival order is kept.
    fn forward(&mut self, request: CallerRequest, ctx: &mut ws::WebsocketContext<Self>) {
        if request.kind == RequestKind::Start {
            self.current_conversation = Some(request.conversation_id.clone());
        }
        let Some(inbound) = self.inbound.clone() else {
            return;
        };
        let request = if self.pending_sends == 0 {
            match inbound.try_send(request) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => {
                    debug!(stream_id = %self.stream_id, "Gateway worker gone, request dropped");
                    return;
                }
                Err(TrySendError::Full(request)) => request,
            }
        } else {
            request
        };
        if sheds_under_backpressure(request.kind) {
            warn!(
                stream_id = %self.stream_id,
                conversation_id = %request.conversation_id,
                "Caller stream backlog full, dropping audio frame"
            );
            return;
        }

        self.pending_sends += 1;
        ctx.spawn(
            async move { inbound.send(request).await.is_ok() }
                .into_actor(self)
                .map(|delivered, act, _ctx| {
                    act.pending_sends -= 1;
                    if !delivered {
                        debug!(stream_id = %act.stream_id, "Gateway worker gone, request dropped");
                    }
                }),
        );
    }
}

/// Only audio may be dropped when the worker falls behind; losing a START, END, DTMF or
/// EVENT would change what the caller believes the conversation is doing.
fn sheds_under_backpressure(kind: RequestKind) -> bool {
    kind == RequestKind::Audio
}

impl Actor for CallerStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(stream_id = %self.stream_id, "WebSocket caller stream started");

        let (in_tx, in_rx) = mpsc::channel(self.buffer);
        let (out_tx, out_rx) = mpsc::channel(self.buffer);
        self.inbound = Some(in_tx);
        tokio::spawn(self.gateway.clone().process_stream(
            self.stream_id,
            self.authorization.clone(),
            in_rx,
            out_tx,
        ));
        ctx.add_stream(ReceiverStream::new(out_rx));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(stream_id = %act.stream_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(stream_id = %self.stream_id, "WebSocket caller stream stopped");
        // Dropping the sender ends the worker, which ENDs this socket's conversations.
        self.inbound = None;
    }
}

/// Frames from the caller.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallerStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match parse_text_frame(&text) {
                Ok(request) => self.forward(request, ctx),
                Err(err) => {
                    debug!(stream_id = %self.stream_id, error = %err, "Rejected text frame");
                    send_json(ctx, &rejection("", &err));
                }
            },
            Ok(ws::Message::Binary(data)) => match &self.current_conversation {
                Some(conversation_id) => {
                    let request = binary_audio_request(conversation_id, data.to_vec());
                    self.forward(request, ctx);
                }
                None => {
                    let err = GatewayError::InvalidRequest("binary audio before START".into());
                    send_json(ctx, &rejection("", &err));
                }
            },
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(stream_id = %self.stream_id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(stream_id = %self.stream_id, "Continuation frames are not supported");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(stream_id = %self.stream_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Responses from the gateway worker.
impl StreamHandler<GatewayResponse> for CallerStreamSocket {
    fn handle(&mut self, response: GatewayResponse, ctx: &mut Self::Context) {
        send_json(ctx, &response);
    }
}

fn send_json(ctx: &mut ws::WebsocketContext<CallerStreamSocket>, response: &GatewayResponse) {
    match serde_json::to_string(response) {
        Ok(json) => ctx.text(json),
        Err(err) => warn!(error = %err, "Failed to serialize response"),
    }
}

fn parse_text_frame(text: &str) -> Result<CallerRequest, GatewayError> {
    let request: CallerRequest = serde_json::from_str(text)?;
    if request.conversation_id.is_empty() {
        return Err(GatewayError::InvalidRequest("conversation_id is required".into()));
    }
    Ok(request)
}

fn binary_audio_request(conversation_id: &str, audio: Vec<u8>) -> CallerRequest {
    CallerRequest {
        audio_content: audio,
        ..CallerRequest::new(conversation_id, RequestKind::Audio)
    }
}

fn rejection(conversation_id: &str, err: &GatewayError) -> GatewayResponse {
    let mut response = GatewayResponse::new(conversation_id, ResponseKind::Error, SessionStatus::Error);
    response.text_content = Some(err.to_string());
    response.error_code = Some(err.code().to_string());
    response
}

/// `GET /ws/conversation`: upgrade to a caller stream.
pub async fn caller_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New caller stream from: {:?}", req.connection_info().peer_addr());
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let socket = CallerStreamSocket::new(
        state.gateway.clone(),
        authorization,
        state.config.gateway.stream_buffer,
    );
    ws::start(socket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frame_parsing() {
        let request = parse_text_frame(
            r#"{"conversation_id":"call-1","agent_id":"BotA","kind":"START"}"#,
        )
        .unwrap();
        assert_eq!(request.kind, RequestKind::Start);
        assert_eq!(request.agent_id, "BotA");
    }

    #[test]
    fn test_malformed_frames_are_invalid_requests() {
        let err = parse_text_frame("{not json").unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let err = parse_text_frame(r#"{"conversation_id":"","kind":"END"}"#).unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let response = rejection("", &err);
        assert_eq!(response.response_kind, ResponseKind::Error);
        assert_eq!(response.error_code.as_deref(), Some("invalid_request"));
    }

    #[test]
    fn test_only_audio_is_shed_under_backpressure() {
        assert!(sheds_under_backpressure(RequestKind::Audio));
        for kind in [RequestKind::Start, RequestKind::Dtmf, RequestKind::Event, RequestKind::End] {
            assert!(!sheds_under_backpressure(kind));
        }
    }

    #[test]
    fn test_binary_frame_becomes_audio() {
        let request = binary_audio_request("call-1", vec![0xFF; 160]);
        assert_eq!(request.kind, RequestKind::Audio);
        assert_eq!(request.conversation_id, "call-1");
        assert_eq!(request.audio_content.len(), 160);
    }
}
