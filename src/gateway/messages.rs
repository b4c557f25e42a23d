//! Wire types for the caller stream.
//!
//! Over WebSocket both directions are JSON text frames; audio travels as base64.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Start,
    Audio,
    Dtmf,
    Event,
    End,
}

/// One inbound event on a caller stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub customer_org_id: String,
    pub kind: RequestKind,
    /// 8 kHz mu-law caller audio
    #[serde(default, with = "base64_bytes")]
    pub audio_content: Vec<u8>,
    /// DTMF digits or the event name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    /// Overrides the stream-level `authorization` metadata for this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

impl CallerRequest {
    pub fn new(conversation_id: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            agent_id: String::new(),
            customer_org_id: String::new(),
            kind,
            audio_content: Vec::new(),
            text_content: None,
            authorization: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    Start,
    Response,
    Silence,
    Error,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Transfer,
    Error,
}

/// One outbound event on a caller stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub conversation_id: String,
    #[serde(default, with = "base64_bytes")]
    pub audio_content: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    pub response_kind: ResponseKind,
    pub barge_in_enabled: bool,
    pub session_status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl GatewayResponse {
    pub fn new(conversation_id: impl Into<String>, kind: ResponseKind, status: SessionStatus) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            audio_content: Vec::new(),
            content_type: None,
            text_content: None,
            response_kind: kind,
            barge_in_enabled: false,
            session_status: status,
            error_code: None,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_from_json() {
        let request: CallerRequest = serde_json::from_value(json!({
            "conversation_id": "call-1",
            "kind": "AUDIO",
            "audio_content": "//8A"
        }))
        .unwrap();
        assert_eq!(request.kind, RequestKind::Audio);
        assert_eq!(request.audio_content, vec![0xFF, 0xFF, 0x00]);
        assert!(request.agent_id.is_empty());
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result = serde_json::from_value::<CallerRequest>(json!({
            "conversation_id": "call-1",
            "kind": "AUDIO",
            "audio_content": "not base64!"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_response_json_shape() {
        let mut response = GatewayResponse::new("call-1", ResponseKind::Start, SessionStatus::Active);
        response.audio_content = vec![1, 2, 3];
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["audio_content"], "AQID");
        assert_eq!(value["response_kind"], "START");
        assert_eq!(value["session_status"], "ACTIVE");
        assert!(value.get("error_code").is_none());
    }
}
