//! JSON wire format of the signaling channel.
//!
//! Client frames look like `{"event": "call-user", "data": {...}, "id": 7}`,
//! where `id` is only present when the client expects an acknowledgment.
//! The server either pushes `{"event": ..., "data": ...}` or answers with
//! `{"ack": 7, "data": {...}}`.

use crate::calls::MediaKind;
use crate::types::call::{CallId, EndReason, RemoteParty};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Server event carrying a mid-session credential rejection.
pub const CONNECT_ERROR_EVENT: &str = "connect-error";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has neither an event nor an ack id")]
    Empty,
}

/// Requests and notifications sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    CallUser {
        to: String,
    },
    #[serde(rename_all = "camelCase")]
    AnswerCall {
        call_id: CallId,
        caller_user_id: String,
        device_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    CreateProducer {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    },
    #[serde(rename_all = "camelCase")]
    CreateConsumer {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: String,
    },
    #[serde(rename = "readyToConsume")]
    ReadyToConsume {},
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallUser { .. } => "call-user",
            Self::AnswerCall { .. } => "answer-call",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::CreateProducer { .. } => "create-producer",
            Self::CreateConsumer { .. } => "create-consumer",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::ReadyToConsume {} => "readyToConsume",
        }
    }

    /// Serialize into a text frame, attaching `ack_id` when an answer is expected.
    pub fn encode(&self, ack_id: Option<u64>) -> Result<String, ProtocolError> {
        let mut frame = serde_json::to_value(self)?;
        if let (Some(id), Value::Object(map)) = (ack_id, &mut frame) {
            map.insert("id".into(), Value::from(id));
        }
        Ok(frame.to_string())
    }
}

/// Parameters the server hands out for one WebRTC transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStarted {
    pub call_id: CallId,
    pub send_transport: TransportParams,
    pub recv_transport: TransportParams,
    #[serde(default)]
    pub remote: Option<RemoteParty>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallJoined {
    pub call_id: CallId,
    pub send_transport: TransportParams,
    pub recv_transport: TransportParams,
    #[serde(default)]
    pub remote: Option<RemoteParty>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswered {
    #[serde(default)]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnded {
    pub reason: EndReason,
    #[serde(default)]
    pub call_id: Option<CallId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub producer_id: String,
    #[serde(default)]
    pub kind: Option<MediaKind>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProducerStateChanged {
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoreChanged {
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CallErrorReport {
    pub message: String,
}

/// Events pushed by the server, forwarded verbatim to the call state machine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    CallStarted(CallStarted),
    CallJoined(CallJoined),
    CallAnswered(CallAnswered),
    CallEnded(CallEnded),
    NewProducer(NewProducer),
    ProducerPaused(ProducerStateChanged),
    ProducerResumed(ProducerStateChanged),
    ScoreChanged(ScoreChanged),
    CallError(CallErrorReport),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallStarted(_) => "call-started",
            Self::CallJoined(_) => "call-joined",
            Self::CallAnswered(_) => "call-answered",
            Self::CallEnded(_) => "call-ended",
            Self::NewProducer(_) => "new-producer",
            Self::ProducerPaused(_) => "producer-paused",
            Self::ProducerResumed(_) => "producer-resumed",
            Self::ScoreChanged(_) => "score-changed",
            Self::CallError(_) => "call-error",
        }
    }
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Event(ServerEvent),
    Ack { id: u64, data: Value },
    /// The server rejected our credential on the live connection.
    AuthRejected(String),
    Unknown(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    ack: Option<u64>,
    #[serde(default = "empty_object")]
    data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let data = if raw.data.is_null() {
            empty_object()
        } else {
            raw.data
        };

        if let Some(id) = raw.ack {
            return Ok(Self::Ack { id, data });
        }
        let name = raw.event.ok_or(ProtocolError::Empty)?;

        if name == CONNECT_ERROR_EVENT {
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unauthorized")
                .to_string();
            return Ok(Self::AuthRejected(message));
        }

        let tagged = serde_json::json!({ "event": name, "data": data });
        match serde_json::from_value::<ServerEvent>(tagged) {
            Ok(event) => Ok(Self::Event(event)),
            Err(e) if is_known_event(&name) => Err(e.into()),
            Err(_) => Ok(Self::Unknown(name)),
        }
    }
}

fn is_known_event(name: &str) -> bool {
    matches!(
        name,
        "call-started"
            | "call-joined"
            | "call-answered"
            | "call-ended"
            | "new-producer"
            | "producer-paused"
            | "producer-resumed"
            | "score-changed"
            | "call-error"
    )
}

/// Status part shared by every acknowledgment.
#[derive(Debug, Deserialize)]
struct AckStatus {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Why an acknowledgment could not be turned into a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AckError {
    #[error("server refused: {0}")]
    Refused(String),
    #[error("malformed acknowledgment: {0}")]
    Malformed(String),
}

/// Interpret a `{success, error?, ...}` acknowledgment, decoding the body on success.
pub fn parse_ack<T: DeserializeOwned>(data: Value) -> Result<T, AckError> {
    let status: AckStatus =
        serde_json::from_value(data.clone()).map_err(|e| AckError::Malformed(e.to_string()))?;
    if !status.success {
        return Err(AckError::Refused(
            status.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }
    serde_json::from_value(data).map_err(|e| AckError::Malformed(e.to_string()))
}
