use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::capture::{CaptureRequest, CaptureResult};
use super::EnvelopeError;

/// Key that tags a JSON object as one of ours.
pub const MARKER_KEY: &str = "marker";

/// Discriminant of a [`Message`], as written in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ready,
    RequestUpdate,
    Update,
    Ack,
    Resize,
    Error,
    Log,
    Capture,
    CaptureResult,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Ready,
        MessageKind::RequestUpdate,
        MessageKind::Update,
        MessageKind::Ack,
        MessageKind::Resize,
        MessageKind::Error,
        MessageKind::Log,
        MessageKind::Capture,
        MessageKind::CaptureResult,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Ready => "ready",
            MessageKind::RequestUpdate => "request-update",
            MessageKind::Update => "update",
            MessageKind::Ack => "ack",
            MessageKind::Resize => "resize",
            MessageKind::Error => "error",
            MessageKind::Log => "log",
            MessageKind::Capture => "capture",
            MessageKind::CaptureResult => "capture-result",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == raw)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context delivered to the guest's `render`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePayload {
    pub data: Value,
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Guest wall clock in milliseconds when `render` was invoked.
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePayload {
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A typed protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ready,
    RequestUpdate,
    Update(UpdatePayload),
    Ack(AckPayload),
    Resize(ResizePayload),
    Error(ErrorPayload),
    Log(LogPayload),
    Capture(CaptureRequest),
    CaptureResult(CaptureResult),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ready => MessageKind::Ready,
            Message::RequestUpdate => MessageKind::RequestUpdate,
            Message::Update(_) => MessageKind::Update,
            Message::Ack(_) => MessageKind::Ack,
            Message::Resize(_) => MessageKind::Resize,
            Message::Error(_) => MessageKind::Error,
            Message::Log(_) => MessageKind::Log,
            Message::Capture(_) => MessageKind::Capture,
            Message::CaptureResult(_) => MessageKind::CaptureResult,
        }
    }

    fn payload_value(&self) -> Value {
        let value = match self {
            Message::Ready | Message::RequestUpdate => Ok(Value::Object(Map::new())),
            Message::Update(p) => serde_json::to_value(p),
            Message::Ack(p) => serde_json::to_value(p),
            Message::Resize(p) => serde_json::to_value(p),
            Message::Error(p) => serde_json::to_value(p),
            Message::Log(p) => serde_json::to_value(p),
            Message::Capture(p) => serde_json::to_value(p),
            Message::CaptureResult(p) => serde_json::to_value(p),
        };
        // Payload types are plain structs with string keys
        value.unwrap_or(Value::Null)
    }

    fn from_parts(kind: MessageKind, payload: Value) -> Result<Self, EnvelopeError> {
        fn decode<T: serde::de::DeserializeOwned>(
            kind: MessageKind,
            payload: Value,
        ) -> Result<T, EnvelopeError> {
            serde_json::from_value(payload).map_err(|e| EnvelopeError::BadPayload {
                kind: kind.as_str(),
                reason: e.to_string(),
            })
        }

        Ok(match kind {
            MessageKind::Ready => Message::Ready,
            MessageKind::RequestUpdate => Message::RequestUpdate,
            MessageKind::Update => {
                let payload = if payload.is_null() { json!({}) } else { payload };
                Message::Update(decode(kind, payload)?)
            }
            MessageKind::Ack => Message::Ack(decode(kind, payload)?),
            MessageKind::Resize => Message::Resize(decode(kind, payload)?),
            MessageKind::Error => Message::Error(decode(kind, payload)?),
            MessageKind::Log => Message::Log(decode(kind, payload)?),
            MessageKind::Capture => Message::Capture(decode(kind, payload)?),
            MessageKind::CaptureResult => Message::CaptureResult(decode(kind, payload)?),
        })
    }
}

/// A message bound to the session token it was issued under.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub token: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(token: impl Into<String>, message: Message) -> Self {
        Self {
            token: token.into(),
            message,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "marker": true,
            "token": self.token,
            "type": self.message.kind().as_str(),
            "payload": self.message.payload_value(),
        })
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Authenticates and decodes an inbound envelope.
    ///
    /// The marker and token are checked before the type and payload
    /// are looked at, so a foreign message is rejected without any
    /// payload decoding.
    pub fn open(raw: &Value, expected_token: &str) -> Result<Message, EnvelopeError> {
        let obj = raw.as_object().ok_or(EnvelopeError::NotAnObject)?;

        if obj.get(MARKER_KEY) != Some(&Value::Bool(true)) {
            return Err(EnvelopeError::MissingMarker);
        }

        match obj.get("token").and_then(Value::as_str) {
            Some(token) if !expected_token.is_empty() && token == expected_token => {}
            _ => return Err(EnvelopeError::TokenMismatch),
        }

        let type_name = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        let kind = MessageKind::parse(type_name)
            .ok_or_else(|| EnvelopeError::UnknownType(type_name.to_string()))?;
        let payload = obj.get("payload").cloned().unwrap_or(Value::Null);

        Message::from_parts(kind, payload)
    }

    /// Like [`Envelope::open`], from raw JSON text.
    pub fn open_str(raw: &str, expected_token: &str) -> Result<Message, EnvelopeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        Self::open(&value, expected_token)
    }
}
