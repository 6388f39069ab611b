use bytes::BytesMut;
use thiserror::Error;

pub mod json;
pub mod log_event;

use log_event::LogEvent;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything a producer can hand to an item source factory.
///
/// Each variant is serialized by the configured [`Serializer`]; which
/// serializer is used is decided once, when the factory is built.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Event(LogEvent),
    Message(String),
    Structured(serde_json::Value),
}

impl From<LogEvent> for Payload {
    fn from(event: LogEvent) -> Self {
        Payload::Event(event)
    }
}

impl From<String> for Payload {
    fn from(message: String) -> Self {
        Payload::Message(message)
    }
}

impl From<&str> for Payload {
    fn from(message: &str) -> Self {
        Payload::Message(message.to_owned())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Structured(value)
    }
}

pub trait Serializer: Send + Sync {
    /// Appends the serialized form of `payload` to `buf`.
    fn serialize_into(&self, payload: &Payload, buf: &mut BytesMut) -> Result<(), SerializeError>;

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
