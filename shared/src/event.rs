//! Events pushed from the host to registered listeners

use crate::{ConnectionId, ConnectionState, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened on a connection, without the connection tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    /// Raw inbound bytes; no framing is applied
    Data { bytes: Vec<u8> },
    /// One broker message on a subscribed topic
    MqttMessage { topic: String, payload: Vec<u8> },
    StatusChanged { state: ConnectionState },
    ErrorOccurred { kind: ErrorKind, detail: String },
    /// Always the last event for a connection lifecycle
    Closed,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Data { .. } => EventKind::Data,
            EventPayload::MqttMessage { .. } => EventKind::MqttMessage,
            EventPayload::StatusChanged { .. } => EventKind::Status,
            EventPayload::ErrorOccurred { .. } => EventKind::Error,
            EventPayload::Closed => EventKind::Closed,
        }
    }

    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        EventPayload::ErrorOccurred {
            kind,
            detail: detail.into(),
        }
    }
}

/// Event categories a listener can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Data,
    MqttMessage,
    Status,
    Error,
    Closed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Data => "data",
            EventKind::MqttMessage => "mqtt_message",
            EventKind::Status => "status",
            EventKind::Error => "error",
            EventKind::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An event tagged with the connection it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub id: ConnectionId,
    pub payload: EventPayload,
}

impl BridgeEvent {
    pub fn new(id: ConnectionId, payload: EventPayload) -> Self {
        Self { id, payload }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
