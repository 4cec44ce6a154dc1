//! Bridge protocol: commands down, replies and events up
//!
//! Every frame on the bridge socket is one [`Frame`]. The UI side sends
//! `Frame::Request`, the host answers each with exactly one
//! `Frame::Response` carrying the same `request_id`, and pushes
//! `Frame::Event` for every listener the client registered.

use crate::{
    BridgeEvent, ConnectionConfig, ConnectionId, ConnectionState, ErrorKind, EventKind, PortInfo,
    TransportKind,
};
use serde::{Deserialize, Serialize};

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

/// Commands accepted by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    ListPorts,
    ListConnections,
    Open {
        /// Generated by the host when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<ConnectionId>,
        config: ConnectionConfig,
    },
    Close {
        id: ConnectionId,
    },
    Write {
        id: ConnectionId,
        data: Vec<u8>,
    },
    Publish {
        id: ConnectionId,
        topic: String,
        payload: Vec<u8>,
        #[serde(default)]
        options: PublishOptions,
    },
    Subscribe {
        id: ConnectionId,
        topic: String,
    },
    Unsubscribe {
        id: ConnectionId,
        topic: String,
    },
    SessionSave {
        connections: Vec<ConnectionConfig>,
    },
    SessionLoad,
    /// Register for one event kind on one connection
    Listen {
        kind: EventKind,
        id: ConnectionId,
    },
    /// Dispose a listener returned by `Listen`
    Unlisten {
        listener: u64,
    },
}

impl Command {
    /// The connection this command targets, if any
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Command::Open { id, .. } => id.as_ref(),
            Command::Close { id }
            | Command::Write { id, .. }
            | Command::Publish { id, .. }
            | Command::Subscribe { id, .. }
            | Command::Unsubscribe { id, .. } => Some(id),
            Command::ListPorts
            | Command::ListConnections
            | Command::SessionSave { .. }
            | Command::SessionLoad
            | Command::Listen { .. }
            | Command::Unlisten { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::ListPorts => "list_ports",
            Command::ListConnections => "list_connections",
            Command::Open { .. } => "open",
            Command::Close { .. } => "close",
            Command::Write { .. } => "write",
            Command::Publish { .. } => "publish",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::SessionSave { .. } => "session_save",
            Command::SessionLoad => "session_load",
            Command::Listen { .. } => "listen",
            Command::Unlisten { .. } => "unlisten",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u64,
    pub command: Command,
}

/// One live connection as reported by `ListConnections`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub kind: TransportKind,
    pub state: ConnectionState,
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Opened { id: ConnectionId },
    Ports { ports: Vec<PortInfo> },
    Connections { connections: Vec<ConnectionSummary> },
    Session { connections: Vec<ConnectionConfig> },
    Listening { listener: u64 },
    Error { kind: ErrorKind, message: String },
}

impl Reply {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }
}

/// Everything that travels over the bridge socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request(Request),
    Response { request_id: u64, reply: Reply },
    Event(BridgeEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventPayload, SerialConfig};

    #[test]
    fn test_command_parses_from_ui_json() {
        let json = r#"{
            "type": "request",
            "request_id": 7,
            "command": {
                "op": "open",
                "id": "s1",
                "config": {"kind": "serial", "path": "/dev/ttyUSB0", "baud_rate": 9600}
            }
        }"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        let Frame::Request(request) = frame else {
            panic!("expected request frame");
        };
        assert_eq!(request.request_id, 7);
        assert_eq!(
            request.command,
            Command::Open {
                id: Some("s1".into()),
                config: ConnectionConfig::Serial(SerialConfig::new("/dev/ttyUSB0", 9600)),
            }
        );
    }

    #[test]
    fn test_publish_options_default() {
        let json = r#"{"op":"publish","id":"m1","topic":"a/b","payload":[104,105]}"#;
        let command: Command = serde_json::from_str(json).unwrap();
        let Command::Publish { options, .. } = command else {
            panic!("expected publish");
        };
        assert_eq!(options, PublishOptions::default());
        assert_eq!(options.qos, QoS::AtMostOnce);
    }

    #[test]
    fn test_connection_id_routing_key() {
        let write = Command::Write {
            id: "s1".into(),
            data: vec![],
        };
        assert_eq!(write.connection_id(), Some(&ConnectionId::from("s1")));
        assert_eq!(Command::ListPorts.connection_id(), None);
        assert_eq!(write.name(), "write");
    }

    #[test]
    fn test_error_reply_shape() {
        let reply = Reply::error(ErrorKind::NotFound, "connection not found: s1");
        assert!(reply.is_error());
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["kind"], "not_found");
    }

    #[test]
    fn test_event_frame_shape() {
        let frame = Frame::Event(BridgeEvent::new("s1".into(), EventPayload::Closed));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["payload"]["event"], "closed");
    }
}
