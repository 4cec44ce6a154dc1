//! portmux Shared Protocol Types
//!
//! This crate provides the connection, event and bridge protocol types shared
//! between the privileged host process and the UI-side bridge that drives it.

pub mod codec;
pub mod config;
pub mod event;
pub mod protocol;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub use config::{
    ConnectionConfig, DataBits, FlowControl, MqttConfig, Parity, SerialConfig, StopBits,
};
pub use event::{BridgeEvent, EventKind, EventPayload};
pub use protocol::{Command, ConnectionSummary, Frame, PublishOptions, QoS, Reply, Request};
pub use state_machine::ConnectionState;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Limits and protocol defaults
pub mod limits {
    /// Longest accepted connection id, in characters
    pub const MAX_ID_LEN: usize = 128;

    /// Port used when a broker URL does not name one
    pub const DEFAULT_MQTT_PORT: u16 = 1883;

    /// Shortest keep-alive the MQTT client accepts
    pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

    /// Version stamped into persisted session records
    pub const SESSION_RECORD_VERSION: u32 = 1;
}

static NEXT_GENERATED_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for one logical connection.
///
/// Unique among currently open connections only; an id may be reused once
/// its previous connection has closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh process-local id of the form `conn-<n>`
    pub fn generate() -> Self {
        let n = NEXT_GENERATED_ID.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn-{}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the id is non-empty, bounded and printable
    pub fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("connection id must not be empty".into());
        }
        if self.0.chars().count() > limits::MAX_ID_LEN {
            return Err(format!(
                "connection id longer than {} characters",
                limits::MAX_ID_LEN
            ));
        }
        if self.0.chars().any(char::is_control) {
            return Err("connection id contains control characters".into());
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Transport families a connection can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Serial,
    Mqtt,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Mqtt => write!(f, "MQTT"),
        }
    }
}

/// A serial device visible on the host at enumeration time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub path: String,
    /// "usb", "pci", "bluetooth" or "unknown"
    pub port_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// Branchable failure classes, shared by command replies and error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidId,
    WrongTransport,
    InvalidArgument,
    DuplicateId,
    NotFound,
    NotOpen,
    PortNotFound,
    PortUnavailable,
    BrokerUnreachable,
    AuthRejected,
    Cancelled,
    WriteError,
    PublishError,
    SubscribeError,
    ReadError,
    Disconnected,
    PersistError,
    ProtocolError,
}
