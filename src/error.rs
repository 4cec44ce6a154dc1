//! Error types for connection commands

use portmux_shared::{ConnectionId, ConnectionState, ErrorKind, TransportKind};
use thiserror::Error;

/// Broad class of a failure, used for logging and for the caller's retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input; rejected before the registry is touched
    Validation,
    /// The resource could not be acquired; no registry entry is left behind
    Resource,
    /// A live connection failed or refused an operation
    Runtime,
}

/// Errors returned by connection commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid connection id: {0}")]
    InvalidId(String),

    #[error("Connection {id} is a {actual} connection, not {expected}")]
    WrongTransport {
        id: ConnectionId,
        expected: TransportKind,
        actual: TransportKind,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection already open: {0}")]
    DuplicateId(ConnectionId),

    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),

    #[error("Connection {id} is not open (state: {state})")]
    NotOpen {
        id: ConnectionId,
        state: ConnectionState,
    },

    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    #[error("Serial port unavailable: {path}: {reason}")]
    PortUnavailable { path: String, reason: String },

    #[error("Broker unreachable: {url}: {reason}")]
    BrokerUnreachable { url: String, reason: String },

    #[error("Broker rejected credentials: {url}")]
    AuthRejected { url: String },

    #[error("Open of {0} was cancelled by close")]
    Cancelled(ConnectionId),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

impl ConnectionError {
    /// Wire-level kind for replies and error events
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::InvalidId(_) => ErrorKind::InvalidId,
            ConnectionError::WrongTransport { .. } => ErrorKind::WrongTransport,
            ConnectionError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ConnectionError::DuplicateId(_) => ErrorKind::DuplicateId,
            ConnectionError::NotFound(_) => ErrorKind::NotFound,
            ConnectionError::NotOpen { .. } => ErrorKind::NotOpen,
            ConnectionError::PortNotFound(_) => ErrorKind::PortNotFound,
            ConnectionError::PortUnavailable { .. } => ErrorKind::PortUnavailable,
            ConnectionError::BrokerUnreachable { .. } => ErrorKind::BrokerUnreachable,
            ConnectionError::AuthRejected { .. } => ErrorKind::AuthRejected,
            ConnectionError::Cancelled(_) => ErrorKind::Cancelled,
            ConnectionError::Write(_) => ErrorKind::WriteError,
            ConnectionError::Publish(_) => ErrorKind::PublishError,
            ConnectionError::Subscribe(_) => ErrorKind::SubscribeError,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ConnectionError::InvalidId(_)
            | ConnectionError::WrongTransport { .. }
            | ConnectionError::InvalidArgument(_)
            | ConnectionError::NotFound(_) => ErrorCategory::Validation,
            ConnectionError::DuplicateId(_)
            | ConnectionError::PortNotFound(_)
            | ConnectionError::PortUnavailable { .. }
            | ConnectionError::BrokerUnreachable { .. }
            | ConnectionError::AuthRejected { .. }
            | ConnectionError::Cancelled(_) => ErrorCategory::Resource,
            ConnectionError::NotOpen { .. }
            | ConnectionError::Write(_)
            | ConnectionError::Publish(_)
            | ConnectionError::Subscribe(_) => ErrorCategory::Runtime,
        }
    }
}

/// Result type for connection commands
pub type ConnectionResult<T> = Result<T, ConnectionError>;
