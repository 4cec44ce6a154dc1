//! Transport trait abstraction for pluggable connection backends

use crate::error::{ConnectionError, ConnectionResult};
use async_trait::async_trait;
use portmux_shared::{
    ConnectionConfig, ConnectionId, EventPayload, PortInfo, PublishOptions, TransportKind,
};
use tokio::sync::mpsc;

/// Side channel a transport pushes its inbound events into.
///
/// `EventPayload::Closed` must be the last event a transport sends.
pub type TransportEvents = mpsc::UnboundedSender<EventPayload>;

fn unsupported(kind: TransportKind, operation: &str) -> ConnectionError {
    ConnectionError::InvalidArgument(format!(
        "{} is not supported by {} connections",
        operation, kind
    ))
}

/// A live, exclusively owned I/O resource.
///
/// Each method only runs while the connection is open; calls are serialized
/// by the owning [`TransportHandle`](super::TransportHandle).
#[async_trait]
pub trait Transport: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Write raw bytes, completing only when all of them were accepted
    async fn write(&mut self, _data: &[u8]) -> ConnectionResult<()> {
        Err(unsupported(self.kind(), "write"))
    }

    async fn publish(
        &mut self,
        _topic: &str,
        _payload: &[u8],
        _options: PublishOptions,
    ) -> ConnectionResult<()> {
        Err(unsupported(self.kind(), "publish"))
    }

    /// Subscribing to an already subscribed filter succeeds without effect
    async fn subscribe(&mut self, _filter: &str) -> ConnectionResult<()> {
        Err(unsupported(self.kind(), "subscribe"))
    }

    async fn unsubscribe(&mut self, _filter: &str) -> ConnectionResult<()> {
        Err(unsupported(self.kind(), "unsubscribe"))
    }

    /// Release the resource. Best-effort and called exactly once.
    async fn shutdown(&mut self);
}

/// Factory for opening transports of one kind
#[async_trait]
pub trait TransportConnector: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Acquire the resource described by `config`.
    ///
    /// Inbound events flow into `events` from the moment this returns `Ok`.
    async fn connect(
        &self,
        id: &ConnectionId,
        config: &ConnectionConfig,
        events: TransportEvents,
    ) -> ConnectionResult<Box<dyn Transport>>;

    /// Devices this transport can currently reach
    async fn list_ports(&self) -> Vec<PortInfo> {
        Vec::new()
    }

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
