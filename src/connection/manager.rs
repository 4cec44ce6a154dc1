//! Connection manager facade
//!
//! The only component that mutates the registry. Each command validates its
//! arguments, looks the connection up and forwards to its transport handle;
//! each open connection gets an event pump task that forwards transport
//! events to the router and retires the connection when its transport ends.

use crate::config::HostConfig;
use crate::connection::registry::{CloseStep, ConnectionRegistry, Retired};
use crate::connection::router::{EventRouter, Listener};
use crate::error::{ConnectionError, ConnectionResult};
use crate::transport::{MqttConnector, SerialConnector, TransportConnector, TransportHandle};
use futures::future::join_all;
use portmux_shared::config::{validate_topic_filter, validate_topic_name};
use portmux_shared::{
    ConnectionConfig, ConnectionId, ConnectionState, ConnectionSummary, EventKind, EventPayload,
    PortInfo, PublishOptions, TransportKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Timing and queueing knobs for the manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Upper bound on acquiring a transport
    pub connect_timeout: Duration,
    /// Upper bound on a transport's own shutdown
    pub close_timeout: Duration,
    /// Commands queued per connection before callers wait
    pub command_queue_depth: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            command_queue_depth: 64,
        }
    }
}

struct Inner {
    registry: Arc<ConnectionRegistry>,
    router: EventRouter,
    connectors: HashMap<TransportKind, Arc<dyn TransportConnector>>,
    settings: ManagerSettings,
}

/// Public entry point for every connection command.
///
/// Cheap to clone; clones drive the same set of connections.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager over the given connectors, one per transport kind
    pub fn new(connectors: Vec<Arc<dyn TransportConnector>>, settings: ManagerSettings) -> Self {
        let connectors = connectors
            .into_iter()
            .map(|connector| (connector.kind(), connector))
            .collect();

        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(ConnectionRegistry::new()),
                router: EventRouter::new(),
                connectors,
                settings,
            }),
        }
    }

    /// Manager with the real serial and MQTT transports
    pub fn with_default_transports(config: &HostConfig) -> Self {
        let settings = config.manager_settings();
        let connectors: Vec<Arc<dyn TransportConnector>> = vec![
            Arc::new(SerialConnector::new(config.serial_read_buffer)),
            Arc::new(MqttConnector::new(
                settings.connect_timeout,
                config.mqtt_channel_capacity,
            )),
        ];
        Self::new(connectors, settings)
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    /// Register a listener for one event kind on one connection
    pub fn listen(&self, kind: EventKind, id: ConnectionId) -> Listener {
        self.inner.router.listen(kind, id)
    }

    /// Serial devices currently visible on the host
    pub async fn list_ports(&self) -> Vec<PortInfo> {
        match self.inner.connectors.get(&TransportKind::Serial) {
            Some(connector) => connector.list_ports().await,
            None => Vec::new(),
        }
    }

    /// Live connections sorted by id
    pub fn connections(&self) -> Vec<ConnectionSummary> {
        self.inner.registry.snapshot()
    }

    pub fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.inner.registry.state(id)
    }

    /// Open a connection, generating an id when none is given.
    ///
    /// On any failure no registry entry is left behind.
    pub async fn open(
        &self,
        id: Option<ConnectionId>,
        config: ConnectionConfig,
    ) -> ConnectionResult<ConnectionId> {
        let kind = config.kind();
        config
            .validate()
            .map_err(ConnectionError::InvalidArgument)?;
        let connector = self
            .inner
            .connectors
            .get(&kind)
            .cloned()
            .ok_or_else(|| {
                ConnectionError::InvalidArgument(format!("no {} transport available", kind))
            })?;

        let reservation = match id {
            Some(id) => {
                id.validate().map_err(ConnectionError::InvalidId)?;
                self.inner.registry.create(&id, kind)?
            }
            None => loop {
                match self.inner.registry.create(&ConnectionId::generate(), kind) {
                    Ok(reservation) => break reservation,
                    Err(ConnectionError::DuplicateId(_)) => continue,
                    Err(e) => return Err(e),
                }
            },
        };
        let id = reservation.id().clone();
        let generation = reservation.generation();
        let aborted = reservation.aborted();
        info!(id = %id, kind = %kind, target = %config.target(), "opening connection");

        let (events, events_rx) = mpsc::unbounded_channel();
        let connecting = timeout(
            self.inner.settings.connect_timeout,
            connector.connect(&id, &config, events),
        );
        let transport = tokio::select! {
            biased;
            _ = aborted.cancelled() => {
                info!(id = %id, "open cancelled by close");
                return Err(ConnectionError::Cancelled(id));
            }
            result = connecting => match result {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    warn!(id = %id, error = %e, "open failed");
                    return Err(e);
                }
                Err(_) => {
                    let e = open_timed_out(&config);
                    warn!(id = %id, error = %e, "open timed out");
                    return Err(e);
                }
            },
        };

        let handle = TransportHandle::spawn(
            id.clone(),
            transport,
            self.inner.settings.command_queue_depth,
            self.inner.settings.close_timeout,
        );
        if let Err(handle) = reservation.commit(handle, &self.inner.router) {
            handle.close().await;
            info!(id = %id, "open cancelled by close");
            return Err(ConnectionError::Cancelled(id));
        }

        self.inner.router.deliver(
            &id,
            generation,
            EventPayload::StatusChanged {
                state: ConnectionState::Open,
            },
        );
        tokio::spawn(pump_events(self.clone(), id.clone(), generation, events_rx));

        info!(id = %id, "connection open");
        Ok(id)
    }

    /// Close a connection. Never fails; closing an unknown or already
    /// closed id does nothing.
    pub async fn close(&self, id: &ConnectionId) {
        match self.inner.registry.begin_close(id) {
            CloseStep::Idle => debug!(id = %id, "close: nothing to do"),
            CloseStep::Aborted => info!(id = %id, "close aborted a pending open"),
            CloseStep::Release { generation, handle } => {
                self.inner.router.deliver(
                    id,
                    generation,
                    EventPayload::StatusChanged {
                        state: ConnectionState::Closing,
                    },
                );
                handle.close().await;
                self.inner
                    .registry
                    .remove(id, generation, &self.inner.router, |state| {
                        (state == ConnectionState::Closing).then(|| {
                            (
                                ConnectionState::Closed,
                                vec![EventPayload::StatusChanged {
                                    state: ConnectionState::Closed,
                                }],
                            )
                        })
                    });
                info!(id = %id, "connection closed");
            }
        }
    }

    pub async fn write(&self, id: &ConnectionId, data: Vec<u8>) -> ConnectionResult<()> {
        let (generation, handle) = self.inner.registry.get(id, TransportKind::Serial)?;
        let result = handle.write(data).await;
        self.check_runtime(id, generation, result).await
    }

    pub async fn publish(
        &self,
        id: &ConnectionId,
        topic: String,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> ConnectionResult<()> {
        validate_topic_name(&topic).map_err(ConnectionError::InvalidArgument)?;
        let (generation, handle) = self.inner.registry.get(id, TransportKind::Mqtt)?;
        let result = handle.publish(topic, payload, options).await;
        self.check_runtime(id, generation, result).await
    }

    /// Subscribing to an already subscribed filter succeeds without effect
    pub async fn subscribe(&self, id: &ConnectionId, topic: String) -> ConnectionResult<()> {
        validate_topic_filter(&topic).map_err(ConnectionError::InvalidArgument)?;
        let (_, handle) = self.inner.registry.get(id, TransportKind::Mqtt)?;
        handle.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, id: &ConnectionId, topic: String) -> ConnectionResult<()> {
        validate_topic_filter(&topic).map_err(ConnectionError::InvalidArgument)?;
        let (_, handle) = self.inner.registry.get(id, TransportKind::Mqtt)?;
        handle.unsubscribe(topic).await
    }

    /// Close every live connection
    pub async fn shutdown(&self) {
        let ids = self.inner.registry.live_ids();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "closing all connections");
        join_all(ids.iter().map(|id| self.close(id))).await;
    }

    /// A write or publish that failed on a still-open connection fails the
    /// whole connection
    async fn check_runtime(
        &self,
        id: &ConnectionId,
        generation: u64,
        result: ConnectionResult<()>,
    ) -> ConnectionResult<()> {
        let Err(error) = result else {
            return Ok(());
        };

        let retired = self
            .inner
            .registry
            .remove(id, generation, &self.inner.router, |state| {
                (state == ConnectionState::Open).then(|| {
                    (
                        ConnectionState::Failed,
                        vec![
                            EventPayload::error(error.kind(), error.to_string()),
                            EventPayload::StatusChanged {
                                state: ConnectionState::Failed,
                            },
                        ],
                    )
                })
            });
        if let Some(retired) = retired {
            warn!(id = %id, error = %error, "connection failed");
            release(retired).await;
        }
        Err(error)
    }

    /// The transport reported its end
    async fn transport_ended(&self, id: &ConnectionId, generation: u64) {
        let retired = self
            .inner
            .registry
            .remove(id, generation, &self.inner.router, |state| {
                Some(match state {
                    ConnectionState::Closing => (
                        ConnectionState::Closed,
                        vec![EventPayload::StatusChanged {
                            state: ConnectionState::Closed,
                        }],
                    ),
                    _ => (
                        ConnectionState::Failed,
                        vec![EventPayload::StatusChanged {
                            state: ConnectionState::Failed,
                        }],
                    ),
                })
            });

        if let Some(retired) = retired {
            if retired.state == ConnectionState::Failed {
                warn!(id = %id, "transport ended unexpectedly");
            }
            release(retired).await;
        }
    }

    #[cfg(test)]
    fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }
}

async fn release(retired: Retired) {
    if let Some(handle) = retired.handle {
        handle.close().await;
    }
}

fn open_timed_out(config: &ConnectionConfig) -> ConnectionError {
    match config {
        ConnectionConfig::Serial(serial) => ConnectionError::PortUnavailable {
            path: serial.path.clone(),
            reason: "timed out opening the port".into(),
        },
        ConnectionConfig::Mqtt(mqtt) => ConnectionError::BrokerUnreachable {
            url: mqtt.broker_url.clone(),
            reason: "timed out connecting".into(),
        },
    }
}

/// Forward one connection's transport events until it is retired
async fn pump_events(
    manager: ConnectionManager,
    id: ConnectionId,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<EventPayload>,
) {
    while let Some(payload) = events.recv().await {
        if payload == EventPayload::Closed {
            break;
        }
        if !manager.inner.router.deliver(&id, generation, payload) {
            return;
        }
    }
    manager.transport_ended(&id, generation).await;
}
