//! Command executor - dispatches bridge commands to the connection manager

use super::listeners::ListenerTable;
use crate::connection::ConnectionManager;
use crate::error::ConnectionResult;
use crate::session::SessionStore;
use portmux_shared::{Command, Reply};
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes commands received over the bridge
#[derive(Clone)]
pub struct CommandExecutor {
    manager: ConnectionManager,
    sessions: Arc<SessionStore>,
}

impl CommandExecutor {
    pub fn new(manager: ConnectionManager, sessions: Arc<SessionStore>) -> Self {
        Self { manager, sessions }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Run one command and produce its reply.
    ///
    /// `listeners` is the calling client's table; `Listen` and `Unlisten`
    /// only ever touch that client's registrations.
    pub async fn execute(&self, command: Command, listeners: &ListenerTable) -> Reply {
        let name = command.name();
        debug!(command = name, id = ?command.connection_id(), "executing command");

        let reply = match command {
            Command::ListPorts => Reply::Ports {
                ports: self.manager.list_ports().await,
            },
            Command::ListConnections => Reply::Connections {
                connections: self.manager.connections(),
            },
            Command::Open { id, config } => match self.manager.open(id, config).await {
                Ok(id) => Reply::Opened { id },
                Err(e) => Reply::error(e.kind(), e.to_string()),
            },
            Command::Close { id } => {
                self.manager.close(&id).await;
                Reply::Ack
            }
            Command::Write { id, data } => ack(self.manager.write(&id, data).await),
            Command::Publish {
                id,
                topic,
                payload,
                options,
            } => ack(self.manager.publish(&id, topic, payload, options).await),
            Command::Subscribe { id, topic } => ack(self.manager.subscribe(&id, topic).await),
            Command::Unsubscribe { id, topic } => {
                ack(self.manager.unsubscribe(&id, topic).await)
            }
            Command::SessionSave { connections } => {
                match self.sessions.save(&connections).await {
                    Ok(()) => Reply::Ack,
                    Err(e) => Reply::error(e.kind(), e.to_string()),
                }
            }
            Command::SessionLoad => match self.sessions.load().await {
                Ok(connections) => Reply::Session { connections },
                Err(e) => Reply::error(e.kind(), e.to_string()),
            },
            Command::Listen { kind, id } => Reply::Listening {
                listener: listeners.listen(kind, id),
            },
            Command::Unlisten { listener } => {
                // Disposing twice is not an error
                listeners.unlisten(listener);
                Reply::Ack
            }
        };

        if let Reply::Error { kind, message } = &reply {
            warn!(command = name, ?kind, error = %message, "command failed");
        }
        reply
    }
}

fn ack(result: ConnectionResult<()>) -> Reply {
    match result {
        Ok(()) => Reply::Ack,
        Err(e) => Reply::error(e.kind(), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ManagerSettings;
    use crate::transport::mock::MockConnector;
    use crate::transport::TransportConnector;
    use portmux_shared::{
        ConnectionConfig, ConnectionId, ErrorKind, EventKind, EventPayload, SerialConfig,
    };
    use tokio::sync::mpsc;

    struct Harness {
        executor: CommandExecutor,
        serial: Arc<MockConnector>,
        listeners: ListenerTable,
        events: mpsc::UnboundedReceiver<portmux_shared::BridgeEvent>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let serial = Arc::new(MockConnector::serial());
        let connectors: Vec<Arc<dyn TransportConnector>> = vec![serial.clone()];
        let manager = ConnectionManager::new(connectors, ManagerSettings::default());
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("session.json")));
        let (sink, events) = mpsc::unbounded_channel();
        let listeners = ListenerTable::new(manager.router().clone(), sink);

        Harness {
            executor: CommandExecutor::new(manager, sessions),
            serial,
            listeners,
            events,
            _dir: dir,
        }
    }

    fn open_s1() -> Command {
        Command::Open {
            id: Some("s1".into()),
            config: ConnectionConfig::Serial(SerialConfig::new("/dev/ttyUSB0", 9600)),
        }
    }

    #[tokio::test]
    async fn test_write_to_unknown_id_is_not_found() {
        let h = harness();
        let reply = h
            .executor
            .execute(
                Command::Write {
                    id: "s1".into(),
                    data: vec![1, 2],
                },
                &h.listeners,
            )
            .await;
        assert!(matches!(
            reply,
            Reply::Error {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_open_write_close() {
        let h = harness();
        let reply = h.executor.execute(open_s1(), &h.listeners).await;
        assert_eq!(reply, Reply::Opened { id: "s1".into() });

        let write = Command::Write {
            id: "s1".into(),
            data: b"AT\r\n".to_vec(),
        };
        assert_eq!(h.executor.execute(write, &h.listeners).await, Reply::Ack);
        assert_eq!(
            h.serial.link(&"s1".into()).unwrap().writes(),
            vec![b"AT\r\n".to_vec()]
        );

        let close = Command::Close { id: "s1".into() };
        assert_eq!(h.executor.execute(close.clone(), &h.listeners).await, Reply::Ack);
        assert_eq!(h.executor.execute(close, &h.listeners).await, Reply::Ack);
    }

    #[tokio::test]
    async fn test_listen_routes_into_client_sink() {
        let mut h = harness();
        let reply = h
            .executor
            .execute(
                Command::Listen {
                    kind: EventKind::Data,
                    id: "s1".into(),
                },
                &h.listeners,
            )
            .await;
        let Reply::Listening { listener } = reply else {
            panic!("expected listener token, got {:?}", reply);
        };

        h.executor.execute(open_s1(), &h.listeners).await;
        let id = ConnectionId::from("s1");
        h.serial.link(&id).unwrap().emit(EventPayload::Data {
            bytes: b"OK".to_vec(),
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, id);

        let reply = h
            .executor
            .execute(Command::Unlisten { listener }, &h.listeners)
            .await;
        assert_eq!(reply, Reply::Ack);
        assert!(h.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let h = harness();
        let empty = h.executor.execute(Command::SessionLoad, &h.listeners).await;
        assert_eq!(
            empty,
            Reply::Session {
                connections: Vec::new()
            }
        );

        let connections = vec![
            ConnectionConfig::Serial(SerialConfig::new("/dev/ttyUSB0", 9600)),
            ConnectionConfig::Serial(SerialConfig::new("/dev/ttyUSB1", 115200)),
        ];
        let save = Command::SessionSave {
            connections: connections.clone(),
        };
        assert_eq!(h.executor.execute(save, &h.listeners).await, Reply::Ack);

        let loaded = h.executor.execute(Command::SessionLoad, &h.listeners).await;
        assert_eq!(loaded, Reply::Session { connections });
    }

    #[tokio::test]
    async fn test_list_connections() {
        let h = harness();
        h.executor.execute(open_s1(), &h.listeners).await;

        let reply = h
            .executor
            .execute(Command::ListConnections, &h.listeners)
            .await;
        let Reply::Connections { connections } = reply else {
            panic!("expected connections, got {:?}", reply);
        };
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].id, ConnectionId::from("s1"));
    }
}
