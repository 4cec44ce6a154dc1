//! Per-connection command actor
//!
//! A [`TransportHandle`] is the only owner of a live [`Transport`]. Commands
//! travel through a bounded FIFO queue to a task that runs them one at a
//! time, so commands issued against the same connection complete in issue
//! order. Closing cancels whatever command is in flight, fails everything
//! still queued and shuts the transport down exactly once.

use crate::error::{ConnectionError, ConnectionResult};
use crate::transport::traits::Transport;
use portmux_shared::{ConnectionId, PublishOptions, TransportKind};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Responder = oneshot::Sender<ConnectionResult<()>>;

const CLOSED_REASON: &str = "connection closed";

/// Work queued for the actor task
enum TransportCommand {
    Write {
        data: Vec<u8>,
        respond_to: Responder,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        options: PublishOptions,
        respond_to: Responder,
    },
    Subscribe {
        filter: String,
        respond_to: Responder,
    },
    Unsubscribe {
        filter: String,
        respond_to: Responder,
    },
}

impl TransportCommand {
    /// Answer without running, using the error class of the operation
    fn fail(self, reason: &str) {
        let (respond_to, error) = match self {
            TransportCommand::Write { respond_to, .. } => {
                (respond_to, ConnectionError::Write(reason.to_string()))
            }
            TransportCommand::Publish { respond_to, .. } => {
                (respond_to, ConnectionError::Publish(reason.to_string()))
            }
            TransportCommand::Subscribe { respond_to, .. }
            | TransportCommand::Unsubscribe { respond_to, .. } => {
                (respond_to, ConnectionError::Subscribe(reason.to_string()))
            }
        };
        let _ = respond_to.send(Err(error));
    }
}

/// Handle to one live connection's actor task.
///
/// Dropping the last handle closes the transport without waiting.
pub struct TransportHandle {
    id: ConnectionId,
    kind: TransportKind,
    commands: mpsc::Sender<TransportCommand>,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

impl TransportHandle {
    /// Move `transport` into a new actor task.
    ///
    /// `shutdown_grace` bounds how long the transport's own shutdown may take.
    pub fn spawn(
        id: ConnectionId,
        transport: Box<dyn Transport>,
        queue_depth: usize,
        shutdown_grace: Duration,
    ) -> Self {
        let (commands, rx) = mpsc::channel(queue_depth.max(1));
        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();
        let kind = transport.kind();

        tokio::spawn(drive(
            id.clone(),
            transport,
            rx,
            shutdown.clone(),
            finished.clone(),
            shutdown_grace,
        ));

        Self {
            id,
            kind,
            commands,
            shutdown,
            finished,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub async fn write(&self, data: Vec<u8>) -> ConnectionResult<()> {
        self.request(ConnectionError::Write, |respond_to| {
            TransportCommand::Write { data, respond_to }
        })
        .await
    }

    pub async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> ConnectionResult<()> {
        self.request(ConnectionError::Publish, |respond_to| {
            TransportCommand::Publish {
                topic,
                payload,
                options,
                respond_to,
            }
        })
        .await
    }

    pub async fn subscribe(&self, filter: String) -> ConnectionResult<()> {
        self.request(ConnectionError::Subscribe, |respond_to| {
            TransportCommand::Subscribe { filter, respond_to }
        })
        .await
    }

    pub async fn unsubscribe(&self, filter: String) -> ConnectionResult<()> {
        self.request(ConnectionError::Subscribe, |respond_to| {
            TransportCommand::Unsubscribe { filter, respond_to }
        })
        .await
    }

    /// Stop the actor and wait until the transport has been shut down.
    ///
    /// Safe to call any number of times from any number of tasks.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.finished.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.finished.is_cancelled()
    }

    async fn request<B>(
        &self,
        closed: fn(String) -> ConnectionError,
        build: B,
    ) -> ConnectionResult<()>
    where
        B: FnOnce(Responder) -> TransportCommand,
    {
        if self.shutdown.is_cancelled() {
            return Err(closed(CLOSED_REASON.to_string()));
        }

        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(build(respond_to))
            .await
            .map_err(|_| closed(CLOSED_REASON.to_string()))?;
        response
            .await
            .map_err(|_| closed(CLOSED_REASON.to_string()))?
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn drive(
    id: ConnectionId,
    mut transport: Box<dyn Transport>,
    mut commands: mpsc::Receiver<TransportCommand>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    shutdown_grace: Duration,
) {
    // Fires on every exit path, including a panicking transport
    let _finished = finished.drop_guard();

    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        execute(transport.as_mut(), command, &shutdown).await;
    }

    commands.close();
    let mut drained = 0usize;
    while let Ok(command) = commands.try_recv() {
        command.fail(CLOSED_REASON);
        drained += 1;
    }
    if drained > 0 {
        debug!(id = %id, drained, "failed queued commands on close");
    }

    if timeout(shutdown_grace, transport.shutdown()).await.is_err() {
        warn!(id = %id, "transport shutdown timed out");
    }
    debug!(id = %id, "transport released");
}

async fn execute(
    transport: &mut dyn Transport,
    command: TransportCommand,
    shutdown: &CancellationToken,
) {
    match command {
        TransportCommand::Write { data, respond_to } => {
            let result = abortable(
                shutdown,
                transport.write(&data),
                ConnectionError::Write,
            )
            .await;
            let _ = respond_to.send(result);
        }
        TransportCommand::Publish {
            topic,
            payload,
            options,
            respond_to,
        } => {
            let result = abortable(
                shutdown,
                transport.publish(&topic, &payload, options),
                ConnectionError::Publish,
            )
            .await;
            let _ = respond_to.send(result);
        }
        TransportCommand::Subscribe { filter, respond_to } => {
            let result = abortable(
                shutdown,
                transport.subscribe(&filter),
                ConnectionError::Subscribe,
            )
            .await;
            let _ = respond_to.send(result);
        }
        TransportCommand::Unsubscribe { filter, respond_to } => {
            let result = abortable(
                shutdown,
                transport.unsubscribe(&filter),
                ConnectionError::Subscribe,
            )
            .await;
            let _ = respond_to.send(result);
        }
    }
}

/// Run one transport operation unless the connection is closed first
async fn abortable<F>(
    shutdown: &CancellationToken,
    operation: F,
    aborted: fn(String) -> ConnectionError,
) -> ConnectionResult<()>
where
    F: Future<Output = ConnectionResult<()>>,
{
    tokio::select! {
        result = operation => result,
        _ = shutdown.cancelled() => Err(aborted("aborted by close".to_string())),
    }
}
