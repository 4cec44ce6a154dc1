//! One bridge client connection
//!
//! The socket is split: a writer task serializes responses and pushed
//! events, while the reader decodes requests. Requests that target a
//! connection id go through a per-id lane so they complete in issue order;
//! requests for different ids, and id-less requests, run concurrently.
//! Idle lanes shut themselves down and are rebuilt on demand.

use crate::command::{CommandExecutor, ListenerTable};
use bytes::BytesMut;
use portmux_shared::codec::{self, CodecError, FrameDecoder};
use portmux_shared::{BridgeEvent, Command, ConnectionId, Frame, Request};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 8192;

/// How long a lane with nothing queued stays alive
const LANE_IDLE: Duration = Duration::from_secs(30);

struct ClientSession {
    client: u64,
    executor: CommandExecutor,
    listeners: Arc<ListenerTable>,
    frames: mpsc::UnboundedSender<Frame>,
    lanes: HashMap<ConnectionId, mpsc::UnboundedSender<Request>>,
    lane_idle: Duration,
}

impl ClientSession {
    fn new(
        client: u64,
        executor: CommandExecutor,
        listeners: Arc<ListenerTable>,
        frames: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            client,
            executor,
            listeners,
            frames,
            lanes: HashMap::new(),
            lane_idle: LANE_IDLE,
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::Request(request) => self.submit(request).await,
            Frame::Response { request_id, .. } => {
                warn!(client = self.client, request_id, "ignoring response frame from client");
            }
            Frame::Event(_) => {
                warn!(client = self.client, "ignoring event frame from client");
            }
        }
    }

    async fn submit(&mut self, request: Request) {
        // Listener changes apply before anything read after them
        if matches!(request.command, Command::Listen { .. } | Command::Unlisten { .. }) {
            let reply = self.executor.execute(request.command, &self.listeners).await;
            let _ = self.frames.send(Frame::Response {
                request_id: request.request_id,
                reply,
            });
            return;
        }

        // Close also runs ahead of the lane so it can abort the command the
        // lane is waiting on; the queued copy keeps it after earlier commands.
        if let Command::Close { id } = &request.command {
            let manager = self.executor.manager().clone();
            let id = id.clone();
            tokio::spawn(async move { manager.close(&id).await });
        }

        match request.command.connection_id().cloned() {
            Some(id) => self.enqueue(id, request),
            None => {
                let executor = self.executor.clone();
                let listeners = Arc::clone(&self.listeners);
                let frames = self.frames.clone();
                tokio::spawn(async move {
                    let reply = executor.execute(request.command, &listeners).await;
                    let _ = frames.send(Frame::Response {
                        request_id: request.request_id,
                        reply,
                    });
                });
            }
        }
    }

    fn enqueue(&mut self, id: ConnectionId, request: Request) {
        self.lanes.retain(|_, lane| !lane.is_closed());

        // A lane can retire between the check and the send; the request
        // comes back and goes to a fresh lane.
        let mut request = request;
        loop {
            let lane = match self.lanes.get(&id) {
                Some(lane) => lane.clone(),
                None => self.spawn_lane(&id),
            };
            match lane.send(request) {
                Ok(()) => return,
                Err(rejected) => {
                    self.lanes.remove(&id);
                    request = rejected.0;
                }
            }
        }
    }

    fn spawn_lane(&mut self, id: &ConnectionId) -> mpsc::UnboundedSender<Request> {
        let (lane, requests) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(
            requests,
            self.executor.clone(),
            Arc::clone(&self.listeners),
            self.frames.clone(),
            self.lane_idle,
        ));
        self.lanes.insert(id.clone(), lane.clone());
        lane
    }

    #[cfg(test)]
    fn lane_count(&mut self) -> usize {
        self.lanes.retain(|_, lane| !lane.is_closed());
        self.lanes.len()
    }
}

/// Run one client's commands for one connection id, strictly in order.
///
/// Exits after `idle` with nothing queued. Requests that raced the exit are
/// still served before the lane goes away.
async fn run_lane(
    mut requests: mpsc::UnboundedReceiver<Request>,
    executor: CommandExecutor,
    listeners: Arc<ListenerTable>,
    frames: mpsc::UnboundedSender<Frame>,
    idle: Duration,
) {
    loop {
        let request = match tokio::time::timeout(idle, requests.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(_) => {
                requests.close();
                match requests.recv().await {
                    Some(request) => request,
                    None => break,
                }
            }
        };

        let reply = executor.execute(request.command, &listeners).await;
        let response = Frame::Response {
            request_id: request.request_id,
            reply,
        };
        if frames.send(response).is_err() {
            break;
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut events: mpsc::UnboundedReceiver<BridgeEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER);

    loop {
        let frame = tokio::select! {
            Some(frame) = frames.recv() => frame,
            Some(event) = events.recv() => Frame::Event(event),
            else => break,
        };

        buf.clear();
        if let Err(e) = codec::encode_into(&frame, &mut buf) {
            warn!(error = %e, "failed to encode frame");
            continue;
        }
        if let Err(e) = writer.write_all(&buf).await {
            debug!(error = %e, "bridge write failed");
            break;
        }
    }
}

/// Serve one accepted client until it disconnects or the host shuts down
pub async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    client: u64,
    executor: CommandExecutor,
    shutdown: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let (frames, frames_rx) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let listeners = Arc::new(ListenerTable::new(
        executor.manager().router().clone(),
        events,
    ));
    let writer_task = tokio::spawn(write_loop(writer, frames_rx, events_rx));

    let mut session = ClientSession::new(client, executor, Arc::clone(&listeners), frames);
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];

    'read: loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(client, error = %e, "bridge read failed");
                    break;
                }
            },
        };

        decoder.extend(&buf[..n]);
        loop {
            match decoder.decode_next() {
                Ok(Some(frame)) => session.dispatch(frame).await,
                Ok(None) => break,
                Err(CodecError::Json(e)) => {
                    warn!(client, error = %e, "dropping undecodable frame");
                }
                Err(e) => {
                    warn!(client, error = %e, "protocol error, dropping client");
                    break 'read;
                }
            }
        }
    }

    drop(session);
    let disposed = listeners.clear();
    writer_task.abort();
    info!(client, peer = %peer, disposed, "bridge client disconnected");
}
