//! Event demultiplexing
//!
//! Every live connection's events pass through one [`EventRouter`], which
//! tags them with their connection id and hands them to the listeners
//! registered for that id and event kind. A connection is *attached* to the
//! router under a generation number while it is live; events carrying a
//! stale generation, or arriving after [`EventRouter::finish`], are dropped.

use portmux_shared::{BridgeEvent, ConnectionId, EventKind, EventPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Where a listener's events go
pub type EventSink = mpsc::UnboundedSender<BridgeEvent>;

struct ListenerEntry {
    kind: EventKind,
    id: ConnectionId,
    sink: EventSink,
}

#[derive(Default)]
struct RouterState {
    next_listener: u64,
    listeners: HashMap<u64, ListenerEntry>,
    /// Live connections and the generation they were attached under
    attached: HashMap<ConnectionId, u64>,
}

impl RouterState {
    fn is_current(&self, id: &ConnectionId, generation: u64) -> bool {
        self.attached.get(id) == Some(&generation)
    }

    fn dispatch(&mut self, id: &ConnectionId, payload: EventPayload) {
        let kind = payload.kind();
        let mut dead = Vec::new();

        for (listener, entry) in &self.listeners {
            if entry.kind != kind || &entry.id != id {
                continue;
            }
            let event = BridgeEvent::new(id.clone(), payload.clone());
            if entry.sink.send(event).is_err() {
                dead.push(*listener);
            }
        }

        for listener in dead {
            debug!(listener, "pruning listener with a closed sink");
            self.listeners.remove(&listener);
        }
    }
}

/// Fan-out of connection events to per-id listeners.
///
/// Cloning is cheap; clones share the same listener table.
#[derive(Clone, Default)]
pub struct EventRouter {
    state: Arc<Mutex<RouterState>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `sink` for events of `kind` on connection `id`.
    ///
    /// The listener stays registered until the returned [`Disposer`] is
    /// disposed or dropped.
    pub fn register(&self, kind: EventKind, id: ConnectionId, sink: EventSink) -> Disposer {
        let mut state = self.lock();
        state.next_listener += 1;
        let listener = state.next_listener;
        state.listeners.insert(listener, ListenerEntry { kind, id, sink });

        Disposer {
            listener,
            router: Arc::downgrade(&self.state),
            armed: true,
        }
    }

    /// Register a listener with its own channel
    pub fn listen(&self, kind: EventKind, id: ConnectionId) -> Listener {
        let (sink, events) = mpsc::unbounded_channel();
        let disposer = self.register(kind, id, sink);
        Listener { events, disposer }
    }

    /// Start routing events for a newly opened connection
    pub fn attach(&self, id: ConnectionId, generation: u64) {
        self.lock().attached.insert(id, generation);
    }

    /// Route one event. Returns `false` once the connection lifecycle that
    /// `generation` belongs to is no longer attached.
    pub fn deliver(&self, id: &ConnectionId, generation: u64, payload: EventPayload) -> bool {
        let mut state = self.lock();
        if !state.is_current(id, generation) {
            debug!(id = %id, generation, event = %payload.kind(), "dropping event for detached connection");
            return false;
        }
        state.dispatch(id, payload);
        true
    }

    /// Deliver the final events of a lifecycle followed by `Closed`, then
    /// detach it. Nothing is routed for this lifecycle afterwards.
    pub fn finish(&self, id: &ConnectionId, generation: u64, final_events: Vec<EventPayload>) -> bool {
        let mut state = self.lock();
        if !state.is_current(id, generation) {
            return false;
        }
        for payload in final_events {
            state.dispatch(id, payload);
        }
        state.dispatch(id, EventPayload::Closed);
        state.attached.remove(id);
        true
    }

    pub fn is_attached(&self, id: &ConnectionId) -> bool {
        self.lock().attached.contains_key(id)
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

/// Unregisters exactly one listener, at the latest when dropped
pub struct Disposer {
    listener: u64,
    router: Weak<Mutex<RouterState>>,
    armed: bool,
}

impl Disposer {
    /// Token identifying the listener this disposer owns
    pub fn listener(&self) -> u64 {
        self.listener
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.armed) {
            return;
        }
        if let Some(state) = self.router.upgrade() {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .remove(&self.listener);
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.release();
    }
}

/// A registered listener together with the channel it receives on
pub struct Listener {
    events: mpsc::UnboundedReceiver<BridgeEvent>,
    disposer: Disposer,
}

impl Listener {
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BridgeEvent> {
        self.events.try_recv().ok()
    }

    pub fn listener(&self) -> u64 {
        self.disposer.listener()
    }

    /// Unregister; events already queued stay readable
    pub fn dispose(self) {
        self.disposer.dispose();
    }
}
