//! Listener registrations owned by one bridge client

use crate::connection::router::{Disposer, EventRouter, EventSink};
use portmux_shared::{ConnectionId, EventKind};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Listeners one client registered, keyed by the token it was given.
///
/// Dropping the table disposes every listener in it.
pub struct ListenerTable {
    router: EventRouter,
    sink: EventSink,
    disposers: Mutex<HashMap<u64, Disposer>>,
}

impl ListenerTable {
    /// Listeners registered through this table send into `sink`
    pub fn new(router: EventRouter, sink: EventSink) -> Self {
        Self {
            router,
            sink,
            disposers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Disposer>> {
        self.disposers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register for `kind` events on `id`, returning the listener token
    pub fn listen(&self, kind: EventKind, id: ConnectionId) -> u64 {
        let disposer = self.router.register(kind, id, self.sink.clone());
        let listener = disposer.listener();
        self.lock().insert(listener, disposer);
        listener
    }

    /// Dispose one listener; `false` if this table does not own it
    pub fn unlisten(&self, listener: u64) -> bool {
        let disposer = self.lock().remove(&listener);
        match disposer {
            Some(disposer) => {
                disposer.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every listener, returning how many there were
    pub fn clear(&self) -> usize {
        let disposers: Vec<Disposer> = self.lock().drain().map(|(_, d)| d).collect();
        let count = disposers.len();
        for disposer in disposers {
            disposer.dispose();
        }
        if count > 0 {
            debug!(count, "disposed client listeners");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
