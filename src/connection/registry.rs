//! Connection registry: id → lifecycle state and transport handle
//!
//! All mutations happen under one `std::sync::Mutex` that is never held
//! across an `.await`, so check-then-insert on an id is atomic. Closed and
//! failed connections leave a small tombstone (state only, no handle) so
//! that commands against them report `NotOpen` rather than `NotFound`.

use crate::connection::router::EventRouter;
use crate::error::{ConnectionError, ConnectionResult};
use crate::transport::TransportHandle;
use portmux_shared::{
    ConnectionId, ConnectionState, ConnectionSummary, EventPayload, TransportKind,
};
use portmux_shared::state_machine::TransitionResult;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Terminal entries kept around before the oldest is forgotten
const TOMBSTONE_LIMIT: usize = 256;

struct Entry {
    kind: TransportKind,
    state: ConnectionState,
    generation: u64,
    handle: Option<Arc<TransportHandle>>,
    /// Cancelled when the entry is closed while still opening
    abort: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ConnectionId, Entry>,
    next_generation: u64,
}

impl RegistryState {
    fn prune_tombstones(&mut self) {
        let terminal = self
            .entries
            .values()
            .filter(|entry| entry.state.is_terminal())
            .count();
        if terminal <= TOMBSTONE_LIMIT {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_terminal())
            .min_by_key(|(_, entry)| entry.generation)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.entries.remove(&id);
        }
    }
}

/// What `begin_close` found
pub enum CloseStep {
    /// Unknown, already closing or already terminal
    Idle,
    /// The id was still opening; its pending open has been aborted
    Aborted,
    /// The connection moved to Closing; the caller must release `handle`
    Release {
        generation: u64,
        handle: Arc<TransportHandle>,
    },
}

/// Outcome of retiring a live entry
pub struct Retired {
    pub state: ConnectionState,
    pub handle: Option<Arc<TransportHandle>>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `id` in state Opening.
    ///
    /// Fails with `DuplicateId` while a live entry holds the id. The
    /// reservation removes itself again unless it is committed.
    pub fn create(
        self: &Arc<Self>,
        id: &ConnectionId,
        kind: TransportKind,
    ) -> ConnectionResult<Reservation> {
        let mut state = self.lock();
        if let Some(existing) = state.entries.get(id) {
            if existing.state.is_live() {
                return Err(ConnectionError::DuplicateId(id.clone()));
            }
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let abort = CancellationToken::new();
        state.entries.insert(
            id.clone(),
            Entry {
                kind,
                state: ConnectionState::Opening,
                generation,
                handle: None,
                abort: abort.clone(),
            },
        );

        Ok(Reservation {
            registry: Arc::clone(self),
            id: id.clone(),
            generation,
            abort,
            committed: false,
        })
    }

    /// Handle of an open connection of the expected kind
    pub fn get(
        &self,
        id: &ConnectionId,
        expected: TransportKind,
    ) -> ConnectionResult<(u64, Arc<TransportHandle>)> {
        let state = self.lock();
        let entry = state
            .entries
            .get(id)
            .ok_or_else(|| ConnectionError::NotFound(id.clone()))?;

        if entry.kind != expected {
            return Err(ConnectionError::WrongTransport {
                id: id.clone(),
                expected,
                actual: entry.kind,
            });
        }

        match (&entry.handle, entry.state) {
            (Some(handle), ConnectionState::Open) => Ok((entry.generation, Arc::clone(handle))),
            (_, state) => Err(ConnectionError::NotOpen {
                id: id.clone(),
                state,
            }),
        }
    }

    /// Start closing `id`
    pub fn begin_close(&self, id: &ConnectionId) -> CloseStep {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(id) else {
            return CloseStep::Idle;
        };

        match entry.state {
            ConnectionState::Opening => {
                entry.abort.cancel();
                state.entries.remove(id);
                CloseStep::Aborted
            }
            ConnectionState::Open => {
                let Some(handle) = entry.handle.clone() else {
                    return CloseStep::Idle;
                };
                entry.state = ConnectionState::Closing;
                CloseStep::Release {
                    generation: entry.generation,
                    handle,
                }
            }
            _ => CloseStep::Idle,
        }
    }

    /// Retire the live lifecycle `generation` of `id`.
    ///
    /// `decide` sees the current state and returns the terminal state plus
    /// the events to emit before `Closed`, or `None` to leave the entry
    /// alone. The router is finished under the registry lock, so no event of
    /// this lifecycle can be routed once the entry is terminal. Returns
    /// `None` when there was nothing to retire.
    pub fn remove<F>(
        &self,
        id: &ConnectionId,
        generation: u64,
        router: &EventRouter,
        decide: F,
    ) -> Option<Retired>
    where
        F: FnOnce(ConnectionState) -> Option<(ConnectionState, Vec<EventPayload>)>,
    {
        let mut state = self.lock();
        let entry = state.entries.get_mut(id)?;
        if entry.generation != generation || entry.state.is_terminal() {
            return None;
        }

        let (terminal, final_events) = decide(entry.state)?;
        if let TransitionResult::Invalid { from, to } = entry.state.transition(terminal) {
            warn!(id = %id, %from, %to, "refusing invalid state transition");
            return None;
        }

        let handle = entry.handle.take();
        router.finish(id, generation, final_events);
        state.prune_tombstones();
        debug!(id = %id, state = %terminal, "connection retired");

        Some(Retired {
            state: terminal,
            handle,
        })
    }

    /// Current state, including terminal tombstones
    pub fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.lock().entries.get(id).map(|entry| entry.state)
    }

    /// Live connections sorted by id
    pub fn snapshot(&self) -> Vec<ConnectionSummary> {
        let state = self.lock();
        let mut summaries: Vec<ConnectionSummary> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_live())
            .map(|(id, entry)| ConnectionSummary {
                id: id.clone(),
                kind: entry.kind,
                state: entry.state,
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn live_ids(&self) -> Vec<ConnectionId> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_live())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of entries holding a transport handle
    pub fn handle_count(&self) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|entry| entry.handle.is_some())
            .count()
    }
}

/// A provisional Opening entry.
///
/// Dropped without [`commit`](Reservation::commit), it removes its entry,
/// so a failed or abandoned open never leaves anything behind.
pub struct Reservation {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    generation: u64,
    abort: CancellationToken,
    committed: bool,
}

impl Reservation {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancelled when the id is closed before the open completes
    pub fn aborted(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Move the entry to Open and start routing its events.
    ///
    /// Hands the handle back if the entry was closed in the meantime.
    pub fn commit(
        mut self,
        handle: TransportHandle,
        router: &EventRouter,
    ) -> Result<Arc<TransportHandle>, TransportHandle> {
        let registry = Arc::clone(&self.registry);
        let mut state = registry.lock();
        let entry = match state.entries.get_mut(&self.id) {
            Some(entry)
                if entry.generation == self.generation
                    && entry.state == ConnectionState::Opening =>
            {
                entry
            }
            _ => return Err(handle),
        };

        entry.state = ConnectionState::Open;
        let handle = Arc::new(handle);
        entry.handle = Some(Arc::clone(&handle));
        router.attach(self.id.clone(), self.generation);
        self.committed = true;
        Ok(handle)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.registry.lock();
        let provisional = state.entries.get(&self.id).is_some_and(|entry| {
            entry.generation == self.generation && entry.state == ConnectionState::Opening
        });
        if provisional {
            state.entries.remove(&self.id);
        }
    }
}
