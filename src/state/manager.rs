//! Generic snapshot holder for one entity kind.

use super::{Entity, EntityKind};
use crate::error::{Result, RtmError};
use crate::gateway::{self, DropReason, EventSender, EventStream, OverflowPolicy};
use crate::transport::SnapshotPayload;
use crate::types::Scope;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-scope state. Everything that touches the snapshot or the sink holds
/// the scope mutex, so application and emission order are the same.
struct ScopeState<K: Entity> {
    snapshot: K::Snapshot,
    sink: EventSender<K::Event>,
    stream: EventStream<K::Event>,
    /// No baseline yet: deltas are buffered until a snapshot is installed.
    awaiting_snapshot: bool,
    pending: Vec<K::Event>,
}

struct ScopeCell<K: Entity> {
    state: Mutex<ScopeState<K>>,
}

/// Snapshot + delta engine for one entity kind, keyed by scope.
pub struct SyncEngine<K: Entity> {
    scopes: RwLock<HashMap<Scope, Arc<ScopeCell<K>>>>,
    buffer_size: usize,
    policy: OverflowPolicy,
}

impl<K: Entity> SyncEngine<K> {
    pub fn new(buffer_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            buffer_size,
            policy,
        }
    }

    pub fn kind(&self) -> EntityKind {
        K::KIND
    }

    fn cell(&self, scope: &Scope) -> Option<Arc<ScopeCell<K>>> {
        self.scopes.read().get(scope).cloned()
    }

    /// Register a scope with no baseline yet.
    ///
    /// Attach before asking the server to subscribe, so nothing pushed in
    /// between is lost; it is replayed once [`install`](Self::install) runs.
    pub fn attach(&self, scope: &Scope) -> Result<EventStream<K::Event>> {
        let mut scopes = self.scopes.write();
        if scopes.contains_key(scope) {
            return Err(RtmError::AlreadySubscribed(format!("{:?} {}", K::KIND, scope)));
        }
        let (sink, stream) = gateway::channel(
            format!("{:?}/{}", K::KIND, scope),
            self.buffer_size,
            self.policy,
        );
        let cell = ScopeCell {
            state: Mutex::new(ScopeState {
                snapshot: K::Snapshot::default(),
                sink,
                stream: stream.clone(),
                awaiting_snapshot: true,
                pending: Vec::new(),
            }),
        };
        scopes.insert(scope.clone(), Arc::new(cell));
        debug!(kind = ?K::KIND, %scope, "Scope attached");
        Ok(stream)
    }

    /// Replace the snapshot, emit one snapshot event, then replay anything
    /// buffered while the scope was waiting.
    pub fn install(&self, scope: &Scope, snapshot: K::Snapshot) -> bool {
        let Some(cell) = self.cell(scope) else {
            return false;
        };
        let mut state = cell.state.lock();
        state.snapshot = snapshot;
        state.awaiting_snapshot = false;
        state.sink.send(K::snapshot_event(scope, &state.snapshot));

        let pending = std::mem::take(&mut state.pending);
        let buffered = pending.len();
        let mut replayed = 0;
        for event in pending {
            if K::apply(&mut state.snapshot, &event) {
                state.sink.send(event);
                replayed += 1;
            }
        }
        debug!(kind = ?K::KIND, %scope, buffered, replayed, "Snapshot installed");
        true
    }

    /// Apply one event in arrival order. Returns true if it was emitted.
    pub fn apply(&self, scope: &Scope, event: K::Event) -> bool {
        let Some(cell) = self.cell(scope) else {
            debug!(kind = ?K::KIND, %scope, "Event for unknown scope dropped");
            return false;
        };
        let mut state = cell.state.lock();
        if state.awaiting_snapshot {
            state.pending.push(event);
            return false;
        }
        if !K::apply(&mut state.snapshot, &event) {
            debug!(kind = ?K::KIND, %scope, "Duplicate event suppressed");
            return false;
        }
        state.sink.send(event);
        true
    }

    /// Remove a scope and close its stream. Detaching twice is a no-op.
    pub fn detach(&self, scope: &Scope, reason: DropReason) -> bool {
        let removed = self.scopes.write().remove(scope);
        match removed {
            Some(cell) => {
                let mut state = cell.state.lock();
                state.pending.clear();
                state.sink.close(reason);
                debug!(kind = ?K::KIND, %scope, ?reason, "Scope detached");
                true
            }
            None => false,
        }
    }

    pub fn detach_all(&self, reason: DropReason) {
        let scopes: Vec<Scope> = self.scopes.read().keys().cloned().collect();
        for scope in scopes {
            self.detach(&scope, reason);
        }
    }

    /// Point-in-time copy of the snapshot and the scope's stream.
    pub fn stream(&self, scope: &Scope) -> Result<(K::Snapshot, EventStream<K::Event>)> {
        let cell = self
            .cell(scope)
            .ok_or_else(|| RtmError::NotSubscribed(format!("{:?} {}", K::KIND, scope)))?;
        let state = cell.state.lock();
        Ok((state.snapshot.clone(), state.stream.clone()))
    }

    pub fn snapshot(&self, scope: &Scope) -> Option<K::Snapshot> {
        let cell = self.cell(scope)?;
        let snapshot = cell.state.lock().snapshot.clone();
        Some(snapshot)
    }

    /// Run `f` against a synced snapshot. `None` if the scope is unknown or
    /// still waiting for its baseline.
    pub fn inspect<R>(&self, scope: &Scope, f: impl FnOnce(&K::Snapshot) -> R) -> Option<R> {
        let cell = self.cell(scope)?;
        let state = cell.state.lock();
        if state.awaiting_snapshot {
            return None;
        }
        Some(f(&state.snapshot))
    }

    pub fn contains(&self, scope: &Scope) -> bool {
        self.scopes.read().contains_key(scope)
    }

    pub fn scopes(&self) -> Vec<Scope> {
        self.scopes.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.scopes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.read().is_empty()
    }

    /// Drop every baseline. Deltas are buffered until the next resync.
    pub fn mark_all_stale(&self) {
        let cells: Vec<Arc<ScopeCell<K>>> = self.scopes.read().values().cloned().collect();
        for cell in cells {
            cell.state.lock().awaiting_snapshot = true;
        }
    }

    /// Fetch and install a fresh snapshot for every scope waiting for one.
    ///
    /// A failed fetch leaves the scope waiting; the next resync retries it.
    pub fn resync<F>(&self, fetch: F) -> usize
    where
        F: Fn(&Scope, EntityKind) -> Result<SnapshotPayload>,
    {
        let waiting: Vec<Scope> = self
            .scopes
            .read()
            .iter()
            .filter(|(_, cell)| cell.state.lock().awaiting_snapshot)
            .map(|(scope, _)| scope.clone())
            .collect();

        let mut installed = 0;
        for scope in waiting {
            match fetch(&scope, K::KIND).map(K::from_payload) {
                Ok(Some(snapshot)) => {
                    if self.install(&scope, snapshot) {
                        installed += 1;
                    }
                }
                Ok(None) => {
                    warn!(kind = ?K::KIND, %scope, "Snapshot payload of wrong kind")
                }
                Err(e) => warn!(kind = ?K::KIND, %scope, error = %e, "Snapshot fetch failed"),
            }
        }
        if installed > 0 {
            info!(kind = ?K::KIND, installed, "Resynchronized scopes");
        }
        installed
    }
}
