//! Snapshot + delta state per entity scope.
//!
//! One generic [`SyncEngine`] serves metadata, locks, presence and stream
//! topic graphs. Each kind only supplies how a delta changes its snapshot
//! ([`Entity::apply`]) and what its snapshot event looks like; ordering,
//! duplicate suppression, snapshot-before-delta after reconnect and stream
//! lifetime are enforced once, in the engine.

mod manager;
mod operations;

pub use manager::SyncEngine;
pub use operations::{LockEntity, PresenceEntity, StorageEntity, TopicEntity};
pub(crate) use operations::{graph_from_lists, graph_to_lists};

use crate::transport::SnapshotPayload;
use crate::types::Scope;
use serde::{Deserialize, Serialize};

/// Tag naming which engine a scope belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Storage,
    Lock,
    Presence,
    Topic,
}

/// A kind of synchronized entity.
pub trait Entity: Send + Sync + 'static {
    const KIND: EntityKind;

    type Snapshot: Clone + Default + Send + 'static;
    type Event: Clone + Send + 'static;

    /// Apply one pushed or locally confirmed event.
    ///
    /// Returns false when the event changes nothing (a duplicate, or a delta
    /// the snapshot already reflects). Such events are not emitted.
    fn apply(snapshot: &mut Self::Snapshot, event: &Self::Event) -> bool;

    /// The full-state event emitted when a snapshot is installed.
    fn snapshot_event(scope: &Scope, snapshot: &Self::Snapshot) -> Self::Event;

    fn from_payload(payload: SnapshotPayload) -> Option<Self::Snapshot>;
}
