//! Delta application per entity kind.

use super::{Entity, EntityKind};
use crate::transport::SnapshotPayload;
use crate::types::{
    LockDetail, LockEvent, LockEventKind, LockSnapshot, MetadataSnapshot, PresenceEvent, Scope,
    StorageEvent, StorageEventKind, TopicEvent, TopicGraph, UserState,
};
use std::collections::HashMap;
use tracing::debug;

/// Channel and user metadata maps.
pub struct StorageEntity;

impl Entity for StorageEntity {
    const KIND: EntityKind = EntityKind::Storage;

    type Snapshot = MetadataSnapshot;
    type Event = StorageEvent;

    fn apply(snapshot: &mut MetadataSnapshot, event: &StorageEvent) -> bool {
        match event.kind {
            StorageEventKind::Snapshot => {
                if event.major_revision < snapshot.major_revision {
                    return false;
                }
                snapshot.items = event.items.clone();
                snapshot.major_revision = event.major_revision;
                true
            }
            kind => {
                // Every accepted write bumps the major revision by one.
                // Anything at or below ours is already in the map; anything
                // further ahead waits for the deltas in between.
                if event.major_revision != snapshot.major_revision + 1 {
                    if event.major_revision > snapshot.major_revision + 1 {
                        debug!(
                            current = snapshot.major_revision,
                            incoming = event.major_revision,
                            "Metadata delta ahead of snapshot ignored"
                        );
                    }
                    return false;
                }
                if kind == StorageEventKind::Remove {
                    for key in event.items.keys() {
                        snapshot.items.remove(key);
                    }
                } else {
                    for (key, item) in &event.items {
                        snapshot.items.insert(key.clone(), item.clone());
                    }
                }
                snapshot.major_revision = event.major_revision;
                true
            }
        }
    }

    fn snapshot_event(_scope: &Scope, snapshot: &MetadataSnapshot) -> StorageEvent {
        StorageEvent {
            kind: StorageEventKind::Snapshot,
            major_revision: snapshot.major_revision,
            items: snapshot.items.clone(),
        }
    }

    fn from_payload(payload: SnapshotPayload) -> Option<MetadataSnapshot> {
        match payload {
            SnapshotPayload::Metadata(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Lock definitions and owners in one channel.
pub struct LockEntity;

impl Entity for LockEntity {
    const KIND: EntityKind = EntityKind::Lock;

    type Snapshot = LockSnapshot;
    type Event = LockEvent;

    fn apply(snapshot: &mut LockSnapshot, event: &LockEvent) -> bool {
        if event.kind == LockEventKind::Snapshot {
            if event.revision < snapshot.revision {
                return false;
            }
            snapshot.locks = event
                .details
                .iter()
                .map(|d| (d.name.clone(), d.clone()))
                .collect();
            snapshot.revision = event.revision;
            return true;
        }

        // Same gate as metadata: a reply to our own request and its echo
        // carry the same revision, and only the first one lands.
        if event.revision != snapshot.revision + 1 {
            if event.revision > snapshot.revision + 1 {
                debug!(
                    current = snapshot.revision,
                    incoming = event.revision,
                    "Lock delta ahead of snapshot ignored"
                );
            }
            return false;
        }
        let locks = &mut snapshot.locks;
        match event.kind {
            LockEventKind::Snapshot => {}
            LockEventKind::Set => {
                for detail in &event.details {
                    locks.insert(detail.name.clone(), detail.clone());
                }
            }
            LockEventKind::Removed => {
                for detail in &event.details {
                    locks.remove(&detail.name);
                }
            }
            LockEventKind::Acquired => {
                for detail in &event.details {
                    let entry = locks
                        .entry(detail.name.clone())
                        .or_insert_with(|| LockDetail {
                            name: detail.name.clone(),
                            owner: String::new(),
                            ttl: detail.ttl,
                        });
                    entry.owner = detail.owner.clone();
                }
            }
            LockEventKind::Released | LockEventKind::Expired => {
                for detail in &event.details {
                    if let Some(entry) = locks.get_mut(&detail.name) {
                        entry.owner.clear();
                    }
                }
            }
        }
        snapshot.revision = event.revision;
        true
    }

    fn snapshot_event(_scope: &Scope, snapshot: &LockSnapshot) -> LockEvent {
        let mut details: Vec<LockDetail> = snapshot.locks.values().cloned().collect();
        details.sort_by(|a, b| a.name.cmp(&b.name));
        LockEvent {
            kind: LockEventKind::Snapshot,
            revision: snapshot.revision,
            details,
        }
    }

    fn from_payload(payload: SnapshotPayload) -> Option<LockSnapshot> {
        match payload {
            SnapshotPayload::Locks(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Users present in one channel and their states.
pub struct PresenceEntity;

fn upsert_user(
    users: &mut HashMap<String, UserState>,
    user_id: &str,
    state: &HashMap<String, String>,
) -> bool {
    match users.get_mut(user_id) {
        Some(existing) if &existing.state == state => false,
        Some(existing) => {
            existing.state = state.clone();
            true
        }
        None => {
            users.insert(
                user_id.to_string(),
                UserState {
                    user_id: user_id.to_string(),
                    state: state.clone(),
                },
            );
            true
        }
    }
}

impl Entity for PresenceEntity {
    const KIND: EntityKind = EntityKind::Presence;

    type Snapshot = HashMap<String, UserState>;
    type Event = PresenceEvent;

    fn apply(users: &mut HashMap<String, UserState>, event: &PresenceEvent) -> bool {
        match event {
            PresenceEvent::Snapshot { states } => {
                *users = states
                    .iter()
                    .map(|(user_id, state)| {
                        (
                            user_id.clone(),
                            UserState {
                                user_id: user_id.clone(),
                                state: state.clone(),
                            },
                        )
                    })
                    .collect();
                true
            }
            PresenceEvent::Interval {
                joined,
                left,
                timeout,
                states,
            } => {
                let mut changed = false;
                let empty = HashMap::new();
                for user_id in joined {
                    let state = states.get(user_id).unwrap_or(&empty);
                    changed |= upsert_user(users, user_id, state);
                }
                for user_id in left.iter().chain(timeout) {
                    changed |= users.remove(user_id).is_some();
                }
                for (user_id, state) in states {
                    if !joined.contains(user_id) {
                        changed |= upsert_user(users, user_id, state);
                    }
                }
                changed
            }
            PresenceEvent::Join { user_id, state }
            | PresenceEvent::StateChanged { user_id, state } => upsert_user(users, user_id, state),
            PresenceEvent::Leave { user_id } | PresenceEvent::Timeout { user_id } => {
                users.remove(user_id).is_some()
            }
            PresenceEvent::OutOfService => true,
        }
    }

    fn snapshot_event(_scope: &Scope, users: &HashMap<String, UserState>) -> PresenceEvent {
        PresenceEvent::Snapshot {
            states: users
                .values()
                .map(|u| (u.user_id.clone(), u.state.clone()))
                .collect(),
        }
    }

    fn from_payload(payload: SnapshotPayload) -> Option<HashMap<String, UserState>> {
        match payload {
            SnapshotPayload::Presence(users) => Some(users),
            _ => None,
        }
    }
}

/// Topic membership of one stream channel.
pub struct TopicEntity;

pub(crate) fn graph_from_lists(topics: HashMap<String, Vec<String>>) -> TopicGraph {
    topics
        .into_iter()
        .map(|(topic, users)| (topic, users.into_iter().collect()))
        .collect()
}

pub(crate) fn graph_to_lists(graph: &TopicGraph) -> HashMap<String, Vec<String>> {
    graph
        .iter()
        .map(|(topic, users)| (topic.clone(), users.iter().cloned().collect()))
        .collect()
}

impl Entity for TopicEntity {
    const KIND: EntityKind = EntityKind::Topic;

    type Snapshot = TopicGraph;
    type Event = TopicEvent;

    fn apply(graph: &mut TopicGraph, event: &TopicEvent) -> bool {
        match event {
            TopicEvent::Snapshot { topics, .. } => {
                *graph = graph_from_lists(topics.clone());
                true
            }
            TopicEvent::Join { topic, user_id, .. } => graph
                .entry(topic.clone())
                .or_default()
                .insert(user_id.clone()),
            TopicEvent::Leave { topic, user_id, .. } => {
                let Some(users) = graph.get_mut(topic) else {
                    return false;
                };
                let removed = users.remove(user_id);
                if users.is_empty() {
                    graph.remove(topic);
                }
                removed
            }
        }
    }

    fn snapshot_event(scope: &Scope, graph: &TopicGraph) -> TopicEvent {
        let channel = match scope {
            Scope::Channel(key) => key.name.clone(),
            Scope::User(user) => user.clone(),
        };
        TopicEvent::Snapshot {
            channel,
            topics: graph_to_lists(graph),
        }
    }

    fn from_payload(payload: SnapshotPayload) -> Option<TopicGraph> {
        match payload {
            SnapshotPayload::Topics(topics) => Some(graph_from_lists(topics)),
            _ => None,
        }
    }
}
