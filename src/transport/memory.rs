//! In-process transport backed by a shared [`MemoryServer`].
//!
//! The server holds the authoritative state clients sync against: metadata
//! maps and their revisions, lock ownership, presence and topic membership.
//! Any number of [`MemoryTransport`]s attach to one server, one session
//! each. Nothing happens on a clock: lock expiry is driven explicitly with
//! [`MemoryServer::expire_lock`], connection trouble with
//! [`MemoryTransport::interrupt`] and [`MemoryTransport::restore`].

use super::{
    Credentials, InitialSnapshots, MetadataOp, RawStateChange, Request, Response, ServerError,
    ServerErrorKind, ServerEvent, SnapshotPayload, Transport,
};
use crate::state::EntityKind;
use crate::subscriptions::Concerns;
use crate::types::{
    ChannelInfo, ChannelKey, ChannelType, ConnectionChangeReason, ConnectionState, LockDetail,
    LockEvent, LockEventKind, LockSnapshot, Message, MessageType, MetadataItem, MetadataSnapshot,
    PresenceEvent, Scope, StorageEvent, StorageEventKind, SubscribedUsers, Timestamp,
    TopicEvent, UserState,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Users per who-now page unless configured otherwise.
const DEFAULT_PAGE_SIZE: usize = 100;

const PAGE_PREFIX: &str = "offset:";

/// (stream channel name, topic)
type TopicKey = (String, String);

struct Session {
    user_id: String,
    logged_in: bool,
    online: bool,
    events: Sender<ServerEvent>,
    states: Option<Sender<RawStateChange>>,
    channels: HashMap<ChannelKey, Concerns>,
    user_metadata: HashSet<String>,
    lock_watches: HashMap<ChannelKey, HashSet<String>>,
    topics: HashSet<TopicKey>,
    topic_subscriptions: HashMap<TopicKey, SubscribedUsers>,
}

impl Session {
    fn reachable(&self) -> bool {
        self.logged_in && self.online
    }

    fn concerns(&self, key: &ChannelKey) -> Option<Concerns> {
        self.channels.get(key).copied()
    }

    fn push_state(&self, state: ConnectionState, reason: ConnectionChangeReason) {
        if let Some(states) = &self.states {
            let _ = states.send(RawStateChange {
                state: state.code(),
                reason: reason.code(),
            });
        }
    }
}

fn broadcast(
    sessions: &HashMap<u64, Session>,
    event: &ServerEvent,
    wants: impl Fn(&Session) -> bool,
) -> usize {
    let mut delivered = 0;
    for session in sessions.values() {
        if session.reachable() && wants(session) && session.events.send(event.clone()).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

fn error(kind: ServerErrorKind, message: impl Into<String>) -> ServerError {
    ServerError::new(kind, message)
}

struct ServerState {
    sessions: HashMap<u64, Session>,
    next_session: u64,
    page_size: usize,
    /// Pushed to every session joining a stream channel, before the reply.
    join_notice: Option<String>,
    metadata: HashMap<Scope, MetadataSnapshot>,
    locks: HashMap<ChannelKey, HashMap<String, LockDetail>>,
    lock_revisions: HashMap<ChannelKey, i64>,
    /// channel -> user -> state
    presence: HashMap<ChannelKey, BTreeMap<String, HashMap<String, String>>>,
    /// stream channel -> topic -> joined publishers
    topics: HashMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_session: 0,
            page_size: DEFAULT_PAGE_SIZE,
            join_notice: None,
            metadata: HashMap::new(),
            locks: HashMap::new(),
            lock_revisions: HashMap::new(),
            presence: HashMap::new(),
            topics: HashMap::new(),
        }
    }

    fn session(&self, id: u64) -> Result<&Session, ServerError> {
        match self.sessions.get(&id) {
            Some(session) if session.reachable() => Ok(session),
            _ => Err(error(ServerErrorKind::Disconnected, "session offline")),
        }
    }

    fn session_mut(&mut self, id: u64) -> Result<&mut Session, ServerError> {
        match self.sessions.get_mut(&id) {
            Some(session) if session.reachable() => Ok(session),
            _ => Err(error(ServerErrorKind::Disconnected, "session offline")),
        }
    }

    fn user(&self, id: u64) -> Result<String, ServerError> {
        self.session(id).map(|s| s.user_id.clone())
    }

    fn handle(&mut self, id: u64, request: Request) -> Result<Response, ServerError> {
        let user = self.user(id)?;
        trace!(session = id, user = %user, ?request, "Request");
        match request {
            Request::Logout => {
                self.logout(id);
                Ok(Response::Ok)
            }
            Request::RenewToken { .. } | Request::SetParameters { .. } => Ok(Response::Ok),

            Request::Publish {
                channel,
                payload,
                message_type,
                custom_type,
            } => {
                let key = ChannelKey::message(channel.clone());
                let event = ServerEvent::Message {
                    channel,
                    message: Message {
                        user_id: user,
                        message_type,
                        payload,
                        custom_type,
                    },
                };
                broadcast(&self.sessions, &event, |s| {
                    s.concerns(&key).is_some_and(|c| c.message)
                });
                Ok(Response::Ok)
            }
            Request::Subscribe {
                channel,
                concerns,
                state,
            } => {
                let key = ChannelKey::message(channel);
                let snapshots = self.enter_channel(id, key, concerns, state)?;
                Ok(Response::Subscribed { snapshots })
            }
            Request::Unsubscribe { channel } => {
                if self.leave_channel(id, &ChannelKey::message(channel.clone())) {
                    Ok(Response::Ok)
                } else {
                    Err(error(ServerErrorKind::NotSubscribed, channel))
                }
            }

            Request::JoinStream {
                channel,
                concerns,
                state,
                ..
            } => {
                let key = ChannelKey::stream(channel.clone());
                let snapshots = self.enter_channel(id, key, concerns, state)?;
                let session = self.sessions.get(&id);
                if let (Some(notice), Some(session)) = (&self.join_notice, session) {
                    let _ = session.events.send(ServerEvent::Notice {
                        channel,
                        notice: notice.clone(),
                    });
                }
                Ok(Response::Subscribed { snapshots })
            }
            Request::LeaveStream { channel } => {
                if self.leave_channel(id, &ChannelKey::stream(channel.clone())) {
                    Ok(Response::Ok)
                } else {
                    Err(error(ServerErrorKind::NotJoined, channel))
                }
            }
            Request::RenewStreamToken { channel, .. } => {
                self.require_joined(id, &channel)?;
                Ok(Response::Ok)
            }
            Request::JoinTopic { channel, topic, .. } => {
                self.join_topic(id, &user, channel, topic)?;
                Ok(Response::Ok)
            }
            Request::LeaveTopic { channel, topic } => {
                self.require_joined(id, &channel)?;
                let key = (channel.clone(), topic.clone());
                if !self.session_mut(id)?.topics.remove(&key) {
                    let topic = format!("{}/{}", channel, topic);
                    return Err(error(ServerErrorKind::NotJoined, topic));
                }
                self.drop_publisher(&channel, &topic, &user);
                Ok(Response::Ok)
            }
            Request::PublishTopic {
                channel,
                topic,
                payload,
                message_type,
                custom_type,
                ..
            } => {
                self.publish_topic(id, user, channel, topic, payload, message_type, custom_type)?;
                Ok(Response::Ok)
            }
            Request::SubscribeTopic {
                channel,
                topic,
                users,
            } => {
                self.require_joined(id, &channel)?;
                let session = self.session_mut(id)?;
                let entry = session
                    .topic_subscriptions
                    .entry((channel, topic))
                    .or_insert_with(|| SubscribedUsers::Users(BTreeSet::new()));
                match (entry, users) {
                    (entry, SubscribedUsers::All) => *entry = SubscribedUsers::All,
                    (SubscribedUsers::Users(current), SubscribedUsers::Users(added)) => {
                        current.extend(added)
                    }
                    (SubscribedUsers::All, SubscribedUsers::Users(_)) => {}
                }
                Ok(Response::Ok)
            }
            Request::UnsubscribeTopic {
                channel,
                topic,
                users,
            } => {
                self.require_joined(id, &channel)?;
                let session = self.session_mut(id)?;
                let key = (channel, topic);
                if users.is_empty() {
                    session.topic_subscriptions.remove(&key);
                } else if let Some(SubscribedUsers::Users(current)) =
                    session.topic_subscriptions.get_mut(&key)
                {
                    for user_id in &users {
                        current.remove(user_id);
                    }
                    if current.is_empty() {
                        session.topic_subscriptions.remove(&key);
                    }
                }
                Ok(Response::Ok)
            }

            Request::FetchSnapshot { scope, kind } => {
                let payload = self.snapshot(&scope, kind)?;
                Ok(Response::Snapshot { payload })
            }

            Request::WriteMetadata {
                scope,
                op,
                items,
                major_rev,
                lock,
                record_ts,
                record_author,
            } => {
                let event = self.write_metadata(
                    &user,
                    &scope,
                    op,
                    items,
                    major_rev,
                    lock,
                    record_ts,
                    record_author,
                )?;
                Ok(Response::MetadataWritten { event })
            }
            Request::GetMetadata { scope } => Ok(Response::Metadata {
                snapshot: self.metadata.get(&scope).cloned().unwrap_or_default(),
            }),
            Request::SubscribeUserMetadata { user_id } => {
                self.session_mut(id)?.user_metadata.insert(user_id);
                Ok(Response::Ok)
            }
            Request::UnsubscribeUserMetadata { user_id } => {
                if self.session_mut(id)?.user_metadata.remove(&user_id) {
                    Ok(Response::Ok)
                } else {
                    Err(error(ServerErrorKind::NotSubscribed, user_id))
                }
            }

            Request::SetLock { channel, name, ttl } => {
                let locks = self.locks.entry(channel.clone()).or_default();
                let detail = locks.entry(name.clone()).or_insert_with(|| LockDetail {
                    name,
                    owner: String::new(),
                    ttl,
                });
                detail.ttl = ttl;
                let event = LockEvent {
                    kind: LockEventKind::Set,
                    revision: 0,
                    details: vec![detail.clone()],
                };
                Ok(self.lock_changed(&channel, event))
            }
            Request::GetLocks { channel } => Ok(Response::Locks {
                locks: self.locks.get(&channel).cloned().unwrap_or_default(),
            }),
            Request::RemoveLock { channel, name } => {
                let detail = self
                    .locks
                    .get_mut(&channel)
                    .and_then(|locks| locks.remove(&name))
                    .ok_or_else(|| error(ServerErrorKind::NotFound, name))?;
                let event = LockEvent {
                    kind: LockEventKind::Removed,
                    revision: 0,
                    details: vec![detail],
                };
                Ok(self.lock_changed(&channel, event))
            }
            Request::AcquireLock { channel, name } => {
                let detail = self.lock_mut(&channel, &name)?;
                if detail.is_held() && detail.owner != user {
                    let owner = detail.owner.clone();
                    return Err(error(ServerErrorKind::LockHeldByOther { owner }, name));
                }
                detail.owner = user;
                let event = LockEvent {
                    kind: LockEventKind::Acquired,
                    revision: 0,
                    details: vec![detail.clone()],
                };
                Ok(self.lock_changed(&channel, event))
            }
            Request::ReleaseLock { channel, name } => {
                let detail = self.lock_mut(&channel, &name)?;
                if detail.owner != user {
                    return Err(error(ServerErrorKind::LockNotHeld, name));
                }
                let released = detail.clone();
                detail.owner.clear();
                let event = LockEvent {
                    kind: LockEventKind::Released,
                    revision: 0,
                    details: vec![released],
                };
                Ok(self.lock_changed(&channel, event))
            }
            Request::RevokeLock {
                channel,
                name,
                owner,
            } => {
                let detail = self.lock_mut(&channel, &name)?;
                if !detail.is_held() || detail.owner != owner {
                    let kind = ServerErrorKind::OwnerMismatch {
                        expected: owner,
                        actual: detail.owner.clone(),
                    };
                    return Err(error(kind, name));
                }
                let released = detail.clone();
                detail.owner.clear();
                let event = LockEvent {
                    kind: LockEventKind::Released,
                    revision: 0,
                    details: vec![released],
                };
                Ok(self.lock_changed(&channel, event))
            }
            Request::WatchLock { channel, name } => {
                self.session_mut(id)?
                    .lock_watches
                    .entry(channel)
                    .or_default()
                    .insert(name);
                Ok(Response::Ok)
            }
            Request::UnwatchLock { channel, name } => {
                let session = self.session_mut(id)?;
                if let Some(watches) = session.lock_watches.get_mut(&channel) {
                    watches.remove(&name);
                    if watches.is_empty() {
                        session.lock_watches.remove(&channel);
                    }
                }
                Ok(Response::Ok)
            }

            Request::WhoNow {
                channel,
                include_user_id,
                include_state,
                page,
            } => self.who_now(&channel, include_user_id, include_state, page),
            Request::WhereNow { user_id } => {
                let mut channels: Vec<ChannelInfo> = self
                    .presence
                    .iter()
                    .filter(|(_, users)| users.contains_key(&user_id))
                    .map(|(key, _)| ChannelInfo {
                        channel: key.name.clone(),
                        channel_type: key.channel_type,
                    })
                    .collect();
                channels.sort_by(|a, b| {
                    (a.channel_type, &a.channel).cmp(&(b.channel_type, &b.channel))
                });
                Ok(Response::Channels { channels })
            }
            Request::SetState { channel, state } => {
                let current = self.present_state(&channel, &user)?;
                current.extend(state);
                let state = current.clone();
                let event = PresenceEvent::StateChanged {
                    user_id: user,
                    state,
                };
                self.presence_changed(&channel, event);
                Ok(Response::Ok)
            }
            Request::RemoveState { channel, keys } => {
                let current = self.present_state(&channel, &user)?;
                if keys.is_empty() {
                    current.clear();
                } else {
                    for key in &keys {
                        current.remove(key);
                    }
                }
                let state = current.clone();
                let event = PresenceEvent::StateChanged {
                    user_id: user,
                    state,
                };
                self.presence_changed(&channel, event);
                Ok(Response::Ok)
            }
            Request::GetState { channel, user_id } => {
                let state = self
                    .presence
                    .get(&channel)
                    .and_then(|users| users.get(&user_id))
                    .cloned()
                    .ok_or_else(|| error(ServerErrorKind::NotFound, user_id))?;
                Ok(Response::State { state })
            }
        }
    }

    // --- Channels ---

    fn enter_channel(
        &mut self,
        id: u64,
        key: ChannelKey,
        concerns: Concerns,
        state: HashMap<String, String>,
    ) -> Result<InitialSnapshots, ServerError> {
        let user = self.user(id)?;
        self.session_mut(id)?.channels.insert(key.clone(), concerns);
        self.presence
            .entry(key.clone())
            .or_default()
            .insert(user.clone(), state.clone());
        self.presence_changed(
            &key,
            PresenceEvent::Join {
                user_id: user.clone(),
                state,
            },
        );

        let scope = Scope::Channel(key.clone());
        let mut snapshots = InitialSnapshots::default();
        if concerns.metadata {
            snapshots.metadata = Some(self.metadata.get(&scope).cloned().unwrap_or_default());
        }
        if concerns.lock {
            snapshots.locks = Some(self.lock_snapshot(&key));
        }
        if concerns.presence {
            snapshots.presence = Some(self.presence_snapshot(&key));
        }
        if key.channel_type == ChannelType::Stream {
            snapshots.topics = Some(self.topic_snapshot(&key.name));
        }
        debug!(channel = %key, %user, %concerns, "Session entered channel");
        Ok(snapshots)
    }

    /// Drop the session from a channel. Returns false if it was not in it.
    fn leave_channel(&mut self, id: u64, key: &ChannelKey) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.channels.remove(key).is_none() {
            return false;
        }
        session.lock_watches.remove(key);
        let user = session.user_id.clone();

        let mut left_topics = Vec::new();
        if key.channel_type == ChannelType::Stream {
            session.topic_subscriptions.retain(|(channel, _), _| channel != &key.name);
            session.topics.retain(|(channel, topic)| {
                if channel == &key.name {
                    left_topics.push(topic.clone());
                    false
                } else {
                    true
                }
            });
        }
        for topic in left_topics {
            self.drop_publisher(&key.name, &topic, &user);
        }

        let was_present = self
            .presence
            .get_mut(key)
            .is_some_and(|users| users.remove(&user).is_some());
        if self.presence.get(key).is_some_and(|users| users.is_empty()) {
            self.presence.remove(key);
        }
        if was_present {
            self.presence_changed(key, PresenceEvent::Leave { user_id: user });
        }
        debug!(channel = %key, session = id, "Session left channel");
        true
    }

    fn require_joined(&self, id: u64, channel: &str) -> Result<(), ServerError> {
        let key = ChannelKey::stream(channel);
        if self.session(id)?.channels.contains_key(&key) {
            Ok(())
        } else {
            Err(error(ServerErrorKind::NotJoined, channel))
        }
    }

    fn logout(&mut self, id: u64) {
        let keys: Vec<ChannelKey> = self
            .sessions
            .get(&id)
            .map(|s| s.channels.keys().cloned().collect())
            .unwrap_or_default();
        for key in &keys {
            self.leave_channel(id, key);
        }
        let Some(user) = self.sessions.get(&id).map(|s| s.user_id.clone()) else {
            return;
        };

        // The lock TTL runs out with nobody to renew it.
        let held: Vec<(ChannelKey, String)> = self
            .locks
            .iter()
            .flat_map(|(key, locks)| {
                locks
                    .values()
                    .filter(|d| d.owner == user)
                    .map(move |d| (key.clone(), d.name.clone()))
            })
            .collect();

        if let Some(session) = self.sessions.get_mut(&id) {
            session.logged_in = false;
            session.states = None;
            session.user_metadata.clear();
            session.lock_watches.clear();
            session.topics.clear();
            session.topic_subscriptions.clear();
        }
        for (key, name) in held {
            self.expire(&key, &name);
        }
        debug!(session = id, %user, "Session logged out");
    }

    // --- Topics ---

    fn topic_snapshot(&self, channel: &str) -> HashMap<String, Vec<String>> {
        self.topics
            .get(channel)
            .map(|topics| {
                topics
                    .iter()
                    .map(|(topic, users)| (topic.clone(), users.iter().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn join_topic(
        &mut self,
        id: u64,
        user: &str,
        channel: String,
        topic: String,
    ) -> Result<(), ServerError> {
        self.require_joined(id, &channel)?;
        if !self
            .session_mut(id)?
            .topics
            .insert((channel.clone(), topic.clone()))
        {
            return Ok(());
        }
        self.topics
            .entry(channel.clone())
            .or_default()
            .entry(topic.clone())
            .or_default()
            .insert(user.to_string());
        let key = ChannelKey::stream(channel.clone());
        let event = ServerEvent::Topic {
            channel: channel.clone(),
            event: TopicEvent::Join {
                channel,
                topic,
                user_id: user.to_string(),
            },
        };
        broadcast(&self.sessions, &event, |s| s.channels.contains_key(&key));
        Ok(())
    }

    fn drop_publisher(&mut self, channel: &str, topic: &str, user: &str) {
        let Some(topics) = self.topics.get_mut(channel) else {
            return;
        };
        let removed = topics.get_mut(topic).is_some_and(|users| users.remove(user));
        if topics.get(topic).is_some_and(|users| users.is_empty()) {
            topics.remove(topic);
        }
        if topics.is_empty() {
            self.topics.remove(channel);
        }
        if !removed {
            return;
        }
        let key = ChannelKey::stream(channel);
        let event = ServerEvent::Topic {
            channel: channel.to_string(),
            event: TopicEvent::Leave {
                channel: channel.to_string(),
                topic: topic.to_string(),
                user_id: user.to_string(),
            },
        };
        broadcast(&self.sessions, &event, |s| s.channels.contains_key(&key));
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_topic(
        &mut self,
        id: u64,
        user: String,
        channel: String,
        topic: String,
        payload: Vec<u8>,
        message_type: MessageType,
        custom_type: Option<String>,
    ) -> Result<(), ServerError> {
        self.require_joined(id, &channel)?;
        let key = (channel.clone(), topic.clone());
        if !self.session(id)?.topics.contains(&key) {
            return Err(error(ServerErrorKind::NotJoined, format!("{}/{}", channel, topic)));
        }
        let stream_key = ChannelKey::stream(channel.clone());
        let publisher = user.clone();
        let event = ServerEvent::TopicMessage {
            channel,
            topic,
            message: Message {
                user_id: user,
                message_type,
                payload,
                custom_type,
            },
        };
        broadcast(&self.sessions, &event, |s| {
            s.channels.contains_key(&stream_key)
                && s
                    .topic_subscriptions
                    .get(&key)
                    .is_some_and(|users| users.includes(&publisher))
        });
        Ok(())
    }

    // --- Storage ---

    #[allow(clippy::too_many_arguments)]
    fn write_metadata(
        &mut self,
        user: &str,
        scope: &Scope,
        op: MetadataOp,
        items: Vec<MetadataItem>,
        major_rev: Option<i64>,
        lock: Option<String>,
        record_ts: bool,
        record_author: bool,
    ) -> Result<StorageEvent, ServerError> {
        if items.iter().any(|item| item.key.is_empty()) {
            return Err(error(ServerErrorKind::InvalidArgument, "empty metadata key"));
        }
        if op != MetadataOp::Remove && items.is_empty() {
            return Err(error(ServerErrorKind::InvalidArgument, "no metadata items"));
        }
        if let Some(lock) = lock {
            let Scope::Channel(key) = scope else {
                return Err(error(
                    ServerErrorKind::InvalidArgument,
                    "lock precondition on user metadata",
                ));
            };
            let held = self
                .locks
                .get(key)
                .and_then(|locks| locks.get(&lock))
                .is_some_and(|detail| detail.owner == user);
            if !held {
                return Err(error(ServerErrorKind::LockNotHeld, lock));
            }
        }

        let map = self.metadata.entry(scope.clone()).or_default();
        if let Some(expected) = major_rev {
            if expected != map.major_revision {
                let kind = ServerErrorKind::RevisionConflict {
                    expected,
                    actual: map.major_revision,
                };
                return Err(error(kind, scope.to_string()));
            }
        }
        if op == MetadataOp::Update {
            if let Some(missing) = items.iter().find(|i| !map.items.contains_key(&i.key)) {
                return Err(error(ServerErrorKind::NotFound, missing.key.clone()));
            }
        }

        let revision = map.major_revision + 1;
        let now = Timestamp::now().0;
        let mut affected = HashMap::new();
        let kind = match op {
            MetadataOp::Set | MetadataOp::Update => {
                for mut item in items {
                    item.revision = revision;
                    if record_ts {
                        item.update_ts = now;
                    }
                    if record_author {
                        item.author = user.to_string();
                    }
                    map.items.insert(item.key.clone(), item.clone());
                    affected.insert(item.key.clone(), item);
                }
                if op == MetadataOp::Set {
                    StorageEventKind::Set
                } else {
                    StorageEventKind::Update
                }
            }
            MetadataOp::Remove => {
                if items.is_empty() {
                    affected = std::mem::take(&mut map.items);
                } else {
                    for item in items {
                        if let Some(removed) = map.items.remove(&item.key) {
                            affected.insert(removed.key.clone(), removed);
                        }
                    }
                }
                StorageEventKind::Remove
            }
        };
        map.major_revision = revision;

        let event = StorageEvent {
            kind,
            major_revision: revision,
            items: affected,
        };
        let pushed = ServerEvent::Storage {
            scope: scope.clone(),
            event: event.clone(),
        };
        broadcast(&self.sessions, &pushed, |s| match scope {
            Scope::Channel(key) => s.concerns(key).is_some_and(|c| c.metadata),
            Scope::User(user_id) => s.user_metadata.contains(user_id),
        });
        Ok(event)
    }

    // --- Locks ---

    fn lock_mut(
        &mut self,
        channel: &ChannelKey,
        name: &str,
    ) -> Result<&mut LockDetail, ServerError> {
        self.locks
            .get_mut(channel)
            .and_then(|locks| locks.get_mut(name))
            .ok_or_else(|| error(ServerErrorKind::NotFound, name))
    }

    fn lock_snapshot(&self, channel: &ChannelKey) -> LockSnapshot {
        LockSnapshot {
            revision: self.lock_revisions.get(channel).copied().unwrap_or_default(),
            locks: self.locks.get(channel).cloned().unwrap_or_default(),
        }
    }

    /// Stamp the next channel lock revision on a change and broadcast it.
    fn lock_changed(&mut self, channel: &ChannelKey, mut event: LockEvent) -> Response {
        let revision = self.lock_revisions.entry(channel.clone()).or_default();
        *revision += 1;
        event.revision = *revision;
        let names: Vec<String> = event.details.iter().map(|d| d.name.clone()).collect();
        let pushed = ServerEvent::Lock {
            channel: channel.clone(),
            event: event.clone(),
        };
        broadcast(&self.sessions, &pushed, |s| {
            s.concerns(channel).is_some_and(|c| c.lock)
                || s
                    .lock_watches
                    .get(channel)
                    .is_some_and(|watched| names.iter().any(|n| watched.contains(n)))
        });
        Response::LockChanged { event }
    }

    fn expire(&mut self, channel: &ChannelKey, name: &str) -> bool {
        let Ok(detail) = self.lock_mut(channel, name) else {
            return false;
        };
        if !detail.is_held() {
            return false;
        }
        let expired = detail.clone();
        detail.owner.clear();
        let event = LockEvent {
            kind: LockEventKind::Expired,
            revision: 0,
            details: vec![expired],
        };
        self.lock_changed(channel, event);
        true
    }

    // --- Presence ---

    fn presence_snapshot(&self, key: &ChannelKey) -> HashMap<String, UserState> {
        self.presence
            .get(key)
            .map(|users| {
                users
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
                    .collect()
            })
            .unwrap_or_default()
    }

    fn present_state(
        &mut self,
        channel: &ChannelKey,
        user: &str,
    ) -> Result<&mut HashMap<String, String>, ServerError> {
        self.presence
            .get_mut(channel)
            .and_then(|users| users.get_mut(user))
            .ok_or_else(|| error(ServerErrorKind::NotSubscribed, channel.to_string()))
    }

    fn presence_changed(&self, channel: &ChannelKey, event: PresenceEvent) {
        let pushed = ServerEvent::Presence {
            channel: channel.clone(),
            event,
        };
        broadcast(&self.sessions, &pushed, |s| {
            s.concerns(channel).is_some_and(|c| c.presence)
        });
    }

    fn who_now(
        &self,
        channel: &ChannelKey,
        include_user_id: bool,
        include_state: bool,
        page: Option<String>,
    ) -> Result<Response, ServerError> {
        let offset = match page {
            None => 0,
            Some(token) => token
                .strip_prefix(PAGE_PREFIX)
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| error(ServerErrorKind::InvalidArgument, "bad page token"))?,
        };
        if !include_user_id {
            return Ok(Response::Users {
                users: HashMap::new(),
                next_page: None,
            });
        }
        let Some(present) = self.presence.get(channel) else {
            return Ok(Response::Users {
                users: HashMap::new(),
                next_page: None,
            });
        };
        let users: HashMap<String, UserState> = present
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|(user_id, state)| {
                let state = if include_state {
                    state.clone()
                } else {
                    HashMap::new()
                };
                (
                    user_id.clone(),
                    UserState {
                        user_id: user_id.clone(),
                        state,
                    },
                )
            })
            .collect();
        let next = offset + self.page_size;
        let next_page = (next < present.len()).then(|| format!("{}{}", PAGE_PREFIX, next));
        Ok(Response::Users { users, next_page })
    }

    // --- Snapshots ---

    fn snapshot(&self, scope: &Scope, kind: EntityKind) -> Result<SnapshotPayload, ServerError> {
        if kind == EntityKind::Storage {
            return Ok(SnapshotPayload::Metadata(
                self.metadata.get(scope).cloned().unwrap_or_default(),
            ));
        }
        let Scope::Channel(key) = scope else {
            return Err(error(
                ServerErrorKind::InvalidArgument,
                format!("{:?} snapshot for {}", kind, scope),
            ));
        };
        Ok(match kind {
            EntityKind::Lock => {
                SnapshotPayload::Locks(self.lock_snapshot(key))
            }
            EntityKind::Presence => SnapshotPayload::Presence(self.presence_snapshot(key)),
            EntityKind::Topic | EntityKind::Storage => {
                SnapshotPayload::Topics(self.topic_snapshot(&key.name))
            }
        })
    }
}

/// Authoritative in-process server.
///
/// Clones share state. Create one per test and hand each client its own
/// [`MemoryServer::transport`].
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState::new())),
        }
    }

    /// Users per who-now page. Default: 100
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state.lock().page_size = page_size.max(1);
        self
    }

    /// Greet every stream channel join with a notice, pushed before the
    /// join reply.
    pub fn with_join_notice(self, notice: impl Into<String>) -> Self {
        self.state.lock().join_notice = Some(notice.into());
        self
    }

    /// A new, not yet connected session.
    pub fn transport(&self) -> MemoryTransport {
        let (events_tx, events_rx) = unbounded();
        let mut state = self.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            Session {
                user_id: String::new(),
                logged_in: false,
                online: false,
                events: events_tx,
                states: None,
                channels: HashMap::new(),
                user_metadata: HashSet::new(),
                lock_watches: HashMap::new(),
                topics: HashSet::new(),
                topic_subscriptions: HashMap::new(),
            },
        );
        MemoryTransport {
            server: self.clone(),
            id,
            events: events_rx,
        }
    }

    /// Let a held lock's TTL run out. Returns false if nobody held it.
    pub fn expire_lock(&self, channel: &ChannelKey, name: &str) -> bool {
        self.state.lock().expire(channel, name)
    }

    /// Push an out-of-band notice to every session in a channel.
    pub fn notice(&self, channel: &str, notice: impl Into<String>) -> usize {
        let state = self.state.lock();
        let event = ServerEvent::Notice {
            channel: channel.to_string(),
            notice: notice.into(),
        };
        broadcast(&state.sessions, &event, |s| {
            s.channels.keys().any(|key| key.name == channel)
        })
    }

    /// Current authoritative metadata of a scope.
    pub fn metadata(&self, scope: &Scope) -> MetadataSnapshot {
        self.state
            .lock()
            .metadata
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    /// Current authoritative lock details of a channel.
    pub fn locks(&self, channel: &ChannelKey) -> HashMap<String, LockDetail> {
        self.state
            .lock()
            .locks
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

/// One client session on a [`MemoryServer`].
pub struct MemoryTransport {
    server: MemoryServer,
    id: u64,
    events: Receiver<ServerEvent>,
}

impl MemoryTransport {
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }

    /// Report a connection state change to the client.
    pub fn push_state(&self, state: ConnectionState, reason: ConnectionChangeReason) {
        if let Some(session) = self.server.state.lock().sessions.get(&self.id) {
            session.push_state(state, reason);
        }
    }

    /// Report an arbitrary raw state change, including codes the client
    /// does not know.
    pub fn push_raw(&self, raw: RawStateChange) {
        if let Some(session) = self.server.state.lock().sessions.get(&self.id) {
            if let Some(states) = &session.states {
                let _ = states.send(raw);
            }
        }
    }

    /// Lose the connection: requests fail and pushed events are lost until
    /// [`restore`](Self::restore).
    pub fn interrupt(&self) {
        self.interrupt_as(ConnectionState::Reconnecting, ConnectionChangeReason::Interrupted);
    }

    /// Lose the connection and report it as `state` instead of RECONNECTING.
    pub fn interrupt_as(&self, state: ConnectionState, reason: ConnectionChangeReason) {
        let mut server = self.server.state.lock();
        if let Some(session) = server.sessions.get_mut(&self.id) {
            session.online = false;
            session.push_state(state, reason);
        }
    }

    /// Reconnect after [`interrupt`](Self::interrupt).
    pub fn restore(&self) {
        let mut state = self.server.state.lock();
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.online = true;
            session.push_state(ConnectionState::Connected, ConnectionChangeReason::RejoinSuccess);
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, credentials: &Credentials) -> Result<Receiver<RawStateChange>, ServerError> {
        if credentials.app_id.is_empty() {
            return Err(error(ServerErrorKind::InvalidArgument, "empty app id"));
        }
        let mut state = self.server.state.lock();
        let session = state
            .sessions
            .get_mut(&self.id)
            .ok_or_else(|| error(ServerErrorKind::Disconnected, "unknown session"))?;
        if session.logged_in {
            return Err(error(ServerErrorKind::InvalidArgument, "session already connected"));
        }
        let (states_tx, states_rx) = unbounded();
        session.user_id = credentials.user_id.clone();
        session.logged_in = true;
        session.online = true;
        session.states = Some(states_tx);
        session.push_state(ConnectionState::Connecting, ConnectionChangeReason::Connecting);
        session.push_state(ConnectionState::Connected, ConnectionChangeReason::LoginSuccess);
        debug!(session = self.id, user = %credentials.user_id, "Session connected");
        Ok(states_rx)
    }

    fn request(&self, request: Request) -> Result<Response, ServerError> {
        self.server.state.lock().handle(self.id, request)
    }

    fn server_events(&self) -> Receiver<ServerEvent> {
        self.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(user: &str) -> Credentials {
        Credentials {
            app_id: "app".into(),
            user_id: user.into(),
            token: String::new(),
            vendor_id: 0,
            area_code: Default::default(),
            presence_timeout: 0,
            log_file_path: None,
            parameters: Default::default(),
        }
    }

    fn connected(server: &MemoryServer, user: &str) -> MemoryTransport {
        let transport = server.transport();
        transport.connect(&credentials(user)).unwrap();
        transport
    }

    fn write(rev: Option<i64>, key: &str) -> Request {
        Request::WriteMetadata {
            scope: Scope::Channel(ChannelKey::message("room")),
            op: MetadataOp::Set,
            items: vec![MetadataItem::new(key, "v")],
            major_rev: rev,
            lock: None,
            record_ts: false,
            record_author: true,
        }
    }

    #[test]
    fn test_connect_reports_states() {
        let server = MemoryServer::new();
        let transport = server.transport();
        let states = transport.connect(&credentials("alice")).unwrap();
        let codes: Vec<i32> = states.try_iter().map(|s| s.state).collect();
        assert_eq!(
            codes,
            vec![
                ConnectionState::Connecting.code(),
                ConnectionState::Connected.code()
            ]
        );
    }

    #[test]
    fn test_requests_fail_before_connect() {
        let server = MemoryServer::new();
        let transport = server.transport();
        let err = transport.request(Request::Logout).unwrap_err();
        assert_eq!(err.kind, ServerErrorKind::Disconnected);
    }

    #[test]
    fn test_revision_check() {
        let server = MemoryServer::new();
        let alice = connected(&server, "alice");

        let Response::MetadataWritten { event } = alice.request(write(Some(0), "a")).unwrap() else {
            panic!("unexpected response");
        };
        assert_eq!(event.major_revision, 1);
        assert_eq!(event.items["a"].author, "alice");

        let err = alice.request(write(Some(0), "b")).unwrap_err();
        assert_eq!(
            err.kind,
            ServerErrorKind::RevisionConflict {
                expected: 0,
                actual: 1
            }
        );
        assert_eq!(
            server
                .metadata(&Scope::Channel(ChannelKey::message("room")))
                .major_revision,
            1
        );
    }

    #[test]
    fn test_lock_contention() {
        let server = MemoryServer::new();
        let alice = connected(&server, "alice");
        let bob = connected(&server, "bob");
        let key = ChannelKey::message("room");

        alice
            .request(Request::SetLock {
                channel: key.clone(),
                name: "L".into(),
                ttl: 10,
            })
            .unwrap();
        alice
            .request(Request::AcquireLock {
                channel: key.clone(),
                name: "L".into(),
            })
            .unwrap();
        let err = bob
            .request(Request::AcquireLock {
                channel: key.clone(),
                name: "L".into(),
            })
            .unwrap_err();
        assert_eq!(
            err.kind,
            ServerErrorKind::LockHeldByOther {
                owner: "alice".into()
            }
        );

        assert!(server.expire_lock(&key, "L"));
        assert!(!server.expire_lock(&key, "L"));
        let Response::LockChanged { event } = bob
            .request(Request::AcquireLock {
                channel: key.clone(),
                name: "L".into(),
            })
            .unwrap()
        else {
            panic!("unexpected response");
        };
        // set, acquire, expire, acquire
        assert_eq!(event.revision, 4);
        assert_eq!(server.locks(&key)["L"].owner, "bob");
    }

    #[test]
    fn test_who_now_pagination() {
        let server = MemoryServer::new().with_page_size(2);
        let key = ChannelKey::message("room");
        let sessions: Vec<MemoryTransport> = ["a", "b", "c"]
            .iter()
            .map(|user| {
                let t = connected(&server, user);
                t.request(Request::Subscribe {
                    channel: "room".into(),
                    concerns: Concerns::default(),
                    state: HashMap::new(),
                })
                .unwrap();
                t
            })
            .collect();

        let who = |page: Option<String>| {
            match sessions[0]
                .request(Request::WhoNow {
                    channel: key.clone(),
                    include_user_id: true,
                    include_state: false,
                    page,
                })
                .unwrap()
            {
                Response::Users { users, next_page } => (users, next_page),
                other => panic!("unexpected {:?}", other),
            }
        };
        let (first, next) = who(None);
        assert_eq!(first.len(), 2);
        let (second, last) = who(next);
        assert_eq!(second.len(), 1);
        assert!(last.is_none());
    }

    #[test]
    fn test_offline_session_loses_events() {
        let server = MemoryServer::new();
        let alice = connected(&server, "alice");
        let bob = connected(&server, "bob");
        bob.request(Request::Subscribe {
            channel: "room".into(),
            concerns: Concerns {
                message: true,
                ..Default::default()
            },
            state: HashMap::new(),
        })
        .unwrap();
        let events = bob.server_events();

        bob.interrupt();
        assert_eq!(
            bob.request(Request::Logout).unwrap_err().kind,
            ServerErrorKind::Disconnected
        );
        alice
            .request(Request::Publish {
                channel: "room".into(),
                payload: b"lost".to_vec(),
                message_type: MessageType::Binary,
                custom_type: None,
            })
            .unwrap();
        assert!(events.try_recv().is_err());

        bob.restore();
        alice
            .request(Request::Publish {
                channel: "room".into(),
                payload: b"seen".to_vec(),
                message_type: MessageType::Binary,
                custom_type: None,
            })
            .unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(ServerEvent::Message { .. })
        ));
    }
}
