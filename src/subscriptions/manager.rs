//! Registry of live subscriptions and the engines serving them.

use crate::error::{Result, RtmError};
use crate::gateway::{self, DropReason, EventSender, EventStream, OverflowPolicy};
use crate::state::{
    graph_from_lists, EntityKind, LockEntity, PresenceEntity, StorageEntity, SyncEngine,
    TopicEntity,
};
use crate::transport::{InitialSnapshots, SnapshotPayload};
use crate::types::{ChannelKey, ChannelType, Message, Scope, StorageEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::types::{Concern, Concerns};

/// Internal per-channel subscription state.
struct ChannelSubscription {
    concerns: Concerns,
    /// Only message channels carry a channel-wide message stream.
    messages: Option<EventSender<Message>>,
    /// The server confirmed the subscribe/join handshake.
    active: bool,
}

/// Owns every subscription and the four entity engines.
///
/// Subscribing and unsubscribing hold the channel map lock for the whole
/// engine attach/detach, so a teardown never leaves half a subscription
/// registered.
pub struct SubscriptionRegistry {
    channels: Mutex<HashMap<ChannelKey, ChannelSubscription>>,
    users: Mutex<HashSet<String>>,
    storage: SyncEngine<StorageEntity>,
    locks: SyncEngine<LockEntity>,
    presence: SyncEngine<PresenceEntity>,
    topics: SyncEngine<TopicEntity>,
    buffer_size: usize,
    policy: OverflowPolicy,
}

impl SubscriptionRegistry {
    pub fn new(buffer_size: usize, policy: OverflowPolicy) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            users: Mutex::new(HashSet::new()),
            storage: SyncEngine::new(buffer_size, policy),
            locks: SyncEngine::new(buffer_size, policy),
            presence: SyncEngine::new(buffer_size, policy),
            topics: SyncEngine::new(buffer_size, policy),
            buffer_size,
            policy,
        }
    }

    pub fn storage(&self) -> &SyncEngine<StorageEntity> {
        &self.storage
    }

    pub fn locks(&self) -> &SyncEngine<LockEntity> {
        &self.locks
    }

    pub fn presence(&self) -> &SyncEngine<PresenceEntity> {
        &self.presence
    }

    pub fn topics(&self) -> &SyncEngine<TopicEntity> {
        &self.topics
    }

    /// Attach `kind` for `scope`, or tell the caller it was already there.
    fn attach_kind(&self, kind: EntityKind, scope: &Scope) -> Result<()> {
        match kind {
            EntityKind::Storage => self.storage.attach(scope).map(drop),
            EntityKind::Lock => self.locks.attach(scope).map(drop),
            EntityKind::Presence => self.presence.attach(scope).map(drop),
            EntityKind::Topic => self.topics.attach(scope).map(drop),
        }
    }

    fn detach_kind(&self, kind: EntityKind, scope: &Scope, reason: DropReason) {
        match kind {
            EntityKind::Storage => self.storage.detach(scope, reason),
            EntityKind::Lock => self.locks.detach(scope, reason),
            EntityKind::Presence => self.presence.detach(scope, reason),
            EntityKind::Topic => self.topics.detach(scope, reason),
        };
    }

    fn kinds_for(key: &ChannelKey, concerns: Concerns) -> Vec<EntityKind> {
        let mut kinds: Vec<EntityKind> = concerns
            .iter()
            .filter_map(|c| match c {
                Concern::Message => None,
                Concern::Metadata => Some(EntityKind::Storage),
                Concern::Presence => Some(EntityKind::Presence),
                Concern::Lock => Some(EntityKind::Lock),
            })
            .collect();
        if key.channel_type == ChannelType::Stream {
            kinds.push(EntityKind::Topic);
        }
        kinds
    }

    /// Register a subscription before the server is asked for it.
    ///
    /// Engine scopes start out waiting for their snapshot; call
    /// [`activate`](Self::activate) with the server's reply, or
    /// [`remove`](Self::remove) if the request failed. Returns the
    /// channel-wide message stream for message channels.
    pub fn reserve(
        &self,
        key: &ChannelKey,
        concerns: Concerns,
    ) -> Result<Option<EventStream<Message>>> {
        let mut channels = self.channels.lock();
        if channels.contains_key(key) {
            return Err(RtmError::AlreadySubscribed(key.to_string()));
        }

        let scope = Scope::Channel(key.clone());
        let kinds = Self::kinds_for(key, concerns);
        for (i, kind) in kinds.iter().enumerate() {
            if let Err(e) = self.attach_kind(*kind, &scope) {
                for attached in &kinds[..i] {
                    self.detach_kind(*attached, &scope, DropReason::Unsubscribed);
                }
                return Err(e);
            }
        }

        let (messages, stream) = if key.channel_type == ChannelType::Message {
            let (tx, rx) = gateway::channel(
                format!("message/{}", key),
                self.buffer_size,
                self.policy,
            );
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        channels.insert(
            key.clone(),
            ChannelSubscription {
                concerns,
                messages,
                active: false,
            },
        );
        info!(channel = %key, %concerns, "Subscription reserved");
        Ok(stream)
    }

    /// Install the initial snapshots returned by the server.
    pub fn activate(&self, key: &ChannelKey, snapshots: InitialSnapshots) {
        let mut channels = self.channels.lock();
        let Some(sub) = channels.get_mut(key) else {
            debug!(channel = %key, "Activation for removed subscription ignored");
            return;
        };
        let scope = Scope::Channel(key.clone());
        for kind in Self::kinds_for(key, sub.concerns) {
            match kind {
                EntityKind::Storage => {
                    self.storage
                        .install(&scope, snapshots.metadata.clone().unwrap_or_default());
                }
                EntityKind::Lock => {
                    self.locks
                        .install(&scope, snapshots.locks.clone().unwrap_or_default());
                }
                EntityKind::Presence => {
                    self.presence
                        .install(&scope, snapshots.presence.clone().unwrap_or_default());
                }
                EntityKind::Topic => {
                    let graph = snapshots
                        .topics
                        .clone()
                        .map(graph_from_lists)
                        .unwrap_or_default();
                    self.topics.install(&scope, graph);
                }
            }
        }
        sub.active = true;
        info!(channel = %key, concerns = %sub.concerns, "Subscription active");
    }

    /// Tear down a subscription and every engine scope it owns.
    ///
    /// Returns the removed concerns, or `None` if there was nothing to remove.
    pub fn remove(&self, key: &ChannelKey, reason: DropReason) -> Option<Concerns> {
        let mut channels = self.channels.lock();
        let sub = channels.remove(key)?;
        let scope = Scope::Channel(key.clone());
        for kind in [
            EntityKind::Storage,
            EntityKind::Lock,
            EntityKind::Presence,
            EntityKind::Topic,
        ] {
            self.detach_kind(kind, &scope, reason);
        }
        if let Some(messages) = &sub.messages {
            messages.close(reason);
        }
        info!(channel = %key, ?reason, "Subscription removed");
        Some(sub.concerns)
    }

    pub fn concerns(&self, key: &ChannelKey) -> Option<Concerns> {
        self.channels.lock().get(key).map(|s| s.concerns)
    }

    /// Subscribed, with the handshake confirmed. A reserved subscription
    /// still waiting for the server is not active.
    pub fn is_active(&self, key: &ChannelKey) -> bool {
        self.channels.lock().get(key).is_some_and(|s| s.active)
    }

    pub fn channels(&self) -> Vec<ChannelKey> {
        self.channels.lock().keys().cloned().collect()
    }

    /// Deliver a channel message to the subscription's message stream.
    pub fn deliver_message(&self, key: &ChannelKey, message: Message) -> bool {
        let channels = self.channels.lock();
        match channels.get(key) {
            Some(sub) if sub.concerns.message => match &sub.messages {
                Some(messages) => {
                    messages.send(message);
                    true
                }
                None => false,
            },
            _ => {
                debug!(channel = %key, "Message for unsubscribed channel dropped");
                false
            }
        }
    }

    // --- User metadata ---

    pub fn reserve_user(&self, user_id: &str) -> Result<EventStream<StorageEvent>> {
        let mut users = self.users.lock();
        if users.contains(user_id) {
            return Err(RtmError::AlreadySubscribed(format!("user:{}", user_id)));
        }
        let stream = self.storage.attach(&Scope::User(user_id.to_string()))?;
        users.insert(user_id.to_string());
        Ok(stream)
    }

    pub fn remove_user(&self, user_id: &str, reason: DropReason) -> bool {
        let mut users = self.users.lock();
        if !users.remove(user_id) {
            return false;
        }
        self.storage.detach(&Scope::User(user_id.to_string()), reason);
        true
    }

    pub fn subscription_count(&self) -> usize {
        self.channels.lock().len() + self.users.lock().len()
    }

    /// Remove every subscription.
    pub fn clear(&self, reason: DropReason) {
        for key in self.channels() {
            self.remove(&key, reason);
        }
        let users: Vec<String> = self.users.lock().iter().cloned().collect();
        for user in users {
            self.remove_user(&user, reason);
        }
    }

    // --- Reconnect ---

    pub fn mark_all_stale(&self) {
        self.storage.mark_all_stale();
        self.locks.mark_all_stale();
        self.presence.mark_all_stale();
        self.topics.mark_all_stale();
    }

    /// Refetch every waiting scope. Returns how many snapshots were installed.
    pub fn resync<F>(&self, fetch: F) -> usize
    where
        F: Fn(&Scope, EntityKind) -> Result<SnapshotPayload>,
    {
        self.storage.resync(&fetch)
            + self.locks.resync(&fetch)
            + self.presence.resync(&fetch)
            + self.topics.resync(&fetch)
    }
}
