//! Channel and user metadata.
//!
//! Writes are optimistic: a `major_rev` precondition must match the map's
//! current revision and a `lock` precondition must name a lock this user
//! holds. Preconditions already contradicted by a synced local snapshot
//! fail without a round trip; everything else is decided by the server.

use crate::client::ClientInner;
use crate::error::{Result, RtmError};
use crate::gateway::{DropReason, EventStream};
use crate::options::StorageOptions;
use crate::transport::{MetadataOp, Request, Response};
use crate::types::{ChannelKey, ChannelType, MetadataItem, MetadataSnapshot, Scope, StorageEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata operations. Obtained from
/// [`RtmClient::storage`](crate::RtmClient::storage).
#[derive(Clone)]
pub struct RtmStorage {
    inner: Arc<ClientInner>,
}

impl RtmStorage {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    fn check_preconditions(&self, scope: &Scope, opts: &StorageOptions) -> Result<()> {
        if let Some(expected) = opts.major_rev {
            let local = self
                .inner
                .registry
                .storage()
                .inspect(scope, |snapshot| snapshot.major_revision);
            if let Some(actual) = local {
                // Our copy may lag the server, never lead it.
                if expected < actual {
                    return Err(RtmError::RevisionConflict { expected, actual });
                }
            }
        }

        if let Some(lock) = &opts.lock {
            if scope.channel().is_none() {
                return Err(RtmError::InvalidArgument(
                    "lock precondition needs a channel".into(),
                ));
            }
            let owner = self
                .inner
                .registry
                .locks()
                .inspect(scope, |snapshot| snapshot.locks.get(lock).map(|d| d.owner.clone()));
            if let Some(owner) = owner {
                if owner.as_deref() != Some(self.inner.config.user_id.as_str()) {
                    return Err(RtmError::LockNotHeld(lock.clone()));
                }
            }
        }
        Ok(())
    }

    fn write(
        &self,
        scope: Scope,
        op: MetadataOp,
        items: Vec<MetadataItem>,
        opts: &StorageOptions,
    ) -> Result<i64> {
        if items.iter().any(|item| item.key.is_empty()) {
            return Err(RtmError::InvalidArgument("metadata key is empty".into()));
        }
        if op != MetadataOp::Remove && items.is_empty() {
            return Err(RtmError::InvalidArgument("no metadata items".into()));
        }
        self.check_preconditions(&scope, opts)?;

        let response = self.inner.request(Request::WriteMetadata {
            scope: scope.clone(),
            op,
            items,
            major_rev: opts.major_rev,
            lock: opts.lock.clone(),
            record_ts: opts.record_ts,
            record_author: opts.record_author,
        })?;
        match response {
            Response::MetadataWritten { event } => {
                let revision = event.major_revision;
                debug!(%scope, ?op, revision, "Metadata written");
                self.inner.registry.storage().apply(&scope, event);
                Ok(revision)
            }
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    fn get(&self, scope: Scope) -> Result<MetadataSnapshot> {
        match self.inner.request(Request::GetMetadata { scope })? {
            Response::Metadata { snapshot } => Ok(snapshot),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    // --- Channel metadata ---

    /// Create or replace items. Returns the new major revision.
    pub fn set_channel_metadata(
        &self,
        channel: &str,
        channel_type: ChannelType,
        items: Vec<MetadataItem>,
        opts: &StorageOptions,
    ) -> Result<i64> {
        let scope = Scope::Channel(ChannelKey::new(channel, channel_type));
        self.write(scope, MetadataOp::Set, items, opts)
    }

    /// Change existing items; fails with [`RtmError::NotFound`] if any key
    /// is missing.
    pub fn update_channel_metadata(
        &self,
        channel: &str,
        channel_type: ChannelType,
        items: Vec<MetadataItem>,
        opts: &StorageOptions,
    ) -> Result<i64> {
        let scope = Scope::Channel(ChannelKey::new(channel, channel_type));
        self.write(scope, MetadataOp::Update, items, opts)
    }

    /// Delete the given keys; no items deletes the whole map.
    pub fn remove_channel_metadata(
        &self,
        channel: &str,
        channel_type: ChannelType,
        items: Vec<MetadataItem>,
        opts: &StorageOptions,
    ) -> Result<i64> {
        let scope = Scope::Channel(ChannelKey::new(channel, channel_type));
        self.write(scope, MetadataOp::Remove, items, opts)
    }

    /// Server copy of a channel's metadata. Needs no subscription.
    pub fn get_channel_metadata(
        &self,
        channel: &str,
        channel_type: ChannelType,
    ) -> Result<MetadataSnapshot> {
        self.get(Scope::Channel(ChannelKey::new(channel, channel_type)))
    }

    /// Synced copy and event stream of a metadata-subscribed channel.
    pub fn channel_metadata_events(
        &self,
        channel: &str,
        channel_type: ChannelType,
    ) -> Result<(MetadataSnapshot, EventStream<StorageEvent>)> {
        let scope = Scope::Channel(ChannelKey::new(channel, channel_type));
        self.inner.registry.storage().stream(&scope)
    }

    // --- User metadata ---

    pub fn set_user_metadata(
        &self,
        user_id: &str,
        items: Vec<MetadataItem>,
        opts: &StorageOptions,
    ) -> Result<i64> {
        self.write(Scope::User(user_id.to_string()), MetadataOp::Set, items, opts)
    }

    pub fn update_user_metadata(
        &self,
        user_id: &str,
        items: Vec<MetadataItem>,
        opts: &StorageOptions,
    ) -> Result<i64> {
        self.write(Scope::User(user_id.to_string()), MetadataOp::Update, items, opts)
    }

    pub fn remove_user_metadata(
        &self,
        user_id: &str,
        items: Vec<MetadataItem>,
        opts: &StorageOptions,
    ) -> Result<i64> {
        self.write(Scope::User(user_id.to_string()), MetadataOp::Remove, items, opts)
    }

    pub fn get_user_metadata(&self, user_id: &str) -> Result<MetadataSnapshot> {
        self.get(Scope::User(user_id.to_string()))
    }

    /// Follow a user's metadata. The stream opens with a snapshot event.
    pub fn subscribe_user_metadata(&self, user_id: &str) -> Result<EventStream<StorageEvent>> {
        let stream = self.inner.registry.reserve_user(user_id)?;
        let scope = Scope::User(user_id.to_string());
        let subscribed = self
            .inner
            .request(Request::SubscribeUserMetadata {
                user_id: user_id.to_string(),
            })
            .and_then(|_| self.get(scope.clone()));
        match subscribed {
            Ok(snapshot) => {
                self.inner.registry.storage().install(&scope, snapshot);
                info!(user = user_id, "Subscribed to user metadata");
                Ok(stream)
            }
            Err(e) => {
                self.inner
                    .registry
                    .remove_user(user_id, DropReason::Unsubscribed);
                Err(e)
            }
        }
    }

    pub fn unsubscribe_user_metadata(&self, user_id: &str) -> Result<()> {
        if !self
            .inner
            .registry
            .remove_user(user_id, DropReason::Unsubscribed)
        {
            return Err(RtmError::NotSubscribed(format!("user:{}", user_id)));
        }
        let request = Request::UnsubscribeUserMetadata {
            user_id: user_id.to_string(),
        };
        if let Err(e) = self.inner.request(request) {
            warn!(user = user_id, error = %e, "Server-side unsubscribe failed");
        }
        info!(user = user_id, "Unsubscribed from user metadata");
        Ok(())
    }

    /// Synced copy and event stream of a subscribed user's metadata.
    pub fn user_metadata_events(
        &self,
        user_id: &str,
    ) -> Result<(MetadataSnapshot, EventStream<StorageEvent>)> {
        self.inner
            .registry
            .storage()
            .stream(&Scope::User(user_id.to_string()))
    }
}
