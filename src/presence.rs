//! Presence queries and per-channel user state.
//!
//! State set for a channel this client has not subscribed to (or joined)
//! yet is cached locally and sent with the next subscribe/join handshake,
//! so it never races the join.

use crate::client::ClientInner;
use crate::error::{Result, RtmError};
use crate::gateway::EventStream;
use crate::options::PresenceOptions;
use crate::transport::{Request, Response};
use crate::types::{ChannelInfo, ChannelKey, ChannelType, PresenceEvent, Scope, UserState};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// State waiting for the next handshake, per channel.
///
/// Every state update for a channel, cached or sent, runs under the cache
/// lock, so a handshake settling its leftovers never overtakes a newer
/// direct update.
#[derive(Default)]
pub(crate) struct PresenceCache {
    pending: Mutex<PendingStates>,
}

type PendingStates = HashMap<ChannelKey, HashMap<String, String>>;

fn drop_keys(pending: &mut PendingStates, key: &ChannelKey, keys: &[String]) {
    if keys.is_empty() {
        pending.remove(key);
        return;
    }
    if let Some(state) = pending.get_mut(key) {
        for k in keys {
            state.remove(k);
        }
        if state.is_empty() {
            pending.remove(key);
        }
    }
}

impl PresenceCache {
    /// Copy of the cached state to send with a handshake.
    pub(crate) fn pending(&self, key: &ChannelKey) -> HashMap<String, String> {
        self.pending.lock().get(key).cloned().unwrap_or_default()
    }

    /// After a handshake carrying `sent` succeeded: forget what it carried
    /// and send whatever was cached while it was in flight.
    pub(crate) fn settle(
        &self,
        key: &ChannelKey,
        sent: &HashMap<String, String>,
        send: impl FnOnce(HashMap<String, String>) -> Result<()>,
    ) {
        let mut pending = self.pending.lock();
        let Some(state) = pending.get_mut(key) else {
            return;
        };
        state.retain(|k, v| sent.get(k) != Some(v));
        if state.is_empty() {
            pending.remove(key);
            return;
        }
        let leftover = state.clone();
        let keys = leftover.len();
        match send(leftover) {
            Ok(()) => {
                pending.remove(key);
                debug!(channel = %key, keys, "Presence state cached during handshake sent");
            }
            Err(e) => warn!(channel = %key, error = %e, "Cached presence state not sent"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingStates> {
        self.pending.lock()
    }

    pub(crate) fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// One page of a who-now query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OnlineUsers {
    pub users: Vec<UserState>,
    /// Pass back in [`PresenceOptions::page`] for the next page; `None` on
    /// the last page.
    pub next_page: Option<String>,
}

/// Presence operations. Obtained from
/// [`RtmClient::presence`](crate::RtmClient::presence).
#[derive(Clone)]
pub struct RtmPresence {
    inner: Arc<ClientInner>,
}

impl RtmPresence {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Users present in a channel, one page at a time.
    pub fn who_now(
        &self,
        channel: &str,
        channel_type: ChannelType,
        opts: &PresenceOptions,
    ) -> Result<OnlineUsers> {
        let request = Request::WhoNow {
            channel: ChannelKey::new(channel, channel_type),
            include_user_id: opts.include_user_id,
            include_state: opts.include_state,
            page: opts.page.clone(),
        };
        match self.inner.request(request)? {
            Response::Users { users, next_page } => {
                let mut users: Vec<UserState> = users.into_values().collect();
                users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
                Ok(OnlineUsers { users, next_page })
            }
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Alias of [`who_now`](Self::who_now).
    pub fn get_online_users(
        &self,
        channel: &str,
        channel_type: ChannelType,
        opts: &PresenceOptions,
    ) -> Result<OnlineUsers> {
        self.who_now(channel, channel_type, opts)
    }

    /// Channels a user is present in.
    pub fn where_now(&self, user_id: &str) -> Result<Vec<ChannelInfo>> {
        let request = Request::WhereNow {
            user_id: user_id.to_string(),
        };
        match self.inner.request(request)? {
            Response::Channels { channels } => Ok(channels),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Alias of [`where_now`](Self::where_now).
    pub fn get_user_channels(&self, user_id: &str) -> Result<Vec<ChannelInfo>> {
        self.where_now(user_id)
    }

    /// Set this user's state keys in a channel.
    ///
    /// Sent right away when subscribed to (or joined) the channel, cached for
    /// the next handshake otherwise.
    pub fn set_state(
        &self,
        channel: &str,
        channel_type: ChannelType,
        state: HashMap<String, String>,
    ) -> Result<()> {
        let key = ChannelKey::new(channel, channel_type);
        let mut pending = self.inner.presence_cache.lock();
        if !self.inner.registry.is_active(&key) {
            debug!(channel = %key, keys = state.len(), "Presence state cached");
            pending.entry(key).or_default().extend(state);
            return Ok(());
        }
        // Anything still cached for these keys is older than this update.
        let keys: Vec<String> = state.keys().cloned().collect();
        if !keys.is_empty() {
            drop_keys(&mut pending, &key, &keys);
        }
        match self.inner.request(Request::SetState {
            channel: key,
            state,
        })? {
            Response::Ok => Ok(()),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Remove state keys; an empty list removes all of them.
    pub fn remove_state(
        &self,
        channel: &str,
        channel_type: ChannelType,
        keys: Vec<String>,
    ) -> Result<()> {
        let key = ChannelKey::new(channel, channel_type);
        let mut pending = self.inner.presence_cache.lock();
        drop_keys(&mut pending, &key, &keys);
        if !self.inner.registry.is_active(&key) {
            return Ok(());
        }
        match self.inner.request(Request::RemoveState { channel: key, keys })? {
            Response::Ok => Ok(()),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// A user's state in a channel. Needs no subscription.
    pub fn get_state(
        &self,
        channel: &str,
        channel_type: ChannelType,
        user_id: &str,
    ) -> Result<HashMap<String, String>> {
        let request = Request::GetState {
            channel: ChannelKey::new(channel, channel_type),
            user_id: user_id.to_string(),
        };
        match self.inner.request(request)? {
            Response::State { state } => Ok(state),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Users present in a presence-subscribed channel, and its event stream.
    pub fn presence_events(
        &self,
        channel: &str,
        channel_type: ChannelType,
    ) -> Result<(HashMap<String, UserState>, EventStream<PresenceEvent>)> {
        let scope = Scope::Channel(ChannelKey::new(channel, channel_type));
        self.inner.registry.presence().stream(&scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_drop_keys() {
        let key = ChannelKey::message("room");
        let mut pending = PendingStates::new();
        pending.insert(key.clone(), state(&[("mood", "busy"), ("seat", "3")]));

        drop_keys(&mut pending, &key, &["seat".to_string()]);
        assert_eq!(pending[&key], state(&[("mood", "busy")]));
        drop_keys(&mut pending, &key, &["mood".to_string()]);
        assert!(!pending.contains_key(&key));

        pending.insert(key.clone(), state(&[("a", "1")]));
        drop_keys(&mut pending, &key, &[]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_settle_sends_only_what_the_handshake_missed() {
        let cache = PresenceCache::default();
        let key = ChannelKey::message("room");
        cache
            .lock()
            .insert(key.clone(), state(&[("mood", "ok"), ("seat", "3")]));
        let sent = cache.pending(&key);
        // Cached while the handshake was in flight.
        cache
            .lock()
            .get_mut(&key)
            .unwrap()
            .insert("mood".into(), "busy".into());

        let mut resent = None;
        cache.settle(&key, &sent, |leftover| {
            resent = Some(leftover);
            Ok(())
        });
        assert_eq!(resent, Some(state(&[("mood", "busy")])));
        assert!(cache.pending(&key).is_empty());

        // Nothing new: nothing is sent.
        cache.lock().insert(key.clone(), state(&[("a", "1")]));
        let sent = cache.pending(&key);
        cache.settle(&key, &sent, |_| panic!("nothing to send"));
        assert!(cache.pending(&key).is_empty());
    }

    #[test]
    fn test_cache_scoped_by_channel_type() {
        let cache = PresenceCache::default();
        cache
            .lock()
            .insert(ChannelKey::message("room"), state(&[("a", "1")]));
        assert!(cache.pending(&ChannelKey::stream("room")).is_empty());
        cache.clear();
        assert!(cache.pending(&ChannelKey::message("room")).is_empty());
    }
}
