//! Lock definitions, ownership and retrying acquisition.
//!
//! `set`/`get`/`remove` manage lock definitions; `acquire`/`release`/
//! `revoke` manage ownership. Expiry is decided by the server and only
//! reflected here.
//!
//! A retrying [`RtmLock::acquire`] registers a waiter and asks the server to
//! forward events for that one lock. Every release, expiry or removal the
//! dispatcher sees retries the oldest waiter; each waiter resolves exactly
//! once, with `Ok(())` on acquisition or an error on cancellation.

use crate::client::ClientInner;
use crate::error::{Result, RtmError};
use crate::gateway::EventStream;
use crate::transport::{Request, Response};
use crate::types::{ChannelKey, ChannelType, LockDetail, LockEvent, Scope};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

struct Waiter {
    id: u64,
    channel: ChannelKey,
    name: String,
    tx: Sender<Result<()>>,
}

/// Pending retrying acquisitions, oldest first.
#[derive(Default)]
pub(crate) struct LockWaiters {
    waiters: Mutex<Vec<Waiter>>,
    next_id: AtomicU64,
}

impl LockWaiters {
    pub(crate) fn register(
        &self,
        channel: &ChannelKey,
        name: &str,
    ) -> (u64, Receiver<Result<()>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.waiters.lock().push(Waiter {
            id,
            channel: channel.clone(),
            name: name.to_string(),
            tx,
        });
        (id, rx)
    }

    /// Oldest waiter for a lock.
    pub(crate) fn first(&self, channel: &ChannelKey, name: &str) -> Option<u64> {
        self.waiters
            .lock()
            .iter()
            .find(|w| &w.channel == channel && w.name == name)
            .map(|w| w.id)
    }

    /// Resolve one waiter. False if it was already resolved.
    pub(crate) fn resolve(&self, id: u64, result: Result<()>) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock();
            let Some(pos) = waiters.iter().position(|w| w.id == id) else {
                return false;
            };
            waiters.remove(pos)
        };
        // The caller may have dropped its handle.
        let _ = waiter.tx.send(result);
        true
    }

    fn cancel_where(&self, reason: &str, pred: impl Fn(&Waiter) -> bool) -> usize {
        let cancelled: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let (cancelled, kept) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| pred(w));
            *waiters = kept;
            cancelled
        };
        for waiter in &cancelled {
            let _ = waiter.tx.send(Err(RtmError::Cancelled(reason.to_string())));
        }
        cancelled.len()
    }

    pub(crate) fn cancel_lock(&self, channel: &ChannelKey, name: &str, reason: &str) -> usize {
        self.cancel_where(reason, |w| &w.channel == channel && w.name == name)
    }

    pub(crate) fn cancel_channel(&self, channel: &ChannelKey, reason: &str) -> usize {
        self.cancel_where(reason, |w| &w.channel == channel)
    }

    pub(crate) fn cancel_all(&self, reason: &str) -> usize {
        self.cancel_where(reason, |_| true)
    }

    pub(crate) fn is_waiting(&self, channel: &ChannelKey, name: &str) -> bool {
        self.first(channel, name).is_some()
    }

    /// Every lock somebody is waiting for.
    pub(crate) fn pending(&self) -> Vec<(ChannelKey, String)> {
        let mut pending: Vec<(ChannelKey, String)> = Vec::new();
        for waiter in self.waiters.lock().iter() {
            let key = (waiter.channel.clone(), waiter.name.clone());
            if !pending.contains(&key) {
                pending.push(key);
            }
        }
        pending
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// Result of [`RtmLock::acquire`].
///
/// Resolves once: `Ok(())` when the lock is ours, or an error (usually
/// [`RtmError::Cancelled`]) when the wait was torn down.
#[derive(Debug)]
pub struct AcquireHandle {
    rx: Receiver<Result<()>>,
}

impl AcquireHandle {
    fn ready(result: Result<()>) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block until resolved.
    pub fn recv(&self) -> Result<()> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(RtmError::Cancelled("acquire abandoned".into())))
    }

    /// Block up to `timeout`. `None` if still pending.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(Err(RtmError::Cancelled("acquire abandoned".into())))
            }
        }
    }

    /// `None` if still pending.
    pub fn try_recv(&self) -> Option<Result<()>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(Err(RtmError::Cancelled("acquire abandoned".into())))
            }
        }
    }
}

fn apply_change(inner: &ClientInner, channel: &ChannelKey, response: Response) -> Result<()> {
    match response {
        Response::LockChanged { event } => {
            inner
                .registry
                .locks()
                .apply(&Scope::Channel(channel.clone()), event);
            Ok(())
        }
        other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
    }
}

fn acquire_request(channel: &ChannelKey, name: &str) -> Request {
    Request::AcquireLock {
        channel: channel.clone(),
        name: name.to_string(),
    }
}

/// Stop the server forwarding a lock's events once nobody waits for it.
fn unwatch_if_idle(inner: &ClientInner, channel: &ChannelKey, name: &str) {
    if inner.waiters.is_waiting(channel, name) {
        return;
    }
    let request = Request::UnwatchLock {
        channel: channel.clone(),
        name: name.to_string(),
    };
    if let Err(e) = inner.request(request) {
        debug!(%channel, lock = name, error = %e, "Unwatch failed");
    }
}

/// Retry the oldest waiter for a lock that was just freed.
pub(crate) fn retry_waiter(inner: &ClientInner, channel: &ChannelKey, name: &str) {
    let Some(id) = inner.waiters.first(channel, name) else {
        return;
    };
    match inner
        .request(acquire_request(channel, name))
        .and_then(|response| apply_change(inner, channel, response))
    {
        Ok(()) => {
            if inner.waiters.resolve(id, Ok(())) {
                info!(%channel, lock = name, "Pending acquire succeeded");
            }
            unwatch_if_idle(inner, channel, name);
        }
        Err(RtmError::LockHeldByOther { owner, .. }) => {
            debug!(%channel, lock = name, %owner, "Lock taken before retry");
        }
        Err(RtmError::ConnectionNotReady(state)) => {
            debug!(%channel, lock = name, %state, "Retry deferred until reconnect");
        }
        Err(e) => {
            warn!(%channel, lock = name, error = %e, "Pending acquire failed");
            inner.waiters.resolve(id, Err(e));
            unwatch_if_idle(inner, channel, name);
        }
    }
}

/// Retry every waiter; releases may have been missed while disconnected.
pub(crate) fn retry_all(inner: &ClientInner) {
    for (channel, name) in inner.waiters.pending() {
        retry_waiter(inner, &channel, &name);
    }
}

/// Lock operations. Obtained from [`RtmClient::lock`](crate::RtmClient::lock).
#[derive(Clone)]
pub struct RtmLock {
    inner: Arc<ClientInner>,
}

impl RtmLock {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Create a lock, or change its TTL.
    pub fn set(
        &self,
        channel: &str,
        channel_type: ChannelType,
        name: &str,
        ttl: u32,
    ) -> Result<()> {
        let key = ChannelKey::new(channel, channel_type);
        let response = self.inner.request(Request::SetLock {
            channel: key.clone(),
            name: name.to_string(),
            ttl,
        })?;
        apply_change(&self.inner, &key, response)
    }

    /// All lock definitions in a channel, sorted by name.
    pub fn get(&self, channel: &str, channel_type: ChannelType) -> Result<Vec<LockDetail>> {
        let key = ChannelKey::new(channel, channel_type);
        match self.inner.request(Request::GetLocks { channel: key })? {
            Response::Locks { locks } => {
                let mut details: Vec<LockDetail> = locks.into_values().collect();
                details.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(details)
            }
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub fn remove(&self, channel: &str, channel_type: ChannelType, name: &str) -> Result<()> {
        let key = ChannelKey::new(channel, channel_type);
        let response = self.inner.request(Request::RemoveLock {
            channel: key.clone(),
            name: name.to_string(),
        })?;
        apply_change(&self.inner, &key, response)
    }

    /// Take ownership of a lock.
    ///
    /// Without `retry`, contention fails with [`RtmError::LockHeldByOther`].
    /// With `retry`, the returned handle stays pending until the lock is
    /// freed and acquired, or the wait is cancelled by `release`,
    /// `unsubscribe`/`leave` of the channel, or `logout`.
    pub fn acquire(
        &self,
        channel: &str,
        channel_type: ChannelType,
        name: &str,
        retry: bool,
    ) -> Result<AcquireHandle> {
        let key = ChannelKey::new(channel, channel_type);
        if !retry {
            let response = self.inner.request(acquire_request(&key, name))?;
            apply_change(&self.inner, &key, response)?;
            return Ok(AcquireHandle::ready(Ok(())));
        }

        // Watch before the first attempt so no release slips through.
        let (id, rx) = self.inner.waiters.register(&key, name);
        let watch = Request::WatchLock {
            channel: key.clone(),
            name: name.to_string(),
        };
        if let Err(e) = self.inner.request(watch) {
            self.inner.waiters.resolve(id, Err(e.clone()));
            return Err(e);
        }

        match self
            .inner
            .request(acquire_request(&key, name))
            .and_then(|response| apply_change(&self.inner, &key, response))
        {
            Ok(()) => {
                self.inner.waiters.resolve(id, Ok(()));
                unwatch_if_idle(&self.inner, &key, name);
            }
            Err(RtmError::LockHeldByOther { owner, .. }) => {
                info!(channel = %key, lock = name, %owner, "Waiting for lock");
            }
            Err(e) => {
                self.inner.waiters.resolve(id, Err(e.clone()));
                unwatch_if_idle(&self.inner, &key, name);
                return Err(e);
            }
        }
        Ok(AcquireHandle { rx })
    }

    /// Give up ownership. Also cancels this client's pending acquires of
    /// the same lock.
    pub fn release(&self, channel: &str, channel_type: ChannelType, name: &str) -> Result<()> {
        let key = ChannelKey::new(channel, channel_type);
        if self.inner.waiters.cancel_lock(&key, name, "lock released") > 0 {
            unwatch_if_idle(&self.inner, &key, name);
        }
        let response = self.inner.request(Request::ReleaseLock {
            channel: key.clone(),
            name: name.to_string(),
        })?;
        apply_change(&self.inner, &key, response)
    }

    /// Force-release a lock held by `owner`.
    pub fn revoke(
        &self,
        channel: &str,
        channel_type: ChannelType,
        name: &str,
        owner: &str,
    ) -> Result<()> {
        let key = ChannelKey::new(channel, channel_type);
        let response = self.inner.request(Request::RevokeLock {
            channel: key.clone(),
            name: name.to_string(),
            owner: owner.to_string(),
        })?;
        apply_change(&self.inner, &key, response)
    }

    /// Current lock set of a lock-subscribed channel, and its event stream.
    pub fn lock_events(
        &self,
        channel: &str,
        channel_type: ChannelType,
    ) -> Result<(HashMap<String, LockDetail>, EventStream<LockEvent>)> {
        let scope = Scope::Channel(ChannelKey::new(channel, channel_type));
        let (snapshot, events) = self.inner.registry.locks().stream(&scope)?;
        Ok((snapshot.locks, events))
    }

    /// Number of retrying acquires still pending.
    pub fn pending_acquires(&self) -> usize {
        self.inner.waiters.len()
    }
}
