//! The client: login lifecycle, message channels and the event dispatcher.
//!
//! All inbound traffic goes through one dispatcher thread per login, which
//! `select!`s over the transport's state feed, its server event feed and a
//! shutdown channel. State changes drive stale-marking and resync; server
//! events are routed to the engine scope (or topic stream) they belong to.
//! Caller threads only issue requests and apply their own write results.

use crate::config::RtmConfig;
use crate::connection::ConnectionStateTracker;
use crate::error::{Result, RtmError};
use crate::gateway::{DropReason, EventStream};
use crate::lock::{self, LockWaiters, RtmLock};
use crate::options::{validate_custom_type, MessageOptions, PublishOptions};
use crate::presence::{PresenceCache, RtmPresence};
use crate::storage::RtmStorage;
use crate::stream::StreamChannel;
use crate::subscriptions::{Concerns, SubscriptionRegistry};
use crate::transport::{
    Credentials, RawStateChange, Request, Response, ServerErrorKind, ServerEvent, Transport,
};
use crate::types::{
    ChannelKey, ConnectionEvent, ConnectionState, LockEventKind, Message, Scope,
};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

struct Dispatcher {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

pub(crate) struct ClientInner {
    pub(crate) config: RtmConfig,
    transport: Arc<dyn Transport>,
    pub(crate) connection: ConnectionStateTracker,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) waiters: LockWaiters,
    pub(crate) presence_cache: PresenceCache,
    streams: Mutex<HashMap<String, StreamChannel>>,
    parameters: Mutex<serde_json::Map<String, serde_json::Value>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl ClientInner {
    /// Hand one request to the transport.
    ///
    /// Fails with [`RtmError::ConnectionNotReady`] without a round trip
    /// while DISCONNECTED or FAILED, and when the transport reports the
    /// session unreachable.
    pub(crate) fn request(&self, request: Request) -> Result<Response> {
        let state = self.connection.state();
        if !state.accepts_requests() {
            return Err(RtmError::ConnectionNotReady(state));
        }
        self.transport.request(request).map_err(|e| {
            if e.kind == ServerErrorKind::Disconnected {
                RtmError::ConnectionNotReady(self.connection.state())
            } else {
                RtmError::from(e)
            }
        })
    }

    fn credentials(&self, token: &str) -> Credentials {
        Credentials {
            app_id: self.config.app_id.clone(),
            user_id: self.config.user_id.clone(),
            token: token.to_string(),
            vendor_id: self.config.vendor_id,
            area_code: self.config.area_code,
            presence_timeout: self.config.presence_timeout,
            log_file_path: self.config.log_file_path.clone(),
            parameters: self.parameters.lock().clone(),
        }
    }

    fn stream(&self, name: &str) -> Option<StreamChannel> {
        self.streams.lock().get(name).cloned()
    }

    // --- Dispatch ---

    fn on_state(&self, raw: RawStateChange) {
        let Some(transition) = self.connection.apply(raw) else {
            return;
        };
        if transition.lost_continuity() {
            self.registry.mark_all_stale();
            debug!("Snapshots marked stale");
        }
        if transition.needs_resync() {
            self.resync();
        }
    }

    fn resync(&self) {
        let installed = self.registry.resync(|scope, kind| {
            let request = Request::FetchSnapshot {
                scope: scope.clone(),
                kind,
            };
            match self.request(request)? {
                Response::Snapshot { payload } => Ok(payload),
                other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
            }
        });
        info!(installed, "Resync pass complete");
        lock::retry_all(self);
    }

    /// Send presence state cached while a subscribe/join handshake that
    /// carried `sent` was in flight.
    pub(crate) fn settle_presence(&self, key: &ChannelKey, sent: &HashMap<String, String>) {
        self.presence_cache.settle(key, sent, |state| {
            match self.request(Request::SetState {
                channel: key.clone(),
                state,
            })? {
                Response::Ok => Ok(()),
                other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
            }
        });
    }

    fn on_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Message { channel, message } => {
                self.registry
                    .deliver_message(&ChannelKey::message(channel), message);
            }
            ServerEvent::TopicMessage {
                channel,
                topic,
                message,
            } => match self.stream(&channel) {
                Some(stream) => {
                    stream.deliver(&topic, message);
                }
                None => debug!(%channel, %topic, "Topic message for unknown channel"),
            },
            ServerEvent::Storage { scope, event } => {
                self.registry.storage().apply(&scope, event);
            }
            ServerEvent::Lock { channel, event } => {
                let freed = matches!(
                    event.kind,
                    LockEventKind::Released | LockEventKind::Expired | LockEventKind::Removed
                );
                let names: Vec<String> = event.details.iter().map(|d| d.name.clone()).collect();
                self.registry
                    .locks()
                    .apply(&Scope::Channel(channel.clone()), event);
                if freed {
                    for name in names {
                        lock::retry_waiter(self, &channel, &name);
                    }
                }
            }
            ServerEvent::Presence { channel, event } => {
                self.registry.presence().apply(&Scope::Channel(channel), event);
            }
            ServerEvent::Topic { channel, event } => {
                let scope = Scope::Channel(ChannelKey::stream(channel));
                self.registry.topics().apply(&scope, event);
            }
            ServerEvent::Notice { channel, notice } => {
                if let Some(stream) = self.stream(&channel) {
                    stream.deliver_notice(notice);
                }
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // May run on the dispatcher thread itself, so signal without joining.
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            let _ = self.transport.request(Request::Logout);
            let _ = dispatcher.shutdown.send(());
        }
    }
}

fn run_dispatcher(
    inner: Weak<ClientInner>,
    states: Receiver<RawStateChange>,
    events: Receiver<ServerEvent>,
    shutdown: Receiver<()>,
) {
    debug!("Dispatcher started");
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(states) -> raw => {
                let Ok(raw) = raw else {
                    debug!("State feed closed");
                    break;
                };
                let Some(inner) = inner.upgrade() else { break };
                inner.on_state(raw);
            }
            recv(events) -> event => {
                let Ok(event) = event else {
                    debug!("Event feed closed");
                    break;
                };
                let Some(inner) = inner.upgrade() else { break };
                inner.on_event(event);
            }
        }
    }
    debug!("Dispatcher stopped");
}

/// A realtime messaging client.
///
/// Cheap to clone; clones share one session.
///
/// ```ignore
/// let client = RtmClient::new(RtmConfig::new("app", "alice"), transport)?;
/// let states = client.login("token")?;
/// let messages = client.subscribe("room", MessageOptions::default())?;
/// for delivery in messages.iter() {
///     // ...
/// }
/// ```
#[derive(Clone)]
pub struct RtmClient {
    inner: Arc<ClientInner>,
}

impl RtmClient {
    pub fn new(config: RtmConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let buffer = config.event_buffer;
        let policy = config.overflow_policy;
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                connection: ConnectionStateTracker::new(buffer, policy),
                registry: SubscriptionRegistry::new(buffer, policy),
                waiters: LockWaiters::default(),
                presence_cache: PresenceCache::default(),
                streams: Mutex::new(HashMap::new()),
                parameters: Mutex::new(serde_json::Map::new()),
                dispatcher: Mutex::new(None),
            }),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.inner.config.user_id
    }

    pub fn config(&self) -> &RtmConfig {
        &self.inner.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Open the session and wait for CONNECTED.
    ///
    /// Returns the stream of connection state changes for this session; it
    /// closes on logout.
    pub fn login(&self, token: &str) -> Result<EventStream<ConnectionEvent>> {
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            return Err(RtmError::AlreadyLoggedIn);
        }

        let stream = self.inner.connection.open();
        let states = match self.inner.transport.connect(&self.inner.credentials(token)) {
            Ok(states) => states,
            Err(e) => {
                self.inner.connection.close();
                return Err(e.into());
            }
        };

        if let Err(e) = self.await_connected(&states) {
            warn!(error = %e, "Login failed");
            if let Err(e) = self.inner.transport.request(Request::Logout) {
                debug!(error = %e, "Teardown after failed login");
            }
            self.inner.connection.close();
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let weak = Arc::downgrade(&self.inner);
        let events = self.inner.transport.server_events();
        let spawned = thread::Builder::new()
            .name("rtm-dispatch".into())
            .spawn(move || run_dispatcher(weak, states, events, shutdown_rx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.inner.transport.request(Request::Logout);
                self.inner.connection.close();
                return Err(RtmError::Server {
                    code: -1,
                    message: format!("dispatcher thread: {}", e),
                });
            }
        };
        *dispatcher = Some(Dispatcher {
            shutdown: shutdown_tx,
            handle,
        });
        info!(user = %self.inner.config.user_id, "Logged in");
        Ok(stream)
    }

    fn await_connected(&self, states: &Receiver<RawStateChange>) -> Result<()> {
        let deadline = Instant::now() + self.inner.config.login_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match states.recv_timeout(remaining) {
                Ok(raw) => {
                    let Some(transition) = self.inner.connection.apply(raw) else {
                        continue;
                    };
                    match transition.to {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Failed | ConnectionState::Disconnected => {
                            return Err(RtmError::ConnectionNotReady(transition.to));
                        }
                        _ => {}
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(RtmError::ConnectionNotReady(self.inner.connection.state()));
                }
            }
        }
    }

    /// End the session. Every subscription, stream channel and pending
    /// acquire is torn down and its streams closed. A no-op when not
    /// logged in.
    pub fn logout(&self) -> Result<()> {
        let Some(dispatcher) = self.inner.dispatcher.lock().take() else {
            return Ok(());
        };
        // Straight to the transport: a FAILED session still has to be torn down.
        if let Err(e) = self.inner.transport.request(Request::Logout) {
            warn!(error = %e, "Server-side logout failed");
        }
        let _ = dispatcher.shutdown.send(());
        if dispatcher.handle.join().is_err() {
            warn!("Dispatcher thread panicked");
        }

        let cancelled = self.inner.waiters.cancel_all("logged out");
        self.inner.registry.clear(DropReason::LoggedOut);
        let streams: Vec<StreamChannel> =
            self.inner.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in &streams {
            stream.close(DropReason::LoggedOut);
        }
        self.inner.presence_cache.clear();
        self.inner.connection.close();
        info!(cancelled, streams = streams.len(), "Logged out");
        Ok(())
    }

    pub fn renew_token(&self, token: &str) -> Result<()> {
        let request = Request::RenewToken {
            token: token.to_string(),
        };
        match self.inner.request(request)? {
            Response::Ok => Ok(()),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Merge runtime parameters. Forwarded right away when logged in, sent
    /// with the next login otherwise.
    pub fn set_parameters(
        &self,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.inner.parameters.lock().extend(parameters.clone());
        if self.inner.dispatcher.lock().is_none() {
            return Ok(());
        }
        match self.inner.request(Request::SetParameters { parameters })? {
            Response::Ok => Ok(()),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub fn parameters(&self) -> serde_json::Map<String, serde_json::Value> {
        self.inner.parameters.lock().clone()
    }

    pub fn storage(&self) -> RtmStorage {
        RtmStorage::new(Arc::clone(&self.inner))
    }

    pub fn lock(&self) -> RtmLock {
        RtmLock::new(Arc::clone(&self.inner))
    }

    pub fn presence(&self) -> RtmPresence {
        RtmPresence::new(Arc::clone(&self.inner))
    }

    // --- Message channels ---

    /// Publish to a message channel. Needs no subscription.
    pub fn publish(
        &self,
        channel: &str,
        payload: impl Into<Vec<u8>>,
        opts: PublishOptions,
    ) -> Result<()> {
        validate_custom_type(opts.custom_type.as_deref())?;
        let request = Request::Publish {
            channel: channel.to_string(),
            payload: payload.into(),
            message_type: opts.message_type,
            custom_type: opts.custom_type,
        };
        match self.inner.request(request)? {
            Response::Ok => Ok(()),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Subscribe to a message channel.
    ///
    /// Returns the channel's message stream. Metadata, presence and lock
    /// streams for the channel are reached through [`storage`](Self::storage),
    /// [`presence`](Self::presence) and [`lock`](Self::lock). A second
    /// subscribe of the same channel fails with
    /// [`RtmError::AlreadySubscribed`].
    pub fn subscribe(&self, channel: &str, opts: MessageOptions) -> Result<EventStream<Message>> {
        if channel.is_empty() {
            return Err(RtmError::InvalidArgument("channel name is empty".into()));
        }
        let key = ChannelKey::message(channel);
        let concerns = Concerns::from(&opts);
        let messages = self.inner.registry.reserve(&key, concerns)?;

        let state = self.inner.presence_cache.pending(&key);
        let request = Request::Subscribe {
            channel: channel.to_string(),
            concerns,
            state: state.clone(),
        };
        match self.inner.request(request) {
            Ok(Response::Subscribed { snapshots }) => {
                self.inner.registry.activate(&key, snapshots);
                self.inner.settle_presence(&key, &state);
            }
            Ok(other) => {
                self.inner.registry.remove(&key, DropReason::Unsubscribed);
                return Err(RtmError::UnexpectedResponse(format!("{:?}", other)));
            }
            Err(e) => {
                self.inner.registry.remove(&key, DropReason::Unsubscribed);
                return Err(e);
            }
        }
        messages.ok_or_else(|| RtmError::UnexpectedResponse("no message stream".into()))
    }

    /// Drop a message channel subscription and every stream it owns.
    pub fn unsubscribe(&self, channel: &str) -> Result<()> {
        let key = ChannelKey::message(channel);
        if self
            .inner
            .registry
            .remove(&key, DropReason::Unsubscribed)
            .is_none()
        {
            return Err(RtmError::NotSubscribed(key.to_string()));
        }
        let cancelled = self.inner.waiters.cancel_channel(&key, "channel unsubscribed");
        let request = Request::Unsubscribe {
            channel: channel.to_string(),
        };
        if let Err(e) = self.inner.request(request) {
            warn!(channel = %key, error = %e, "Server-side unsubscribe failed");
        }
        info!(channel = %key, cancelled, "Unsubscribed");
        Ok(())
    }

    /// The stream channel with this name. Same name, same instance, until
    /// logout.
    pub fn stream_channel(&self, name: &str) -> Result<StreamChannel> {
        if name.is_empty() {
            return Err(RtmError::InvalidArgument("channel name is empty".into()));
        }
        let mut streams = self.inner.streams.lock();
        let stream = streams
            .entry(name.to_string())
            .or_insert_with(|| StreamChannel::new(name, Arc::downgrade(&self.inner)));
        Ok(stream.clone())
    }

    /// Number of live channel and user-metadata subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.subscription_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryServer;

    fn client(server: &MemoryServer, user: &str) -> RtmClient {
        RtmClient::new(RtmConfig::new("app", user), Arc::new(server.transport())).unwrap()
    }

    #[test]
    fn test_login_twice_fails() {
        let server = MemoryServer::new();
        let client = client(&server, "alice");
        client.login("token").unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert!(matches!(client.login("token"), Err(RtmError::AlreadyLoggedIn)));
        client.logout().unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        client.logout().unwrap();
    }

    #[test]
    fn test_requests_need_login() {
        let server = MemoryServer::new();
        let client = client(&server, "alice");
        assert!(matches!(
            client.publish("room", "hi", PublishOptions::default()),
            Err(RtmError::ConnectionNotReady(ConnectionState::Disconnected))
        ));
        assert!(matches!(
            client.subscribe("room", MessageOptions::default()),
            Err(RtmError::ConnectionNotReady(_))
        ));
        // The failed subscribe left nothing behind.
        assert_eq!(client.subscription_count(), 0);
    }

    #[test]
    fn test_stream_channel_identity() {
        let server = MemoryServer::new();
        let client = client(&server, "alice");
        let a = client.stream_channel("video").unwrap();
        let b = client.stream_channel("video").unwrap();
        let c = client.stream_channel("audio").unwrap();
        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
        assert!(client.stream_channel("").is_err());
    }

    #[test]
    fn test_parameters_merge_before_login() {
        let server = MemoryServer::new();
        let client = client(&server, "alice");
        let mut params = serde_json::Map::new();
        params.insert("rtm.log_level".into(), serde_json::json!(2));
        client.set_parameters(params).unwrap();
        assert_eq!(client.parameters()["rtm.log_level"], serde_json::json!(2));
    }
}
