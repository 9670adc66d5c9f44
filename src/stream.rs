//! Stream channels and their topics.
//!
//! A [`StreamChannel`] is fetched by name from
//! [`RtmClient::stream_channel`](crate::RtmClient::stream_channel); repeated
//! lookups return the same instance until logout. Joining yields the topic
//! graph (topic -> joined publishers) as a snapshot plus event stream, and
//! a stream of out-of-band notices. Messages are delivered per topic on the
//! stream returned by [`StreamChannel::subscribe_topic`]; that stream stays
//! open when its user set becomes empty and only closes on leave or logout.

use crate::client::ClientInner;
use crate::error::{Result, RtmError};
use crate::gateway::{self, DropReason, EventSender, EventStream};
use crate::options::{validate_custom_type, JoinOptions, TopicOptions, TopicPublishOptions};
use crate::state::graph_to_lists;
use crate::subscriptions::Concerns;
use crate::transport::{Request, Response};
use crate::types::{ChannelKey, Message, Scope, SubscribedUsers, TopicEvent};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// What [`StreamChannel::join`] hands back.
pub struct StreamJoin {
    /// topic -> publishers joined to it, at join time.
    pub topics: HashMap<String, Vec<String>>,
    /// Topic graph changes; opens with a snapshot event.
    pub topic_events: EventStream<TopicEvent>,
    pub notices: EventStream<String>,
}

struct TopicSubscription {
    users: SubscribedUsers,
    sink: EventSender<Message>,
    stream: EventStream<Message>,
}

#[derive(Default)]
struct StreamState {
    joined: bool,
    notices: Option<EventSender<String>>,
    /// Topics this client publishes to, with their join options.
    publishing: HashMap<String, TopicOptions>,
    subscriptions: HashMap<String, TopicSubscription>,
}

struct StreamShared {
    name: String,
    client: Weak<ClientInner>,
    state: Mutex<StreamState>,
}

/// One stream channel. Clones share the same instance.
#[derive(Clone)]
pub struct StreamChannel {
    shared: Arc<StreamShared>,
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("name", &self.shared.name)
            .field("joined", &self.is_joined())
            .finish()
    }
}

impl StreamChannel {
    pub(crate) fn new(name: &str, client: Weak<ClientInner>) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                name: name.to_string(),
                client,
                state: Mutex::new(StreamState::default()),
            }),
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_joined(&self) -> bool {
        self.shared.state.lock().joined
    }

    /// True if both handles are the same cached instance.
    pub fn same_instance(&self, other: &StreamChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn key(&self) -> ChannelKey {
        ChannelKey::stream(self.shared.name.clone())
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        self.shared
            .client
            .upgrade()
            .ok_or_else(|| RtmError::Cancelled("client dropped".into()))
    }

    fn require_joined(&self) -> Result<()> {
        if self.is_joined() {
            Ok(())
        } else {
            Err(RtmError::NotJoined(self.shared.name.clone()))
        }
    }

    fn expect_ok(response: Response) -> Result<()> {
        match response {
            Response::Ok => Ok(()),
            other => Err(RtmError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    pub fn join(&self, opts: JoinOptions) -> Result<StreamJoin> {
        let client = self.client()?;
        let key = self.key();
        let concerns = Concerns::from(&opts);
        client.registry.reserve(&key, concerns)?;

        // Notices may arrive before the join reply does.
        let (notice_sink, notices) = gateway::channel(
            format!("notice/{}", self.shared.name),
            client.config.event_buffer,
            client.config.overflow_policy,
        );
        self.shared.state.lock().notices = Some(notice_sink);

        let state = client.presence_cache.pending(&key);
        let request = Request::JoinStream {
            channel: self.shared.name.clone(),
            token: opts.token.clone(),
            concerns,
            state: state.clone(),
        };
        let snapshots = match client.request(request) {
            Ok(Response::Subscribed { snapshots }) => snapshots,
            Ok(other) => {
                self.abandon_join(&client, &key);
                return Err(RtmError::UnexpectedResponse(format!("{:?}", other)));
            }
            Err(e) => {
                self.abandon_join(&client, &key);
                return Err(e);
            }
        };
        client.registry.activate(&key, snapshots);
        client.settle_presence(&key, &state);
        let (graph, topic_events) = client.registry.topics().stream(&Scope::Channel(key))?;
        self.shared.state.lock().joined = true;
        info!(channel = %self.shared.name, %concerns, "Stream channel joined");
        Ok(StreamJoin {
            topics: graph_to_lists(&graph),
            topic_events,
            notices,
        })
    }

    fn abandon_join(&self, client: &ClientInner, key: &ChannelKey) {
        client.registry.remove(key, DropReason::Unsubscribed);
        if let Some(notices) = self.shared.state.lock().notices.take() {
            notices.close(DropReason::Unsubscribed);
        }
    }

    pub fn leave(&self) -> Result<()> {
        let client = self.client()?;
        let key = self.key();
        if client.registry.remove(&key, DropReason::Left).is_none() {
            return Err(RtmError::NotJoined(self.shared.name.clone()));
        }
        client.waiters.cancel_channel(&key, "stream channel left");
        self.close(DropReason::Left);

        let request = Request::LeaveStream {
            channel: self.shared.name.clone(),
        };
        if let Err(e) = client.request(request) {
            warn!(channel = %self.shared.name, error = %e, "Server-side leave failed");
        }
        info!(channel = %self.shared.name, "Stream channel left");
        Ok(())
    }

    /// Drop local join state and close every stream this channel owns.
    pub(crate) fn close(&self, reason: DropReason) {
        let mut state = self.shared.state.lock();
        state.joined = false;
        state.publishing.clear();
        if let Some(notices) = state.notices.take() {
            notices.close(reason);
        }
        for (_, subscription) in state.subscriptions.drain() {
            subscription.sink.close(reason);
        }
    }

    pub fn renew_token(&self, token: &str) -> Result<()> {
        self.require_joined()?;
        let client = self.client()?;
        Self::expect_ok(client.request(Request::RenewStreamToken {
            channel: self.shared.name.clone(),
            token: token.to_string(),
        })?)
    }

    /// Become a publisher on a topic.
    pub fn join_topic(&self, topic: &str, opts: TopicOptions) -> Result<()> {
        self.require_joined()?;
        let client = self.client()?;
        Self::expect_ok(client.request(Request::JoinTopic {
            channel: self.shared.name.clone(),
            topic: topic.to_string(),
            qos: opts.qos,
            priority: opts.priority,
            meta: opts.meta.clone(),
            sync_media: opts.sync_media,
        })?)?;
        self.shared
            .state
            .lock()
            .publishing
            .insert(topic.to_string(), opts);
        debug!(channel = %self.shared.name, topic, "Topic joined");
        Ok(())
    }

    fn topic_options(&self, topic: &str) -> Result<TopicOptions> {
        self.shared
            .state
            .lock()
            .publishing
            .get(topic)
            .cloned()
            .ok_or_else(|| RtmError::TopicNotJoined {
                channel: self.shared.name.clone(),
                topic: topic.to_string(),
            })
    }

    /// Publish on a joined topic with the QoS and priority it was joined
    /// with. `send_ts` is only sent for topics joined with `sync_media`.
    pub fn publish_topic(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        opts: TopicPublishOptions,
    ) -> Result<()> {
        self.require_joined()?;
        let joined = self.topic_options(topic)?;
        validate_custom_type(opts.custom_type.as_deref())?;
        let client = self.client()?;
        let send_ts = if joined.sync_media { opts.send_ts } else { 0 };
        Self::expect_ok(client.request(Request::PublishTopic {
            channel: self.shared.name.clone(),
            topic: topic.to_string(),
            payload: payload.into(),
            message_type: opts.message_type,
            custom_type: opts.custom_type,
            qos: joined.qos,
            priority: joined.priority,
            send_ts,
        })?)
    }

    pub fn leave_topic(&self, topic: &str) -> Result<()> {
        self.require_joined()?;
        self.topic_options(topic)?;
        let client = self.client()?;
        Self::expect_ok(client.request(Request::LeaveTopic {
            channel: self.shared.name.clone(),
            topic: topic.to_string(),
        })?)?;
        self.shared.state.lock().publishing.remove(topic);
        debug!(channel = %self.shared.name, topic, "Topic left");
        Ok(())
    }

    /// Receive messages from publishers on a topic. An empty list means
    /// every current and future publisher.
    ///
    /// Repeated calls widen the user set and return the same stream.
    pub fn subscribe_topic(&self, topic: &str, users: &[&str]) -> Result<EventStream<Message>> {
        self.require_joined()?;
        let client = self.client()?;
        let requested = if users.is_empty() {
            SubscribedUsers::All
        } else {
            SubscribedUsers::Users(users.iter().map(|u| u.to_string()).collect())
        };
        Self::expect_ok(client.request(Request::SubscribeTopic {
            channel: self.shared.name.clone(),
            topic: topic.to_string(),
            users: requested.clone(),
        })?)?;

        let mut state = self.shared.state.lock();
        if let Some(subscription) = state.subscriptions.get_mut(topic) {
            match (&mut subscription.users, requested) {
                (current, SubscribedUsers::All) => *current = SubscribedUsers::All,
                (SubscribedUsers::Users(current), SubscribedUsers::Users(added)) => {
                    current.extend(added)
                }
                (SubscribedUsers::All, SubscribedUsers::Users(_)) => {}
            }
            return Ok(subscription.stream.clone());
        }
        let (sink, stream) = gateway::channel(
            format!("topic/{}/{}", self.shared.name, topic),
            client.config.event_buffer,
            client.config.overflow_policy,
        );
        state.subscriptions.insert(
            topic.to_string(),
            TopicSubscription {
                users: requested,
                sink,
                stream: stream.clone(),
            },
        );
        debug!(channel = %self.shared.name, topic, "Topic subscribed");
        Ok(stream)
    }

    /// Stop receiving from the given publishers; an empty list stops all.
    ///
    /// The topic's stream stays open. Removing ids from an `All`
    /// subscription leaves it at `All`.
    pub fn unsubscribe_topic(&self, topic: &str, users: &[&str]) -> Result<()> {
        self.require_joined()?;
        if !self.shared.state.lock().subscriptions.contains_key(topic) {
            return Err(RtmError::NotSubscribed(format!(
                "{}/{}",
                self.shared.name, topic
            )));
        }
        let client = self.client()?;
        let users: Vec<String> = users.iter().map(|u| u.to_string()).collect();
        Self::expect_ok(client.request(Request::UnsubscribeTopic {
            channel: self.shared.name.clone(),
            topic: topic.to_string(),
            users: users.clone(),
        })?)?;

        let mut state = self.shared.state.lock();
        if let Some(subscription) = state.subscriptions.get_mut(topic) {
            if users.is_empty() {
                subscription.users = SubscribedUsers::Users(BTreeSet::new());
            } else if let SubscribedUsers::Users(current) = &mut subscription.users {
                for user in &users {
                    current.remove(user);
                }
            }
        }
        Ok(())
    }

    /// Publishers a topic subscription currently listens to.
    pub fn subscribed_users(&self, topic: &str) -> Result<SubscribedUsers> {
        self.require_joined()?;
        self.shared
            .state
            .lock()
            .subscriptions
            .get(topic)
            .map(|s| s.users.clone())
            .ok_or_else(|| RtmError::NotSubscribed(format!("{}/{}", self.shared.name, topic)))
    }

    pub(crate) fn deliver(&self, topic: &str, message: Message) -> bool {
        let state = self.shared.state.lock();
        match state.subscriptions.get(topic) {
            Some(subscription) if subscription.users.includes(&message.user_id) => {
                subscription.sink.send(message);
                true
            }
            _ => {
                debug!(channel = %self.shared.name, topic, "Topic message dropped");
                false
            }
        }
    }

    pub(crate) fn deliver_notice(&self, notice: String) -> bool {
        match self.shared.state.lock().notices.as_ref() {
            Some(notices) => {
                notices.send(notice);
                true
            }
            None => false,
        }
    }
}
