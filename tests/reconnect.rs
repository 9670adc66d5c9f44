//! Connection state and resync tests.

use rtm_sync::{
    ChannelKey, ChannelType, ConnectionChangeReason, ConnectionEvent, ConnectionState, Delivery,
    EventStream, JoinOptions, LockEventKind, MemoryServer, MemoryTransport, MessageOptions,
    MetadataItem, PresenceEvent, PublishOptions, RtmClient, RtmConfig, RtmError,
    StorageEventKind, StorageOptions, TopicEvent, TopicOptions,
};
use rtm_sync::transport::RawStateChange;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Session {
    client: RtmClient,
    transport: Arc<MemoryTransport>,
    states: EventStream<ConnectionEvent>,
}

fn login(server: &MemoryServer, user: &str) -> Session {
    let transport = Arc::new(server.transport());
    let client = RtmClient::new(RtmConfig::new("app", user), transport.clone()).unwrap();
    let states = client.login("token").unwrap();
    Session {
        client,
        transport,
        states,
    }
}

fn next<T: Debug>(stream: &EventStream<T>) -> T {
    match stream.recv_timeout(WAIT).unwrap() {
        Delivery::Event(event) => event,
        other => panic!("unexpected delivery: {:?}", other),
    }
}

fn wait_for_state(session: &Session, state: ConnectionState) {
    loop {
        if next(&session.states).state == state {
            return;
        }
    }
}

fn set(client: &RtmClient, key: &str, value: &str) {
    client
        .storage()
        .set_channel_metadata(
            "room",
            ChannelType::Message,
            vec![MetadataItem::new(key, value)],
            &StorageOptions::default(),
        )
        .unwrap();
}

#[test]
fn test_login_reports_connecting_then_connected() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");

    let events: Vec<ConnectionEvent> = vec![next(&alice.states), next(&alice.states)];
    assert_eq!(events[0].state, ConnectionState::Connecting);
    assert_eq!(events[1].state, ConnectionState::Connected);
    assert_eq!(events[1].reason, ConnectionChangeReason::LoginSuccess);

    alice.client.logout().unwrap();
    let last = next(&alice.states);
    assert_eq!(last.state, ConnectionState::Disconnected);
    assert!(alice.states.recv_timeout(QUIET).is_err());
}

#[test]
fn test_unknown_state_code_ignored() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    wait_for_state(&alice, ConnectionState::Connected);

    alice.transport.push_raw(RawStateChange {
        state: 42,
        reason: 0,
    });
    alice.transport.push_state(
        ConnectionState::Connected,
        ConnectionChangeReason::RenewToken,
    );
    let event = next(&alice.states);
    assert_eq!(event.state, ConnectionState::Connected);
    assert_eq!(event.reason, ConnectionChangeReason::RenewToken);
    assert_eq!(alice.client.connection_state(), ConnectionState::Connected);
}

#[test]
fn test_resync_emits_latest_snapshot_once() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    alice
        .client
        .subscribe("room", MessageOptions::default().with_metadata(true))
        .unwrap();
    let (_, events) = alice
        .client
        .storage()
        .channel_metadata_events("room", ChannelType::Message)
        .unwrap();
    assert_eq!(next(&events).kind, StorageEventKind::Snapshot);
    set(&bob.client, "k", "v1");
    assert_eq!(next(&events).major_revision, 1);

    alice.transport.interrupt();
    wait_for_state(&alice, ConnectionState::Reconnecting);
    assert!(matches!(
        alice.client.publish("room", "hi", PublishOptions::default()),
        Err(RtmError::ConnectionNotReady(ConnectionState::Reconnecting))
    ));

    set(&bob.client, "k", "v2");
    set(&bob.client, "other", "x");

    alice.transport.restore();
    let snapshot = next(&events);
    assert_eq!(snapshot.kind, StorageEventKind::Snapshot);
    assert_eq!(snapshot.major_revision, 3);
    assert_eq!(snapshot.items["k"].value, "v2");
    assert!(snapshot.items.contains_key("other"));
    assert!(events.recv_timeout(QUIET).is_err());

    // Live deltas resume on top of the new baseline.
    set(&bob.client, "k", "v3");
    let delta = next(&events);
    assert_eq!(delta.kind, StorageEventKind::Set);
    assert_eq!(delta.major_revision, 4);
}

#[test]
fn test_disconnect_then_connect_resyncs() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    alice
        .client
        .subscribe("room", MessageOptions::default().with_metadata(true))
        .unwrap();
    let (_, events) = alice
        .client
        .storage()
        .channel_metadata_events("room", ChannelType::Message)
        .unwrap();
    assert_eq!(next(&events).kind, StorageEventKind::Snapshot);

    // No RECONNECTING on the way down or back up.
    alice
        .transport
        .interrupt_as(ConnectionState::Disconnected, ConnectionChangeReason::Lost);
    wait_for_state(&alice, ConnectionState::Disconnected);
    set(&bob.client, "k", "v1");
    set(&bob.client, "k", "v2");
    alice
        .transport
        .push_state(ConnectionState::Connecting, ConnectionChangeReason::Connecting);
    alice.transport.restore();
    wait_for_state(&alice, ConnectionState::Connected);

    let snapshot = next(&events);
    assert_eq!(snapshot.kind, StorageEventKind::Snapshot);
    assert_eq!(snapshot.major_revision, 2);
    assert_eq!(snapshot.items["k"].value, "v2");
    assert!(events.recv_timeout(QUIET).is_err());

    set(&bob.client, "k", "v3");
    assert_eq!(next(&events).major_revision, 3);
}

#[test]
fn test_presence_resync_after_reconnect() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    alice
        .client
        .subscribe("room", MessageOptions::default())
        .unwrap();
    let (_, events) = alice
        .client
        .presence()
        .presence_events("room", ChannelType::Message)
        .unwrap();
    assert!(matches!(next(&events), PresenceEvent::Snapshot { .. }));

    alice.transport.interrupt();
    wait_for_state(&alice, ConnectionState::Reconnecting);
    bob.client
        .subscribe("room", MessageOptions::default())
        .unwrap();
    alice.transport.restore();

    match next(&events) {
        PresenceEvent::Snapshot { states } => assert!(states.contains_key("bob")),
        other => panic!("expected snapshot, got {:?}", other),
    }
    assert!(events.recv_timeout(QUIET).is_err());
}

#[test]
fn test_topic_graph_resync_after_reconnect() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    let video = alice.client.stream_channel("video").unwrap();
    let joined = video.join(JoinOptions::default()).unwrap();
    assert!(matches!(
        next(&joined.topic_events),
        TopicEvent::Snapshot { .. }
    ));

    alice.transport.interrupt();
    wait_for_state(&alice, ConnectionState::Reconnecting);
    let bob_video = bob.client.stream_channel("video").unwrap();
    bob_video.join(JoinOptions::default()).unwrap();
    bob_video.join_topic("cam", TopicOptions::default()).unwrap();
    alice.transport.restore();

    match next(&joined.topic_events) {
        TopicEvent::Snapshot { topics, .. } => assert_eq!(topics["cam"], vec!["bob"]),
        other => panic!("expected snapshot, got {:?}", other),
    }
    assert!(joined.topic_events.recv_timeout(QUIET).is_err());
}

#[test]
fn test_resync_without_missed_changes_is_silent() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");

    alice
        .client
        .subscribe("room", MessageOptions::default().with_lock(true))
        .unwrap();
    let (_, events) = alice
        .client
        .lock()
        .lock_events("room", ChannelType::Message)
        .unwrap();
    assert_eq!(next(&events).kind, LockEventKind::Snapshot);

    alice.transport.interrupt();
    wait_for_state(&alice, ConnectionState::Reconnecting);
    alice.transport.restore();
    wait_for_state(&alice, ConnectionState::Connected);

    // The refetched baseline is announced even when nothing changed.
    let snapshot = next(&events);
    assert_eq!(snapshot.kind, LockEventKind::Snapshot);
    assert!(snapshot.details.is_empty());
    assert!(events.recv_timeout(QUIET).is_err());
}

#[test]
fn test_pending_acquire_retried_after_reconnect() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");
    let key = ChannelKey::message("room");

    alice
        .client
        .lock()
        .set("room", ChannelType::Message, "L", 10)
        .unwrap();
    alice
        .client
        .lock()
        .acquire("room", ChannelType::Message, "L", false)
        .unwrap()
        .recv()
        .unwrap();
    let waiting = bob
        .client
        .lock()
        .acquire("room", ChannelType::Message, "L", true)
        .unwrap();

    // Bob misses the release while offline.
    bob.transport.interrupt();
    wait_for_state(&bob, ConnectionState::Reconnecting);
    alice
        .client
        .lock()
        .release("room", ChannelType::Message, "L")
        .unwrap();
    assert!(waiting.recv_timeout(QUIET).is_none());

    bob.transport.restore();
    assert_eq!(waiting.recv_timeout(WAIT), Some(Ok(())));
    assert_eq!(server.locks(&key)["L"].owner, "bob");
}

#[test]
fn test_failed_state_is_terminal() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    wait_for_state(&alice, ConnectionState::Connected);

    alice
        .transport
        .push_state(ConnectionState::Failed, ConnectionChangeReason::BannedByServer);
    wait_for_state(&alice, ConnectionState::Failed);
    alice.transport.restore();
    assert!(alice.states.recv_timeout(QUIET).is_err());
    assert_eq!(alice.client.connection_state(), ConnectionState::Failed);
    assert!(matches!(
        alice.client.subscribe("room", MessageOptions::default()),
        Err(RtmError::ConnectionNotReady(ConnectionState::Failed))
    ));

    // Logging out and back in recovers.
    alice.client.logout().unwrap();
    alice.client.login("token").unwrap();
    assert_eq!(alice.client.connection_state(), ConnectionState::Connected);
}
