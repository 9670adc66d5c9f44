//! Integration tests for the sync engine against the in-memory server.

use rtm_sync::{
    ChannelKey, ChannelType, Delivery, EventStream, JoinOptions, LockEventKind, MemoryServer,
    MessageOptions, MetadataItem, PresenceEvent, PresenceOptions, PublishOptions, RtmClient,
    RtmConfig, RtmError, StorageEvent, StorageEventKind, StorageOptions, SubscribedUsers,
    TopicEvent, TopicOptions, TopicPublishOptions,
};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn login(server: &MemoryServer, user: &str) -> RtmClient {
    let client =
        RtmClient::new(RtmConfig::new("app", user), Arc::new(server.transport())).unwrap();
    client.login("token").unwrap();
    client
}

fn next<T: Debug>(stream: &EventStream<T>) -> T {
    match stream.recv_timeout(WAIT).unwrap() {
        Delivery::Event(event) => event,
        other => panic!("unexpected delivery: {:?}", other),
    }
}

fn assert_quiet<T: Debug>(stream: &EventStream<T>) {
    if let Ok(delivery) = stream.recv_timeout(QUIET) {
        panic!("unexpected delivery: {:?}", delivery);
    }
}

fn items(pairs: &[(&str, &str)]) -> Vec<MetadataItem> {
    pairs.iter().map(|(k, v)| MetadataItem::new(*k, *v)).collect()
}

fn state(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn metadata_opts() -> MessageOptions {
    MessageOptions::default().with_metadata(true)
}

// --- Message Channels ---

#[test]
fn test_message_fanout() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    let messages = bob.subscribe("room", MessageOptions::default()).unwrap();
    alice
        .publish("room", "hello", PublishOptions::default().with_custom_type("chat"))
        .unwrap();

    let message = next(&messages);
    assert_eq!(message.user_id, "alice");
    assert_eq!(message.payload, b"hello");
    assert_eq!(message.custom_type.as_deref(), Some("chat"));

    bob.unsubscribe("room").unwrap();
    assert!(messages.drain().is_empty());
    assert!(messages.drop_reason().is_some());
}

#[test]
fn test_oversized_custom_type_rejected() {
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let long = "x".repeat(64);
    assert!(matches!(
        alice.publish("room", "hi", PublishOptions::default().with_custom_type(long)),
        Err(RtmError::InvalidArgument(_))
    ));
}

// --- Storage ---

#[test]
fn test_metadata_stream_opens_with_snapshot() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    for i in 0..3 {
        let value = i.to_string();
        bob.storage()
            .set_channel_metadata(
                "room",
                ChannelType::Message,
                items(&[("k", value.as_str())]),
                &StorageOptions::default(),
            )
            .unwrap();
    }

    alice.subscribe("room", metadata_opts()).unwrap();
    let (snapshot, events) = alice
        .storage()
        .channel_metadata_events("room", ChannelType::Message)
        .unwrap();
    assert_eq!(snapshot.major_revision, 3);

    let first = next(&events);
    assert_eq!(first.kind, StorageEventKind::Snapshot);
    assert_eq!(first.major_revision, 3);
    assert_eq!(first.items["k"].value, "2");
    assert_quiet(&events);
}

#[test]
fn test_own_write_delivered_once() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");
    alice.subscribe("room", metadata_opts()).unwrap();
    let (_, events) = alice
        .storage()
        .channel_metadata_events("room", ChannelType::Message)
        .unwrap();
    assert_eq!(next(&events).kind, StorageEventKind::Snapshot);

    bob.storage()
        .set_channel_metadata(
            "room",
            ChannelType::Message,
            items(&[("a", "1")]),
            &StorageOptions::default(),
        )
        .unwrap();
    let revision = alice
        .storage()
        .set_channel_metadata(
            "room",
            ChannelType::Message,
            items(&[("b", "2")]),
            &StorageOptions::default().with_record_author(true),
        )
        .unwrap();
    assert_eq!(revision, 2);

    let deltas: Vec<StorageEvent> = vec![next(&events), next(&events)];
    assert_eq!(
        deltas.iter().map(|e| e.major_revision).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(deltas[1].items["b"].author, "alice");
    assert_quiet(&events);
}

#[test]
fn test_concurrent_stale_updates_one_wins() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");
    alice
        .storage()
        .set_channel_metadata(
            "room",
            ChannelType::Message,
            items(&[("k", "v0")]),
            &StorageOptions::default(),
        )
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [alice, bob]
        .into_iter()
        .map(|client| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let value = client.user_id().to_string();
                client.storage().update_channel_metadata(
                    "room",
                    ChannelType::Message,
                    items(&[("k", value.as_str())]),
                    &StorageOptions::default().with_major_rev(1),
                )
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let conflict = results.into_iter().find_map(|r| r.err()).unwrap();
    assert_eq!(
        conflict,
        RtmError::RevisionConflict {
            expected: 1,
            actual: 2
        }
    );
    assert_eq!(
        server
            .metadata(&rtm_sync::Scope::Channel(ChannelKey::message("room")))
            .major_revision,
        2
    );
}

#[test]
fn test_update_missing_key_not_found() {
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    assert!(matches!(
        alice.storage().update_channel_metadata(
            "room",
            ChannelType::Message,
            items(&[("ghost", "1")]),
            &StorageOptions::default(),
        ),
        Err(RtmError::NotFound(_))
    ));
}

#[test]
fn test_lock_guarded_write() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");
    let guarded = StorageOptions::default().with_lock("editor");

    alice.lock().set("room", ChannelType::Message, "editor", 10).unwrap();
    alice
        .lock()
        .acquire("room", ChannelType::Message, "editor", false)
        .unwrap()
        .recv()
        .unwrap();

    alice
        .storage()
        .set_channel_metadata("room", ChannelType::Message, items(&[("k", "v")]), &guarded)
        .unwrap();
    assert!(matches!(
        bob.storage().set_channel_metadata(
            "room",
            ChannelType::Message,
            items(&[("k", "w")]),
            &guarded
        ),
        Err(RtmError::LockNotHeld(_))
    ));
}

#[test]
fn test_user_metadata_subscription() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    let events = alice.storage().subscribe_user_metadata("bob").unwrap();
    assert_eq!(next(&events).kind, StorageEventKind::Snapshot);
    assert!(matches!(
        alice.storage().subscribe_user_metadata("bob"),
        Err(RtmError::AlreadySubscribed(_))
    ));

    bob.storage()
        .set_user_metadata("bob", items(&[("status", "away")]), &StorageOptions::default())
        .unwrap();
    let delta = next(&events);
    assert_eq!(delta.kind, StorageEventKind::Set);
    assert_eq!(delta.items["status"].value, "away");

    alice.storage().unsubscribe_user_metadata("bob").unwrap();
    assert!(alice.storage().user_metadata_events("bob").is_err());
}

// --- Locks ---

#[test]
fn test_lock_retry_handoff() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");
    let key = ChannelKey::message("room");

    alice.lock().set("room", ChannelType::Message, "L", 30).unwrap();
    alice
        .lock()
        .acquire("room", ChannelType::Message, "L", false)
        .unwrap()
        .recv()
        .unwrap();

    assert!(matches!(
        bob.lock().acquire("room", ChannelType::Message, "L", false),
        Err(RtmError::LockHeldByOther { ref owner, .. }) if owner == "alice"
    ));
    let waiting = bob
        .lock()
        .acquire("room", ChannelType::Message, "L", true)
        .unwrap();
    assert!(waiting.try_recv().is_none());
    assert_eq!(bob.lock().pending_acquires(), 1);

    assert_eq!(
        alice
            .lock()
            .revoke("room", ChannelType::Message, "L", "carol")
            .unwrap_err(),
        RtmError::OwnerMismatch {
            lock: "L".into(),
            expected: "carol".into(),
            actual: "alice".into()
        }
    );

    alice.lock().release("room", ChannelType::Message, "L").unwrap();
    assert_eq!(waiting.recv_timeout(WAIT), Some(Ok(())));
    assert_eq!(server.locks(&key)["L"].owner, "bob");
    assert_eq!(bob.lock().pending_acquires(), 0);

    // Alice no longer owns it after the handoff.
    assert_eq!(
        alice
            .lock()
            .revoke("room", ChannelType::Message, "L", "alice")
            .unwrap_err(),
        RtmError::OwnerMismatch {
            lock: "L".into(),
            expected: "alice".into(),
            actual: "bob".into()
        }
    );
    assert_eq!(server.locks(&key)["L"].owner, "bob");
}

#[test]
fn test_own_lock_changes_emitted_once() {
    init_tracing();
    let server = MemoryServer::new();
    for round in 0..20 {
        let alice = login(&server, "alice");
        let name = format!("L{}", round);
        alice.subscribe("room", MessageOptions::default().with_lock(true)).unwrap();
        let (_, events) = alice.lock().lock_events("room", ChannelType::Message).unwrap();
        assert_eq!(next(&events).kind, LockEventKind::Snapshot);

        alice.lock().set("room", ChannelType::Message, &name, 10).unwrap();
        alice
            .lock()
            .acquire("room", ChannelType::Message, &name, false)
            .unwrap()
            .recv()
            .unwrap();
        alice.lock().release("room", ChannelType::Message, &name).unwrap();

        let kinds: Vec<LockEventKind> = (0..3).map(|_| next(&events).kind).collect();
        assert_eq!(
            kinds,
            vec![
                LockEventKind::Set,
                LockEventKind::Acquired,
                LockEventKind::Released
            ]
        );
        assert_quiet(&events);
        let (locks, _) = alice.lock().lock_events("room", ChannelType::Message).unwrap();
        assert!(!locks[&name].is_held());
        alice.logout().unwrap();
    }
}

#[test]
fn test_lock_expiry_hands_off() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");
    let key = ChannelKey::message("room");

    bob.subscribe("room", MessageOptions::default().with_lock(true)).unwrap();
    let (_, events) = bob.lock().lock_events("room", ChannelType::Message).unwrap();
    assert_eq!(next(&events).kind, LockEventKind::Snapshot);

    alice.lock().set("room", ChannelType::Message, "L", 5).unwrap();
    alice
        .lock()
        .acquire("room", ChannelType::Message, "L", false)
        .unwrap()
        .recv()
        .unwrap();
    let waiting = bob
        .lock()
        .acquire("room", ChannelType::Message, "L", true)
        .unwrap();

    assert!(server.expire_lock(&key, "L"));
    assert_eq!(waiting.recv_timeout(WAIT), Some(Ok(())));

    let kinds: Vec<LockEventKind> = (0..4).map(|_| next(&events).kind).collect();
    assert_eq!(
        kinds,
        vec![
            LockEventKind::Set,
            LockEventKind::Acquired,
            LockEventKind::Expired,
            LockEventKind::Acquired
        ]
    );
    let (locks, _) = bob.lock().lock_events("room", ChannelType::Message).unwrap();
    assert_eq!(locks["L"].owner, "bob");
}

#[test]
fn test_pending_acquire_cancelled_by_release_and_logout() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    alice.lock().set("room", ChannelType::Message, "L", 10).unwrap();
    alice
        .lock()
        .acquire("room", ChannelType::Message, "L", false)
        .unwrap()
        .recv()
        .unwrap();

    let first = bob
        .lock()
        .acquire("room", ChannelType::Message, "L", true)
        .unwrap();
    // Bob does not hold the lock, so the release itself fails after
    // cancelling his wait.
    assert!(matches!(
        bob.lock().release("room", ChannelType::Message, "L"),
        Err(RtmError::LockNotHeld(_))
    ));
    assert!(matches!(first.try_recv(), Some(Err(RtmError::Cancelled(_)))));

    let second = bob
        .lock()
        .acquire("room", ChannelType::Message, "L", true)
        .unwrap();
    bob.logout().unwrap();
    assert!(matches!(second.try_recv(), Some(Err(RtmError::Cancelled(_)))));
}

// --- Presence ---

#[test]
fn test_presence_state_cached_until_subscribe() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");

    bob.subscribe("room", MessageOptions::default()).unwrap();
    let (present, events) = bob
        .presence()
        .presence_events("room", ChannelType::Message)
        .unwrap();
    assert!(present.contains_key("bob"));
    assert!(matches!(next(&events), PresenceEvent::Snapshot { .. }));

    alice
        .presence()
        .set_state("room", ChannelType::Message, state(&[("mood", "ok")]))
        .unwrap();
    assert!(matches!(
        bob.presence().get_state("room", ChannelType::Message, "alice"),
        Err(RtmError::NotFound(_))
    ));

    alice.subscribe("room", MessageOptions::default()).unwrap();
    assert_eq!(
        bob.presence()
            .get_state("room", ChannelType::Message, "alice")
            .unwrap(),
        state(&[("mood", "ok")])
    );
    match next(&events) {
        PresenceEvent::Join { user_id, state: s } => {
            assert_eq!(user_id, "alice");
            assert_eq!(s, state(&[("mood", "ok")]));
        }
        other => panic!("expected join, got {:?}", other),
    }

    alice
        .presence()
        .remove_state("room", ChannelType::Message, vec![])
        .unwrap();
    assert_eq!(
        next(&events),
        PresenceEvent::StateChanged {
            user_id: "alice".into(),
            state: HashMap::new()
        }
    );
}

#[test]
fn test_state_set_during_subscribe_handshake_lands() {
    init_tracing();
    let server = MemoryServer::new();
    let bob = login(&server, "bob");

    for round in 0..20 {
        let alice = login(&server, "alice");
        let channel = format!("room{}", round);
        let barrier = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                alice.subscribe(&channel, MessageOptions::default()).unwrap();
            });
            barrier.wait();
            alice
                .presence()
                .set_state(&channel, ChannelType::Message, state(&[("mood", "ok")]))
                .unwrap();
        });
        assert_eq!(
            bob.presence()
                .get_state(&channel, ChannelType::Message, "alice")
                .unwrap(),
            state(&[("mood", "ok")])
        );
        alice.logout().unwrap();
    }
}

#[test]
fn test_who_now_pages() {
    init_tracing();
    let server = MemoryServer::new().with_page_size(2);
    let clients: Vec<RtmClient> = ["a", "b", "c"].iter().map(|u| login(&server, u)).collect();
    for client in &clients {
        client.subscribe("room", MessageOptions::default()).unwrap();
    }

    let presence = clients[0].presence();
    let first = presence
        .who_now("room", ChannelType::Message, &PresenceOptions::default())
        .unwrap();
    assert_eq!(first.users.len(), 2);
    let page = first.next_page.clone().unwrap();

    let second = presence
        .who_now(
            "room",
            ChannelType::Message,
            &PresenceOptions::default().with_page(page),
        )
        .unwrap();
    assert_eq!(second.users.len(), 1);
    assert!(second.next_page.is_none());

    let mut all: Vec<String> = first
        .users
        .into_iter()
        .chain(second.users)
        .map(|u| u.user_id)
        .collect();
    all.sort();
    assert_eq!(all, vec!["a", "b", "c"]);

    let channels = presence.where_now("b").unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].channel, "room");
}

// --- Stream Channels ---

#[test]
fn test_topic_fanout_filters_publishers() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");
    let bob = login(&server, "bob");
    let carol = login(&server, "carol");

    let carol_video = carol.stream_channel("video").unwrap();
    let joined = carol_video.join(JoinOptions::default()).unwrap();
    assert!(joined.topics.is_empty());
    assert!(matches!(
        next(&joined.topic_events),
        TopicEvent::Snapshot { .. }
    ));

    let alice_video = alice.stream_channel("video").unwrap();
    let bob_video = bob.stream_channel("video").unwrap();
    for video in [&alice_video, &bob_video] {
        video.join(JoinOptions::default()).unwrap();
        video.join_topic("cam", TopicOptions::default()).unwrap();
    }
    for expected in ["alice", "bob"] {
        match next(&joined.topic_events) {
            TopicEvent::Join { topic, user_id, .. } => {
                assert_eq!(topic, "cam");
                assert_eq!(user_id, expected);
            }
            other => panic!("expected join, got {:?}", other),
        }
    }

    let cam = carol_video.subscribe_topic("cam", &["alice"]).unwrap();
    alice_video
        .publish_topic("cam", "a1", TopicPublishOptions::default())
        .unwrap();
    bob_video
        .publish_topic("cam", "b1", TopicPublishOptions::default())
        .unwrap();
    assert_eq!(next(&cam).payload, b"a1");
    assert_quiet(&cam);

    let widened = carol_video.subscribe_topic("cam", &["bob"]).unwrap();
    bob_video
        .publish_topic("cam", "b2", TopicPublishOptions::default())
        .unwrap();
    assert_eq!(next(&widened).payload, b"b2");
    assert!(cam.is_empty());

    carol_video.unsubscribe_topic("cam", &[]).unwrap();
    assert_eq!(
        carol_video.subscribed_users("cam").unwrap(),
        SubscribedUsers::Users(Default::default())
    );
    alice_video
        .publish_topic("cam", "a2", TopicPublishOptions::default())
        .unwrap();
    assert_quiet(&cam);
}

#[test]
fn test_notice_pushed_with_join_delivered() {
    init_tracing();
    let server = MemoryServer::new().with_join_notice("welcome");
    let alice = login(&server, "alice");

    let video = alice.stream_channel("video").unwrap();
    let joined = video.join(JoinOptions::default()).unwrap();
    assert_eq!(next(&joined.notices), "welcome");
    assert_quiet(&joined.notices);
}

#[test]
fn test_stream_notices_and_leave() {
    init_tracing();
    let server = MemoryServer::new();
    let alice = login(&server, "alice");

    let video = alice.stream_channel("video").unwrap();
    assert!(video.same_instance(&alice.stream_channel("video").unwrap()));
    let joined = video.join(JoinOptions::default()).unwrap();
    assert!(video.is_joined());

    assert_eq!(server.notice("video", "maintenance"), 1);
    assert_eq!(next(&joined.notices), "maintenance");

    video.leave().unwrap();
    assert!(!video.is_joined());
    assert!(joined.notices.recv_timeout(QUIET).is_err());
    assert!(matches!(video.leave(), Err(RtmError::NotJoined(_))));

    // Rejoining the same instance works.
    video.join(JoinOptions::default()).unwrap();
}
