use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use frames::{Command, HeartBeat};
use serde_json::json;

use crate::net::test_broker::{BrokerMode, StalledTransport, TIMESTAMP, TestBroker, settle};
use crate::net::types::{InboundMessage, PrivateMessage, Timestamp, destinations};

// =============================================================
// Helpers
// =============================================================

fn manager_with(broker: &TestBroker, config: ClientConfig) -> ConnectionManager {
    ConnectionManager::with_transport(config, broker.transport())
}

fn manager(broker: &TestBroker) -> ConnectionManager {
    manager_with(broker, ClientConfig::default())
}

#[derive(Clone, Default)]
struct Inbox(Arc<Mutex<Vec<Payload>>>);

impl Inbox {
    fn handler(&self) -> impl Fn(Payload) + Send + Sync + 'static {
        let messages = Arc::clone(&self.0);
        move |payload| messages.lock().expect("inbox").push(payload)
    }

    fn take(&self) -> Vec<Payload> {
        std::mem::take(&mut *self.0.lock().expect("inbox"))
    }
}

fn count_disconnects(manager: &ConnectionManager) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    manager.on_disconnect(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    count
}

fn count_connects(manager: &ConnectionManager) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    manager.on_connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    count
}

// =============================================================
// Connect
// =============================================================

#[tokio::test(start_paused = true)]
async fn connect_resolves_with_handshake() {
    let broker = TestBroker::new();
    let manager = manager(&broker);

    let handshake = manager.connect("alice").await.expect("connect");

    assert_eq!(handshake.version, "1.2");
    assert_eq!(handshake.user_name.as_deref(), Some("alice"));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.is_connected());
    assert_eq!(manager.identity().as_deref(), Some("alice"));
    assert_eq!(manager.handshake(), Some(handshake));
    assert_eq!(
        broker.last_url().expect("url").as_str(),
        "http://localhost:8080/ws?user=alice"
    );

    let connect = &broker.received(Command::Connect)[0];
    assert_eq!(connect.header("accept-version"), Some("1.2,1.1,1.0"));
    assert_eq!(connect.header("heart-beat"), Some("4000,4000"));
    assert_eq!(connect.header("host"), Some("localhost"));
}

#[tokio::test(start_paused = true)]
async fn empty_identity_connects_as_anonymous() {
    let broker = TestBroker::new();
    let manager = manager(&broker);

    let handshake = manager.connect("").await.expect("connect");

    assert_eq!(handshake.user_name.as_deref(), Some(ANONYMOUS));
    assert_eq!(
        broker.last_url().expect("url").query(),
        Some("user=anonymous")
    );
}

#[tokio::test(start_paused = true)]
async fn identity_is_encoded_into_the_query() {
    let broker = TestBroker::new();
    let manager = manager(&broker);

    let handshake = manager.connect("bob smith&co").await.expect("connect");

    assert_eq!(handshake.user_name.as_deref(), Some("bob smith&co"));
    assert_eq!(
        broker.last_url().expect("url").query(),
        Some("user=bob+smith%26co")
    );
}

#[tokio::test(start_paused = true)]
async fn connect_while_connected_reuses_the_session() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    let first = manager.connect("alice").await.expect("connect");

    let second = manager.connect("alice").await.expect("connect again");

    assert_eq!(first, second);
    assert_eq!(broker.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let broker = TestBroker::new();
    let manager = manager(&broker);

    let first = manager.connect("alice");
    let second = manager.connect("alice");
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.expect("first"), second.expect("second"));
    assert_eq!(broker.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_and_closes_the_socket() {
    let broker = TestBroker::with_mode(BrokerMode::Silent);
    let manager = manager(&broker);
    let disconnects = count_disconnects(&manager);

    let err = manager.connect("alice").await.expect_err("silent broker");

    assert_eq!(err, ClientError::ConnectionTimeout(10_000));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    settle().await;
    assert_eq!(broker.live_sessions(), 0);
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn timed_out_fallback_attempt_closes_stalled_candidate() {
    let stalled = StalledTransport::default();
    let broker = TestBroker::new();
    let transport = FallbackTransport::new(vec![Arc::new(stalled.clone()), broker.transport()]);
    let manager = ConnectionManager::with_transport(ClientConfig::default(), Arc::new(transport));

    let err = manager.connect("alice").await.expect_err("stalled candidate");

    assert_eq!(err, ClientError::ConnectionTimeout(10_000));
    settle().await;
    assert!(stalled.is_closed(0));

    stalled.fail(0, "connection refused");
    settle().await;
    assert_eq!(broker.opens(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn rejected_handshake_reports_broker_message() {
    let broker = TestBroker::with_mode(BrokerMode::Reject);
    let manager = manager(&broker);
    let disconnects = count_disconnects(&manager);

    let err = manager.connect("mallory").await.expect_err("rejected");

    assert_eq!(
        err,
        ClientError::Protocol {
            message: "Access denied".to_owned(),
            detail: "bad credentials".to_owned(),
        }
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_socket_reports_transport_error() {
    let broker = TestBroker::with_mode(BrokerMode::Refuse);
    let manager = manager(&broker);

    let err = manager.connect("alice").await.expect_err("refused");

    assert!(matches!(
        err,
        ClientError::Transport(TransportError::Open { ref reason, .. }) if reason == "connection refused"
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn failed_initial_attempt_is_not_retried() {
    let broker = TestBroker::with_mode(BrokerMode::Refuse);
    let manager = manager(&broker);

    let _ = manager.connect("alice").await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(broker.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_broker_url_fails_without_opening() {
    let broker = TestBroker::new();
    let config = ClientConfig {
        broker_url: "not a url".to_owned(),
        ..ClientConfig::default()
    };
    let manager = manager_with(&broker, config);

    let err = manager.connect("alice").await.expect_err("invalid url");

    assert!(matches!(err, ClientError::Transport(TransportError::InvalidUrl { .. })));
    assert_eq!(broker.opens(), 0);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

// =============================================================
// Disconnect
// =============================================================

#[tokio::test(start_paused = true)]
async fn disconnect_clears_registry_and_is_idempotent() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    let disconnects = count_disconnects(&manager);
    manager.connect("alice").await.expect("connect");
    manager.subscribe(destinations::NOTIFICATIONS, |_| {}).expect("sub");
    manager.subscribe(destinations::PRESENCE, |_| {}).expect("sub");
    assert_eq!(manager.subscription_count(), 2);

    manager.disconnect();
    manager.disconnect();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.subscriptions().is_empty());
    assert_eq!(manager.subscription_count(), 0);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    settle().await;
    assert_eq!(broker.received(Command::Disconnect).len(), 1);
    assert_eq!(broker.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_connecting_cancels_the_attempt() {
    let broker = TestBroker::with_mode(BrokerMode::Silent);
    let manager = manager(&broker);
    let pending = manager.connect("alice");

    manager.disconnect();

    assert_eq!(pending.await, Err(ClientError::Cancelled));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    settle().await;
    assert_eq!(broker.live_sessions(), 0);
    assert!(broker.received(Command::Disconnect).is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_after_disconnect_opens_a_new_session() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");
    manager.disconnect();

    manager.connect("alice").await.expect("reconnect");

    assert_eq!(broker.opens(), 2);
    assert!(manager.is_connected());
}

// =============================================================
// Fail-soft operations
// =============================================================

#[tokio::test(start_paused = true)]
async fn subscribe_while_disconnected_returns_none() {
    let broker = TestBroker::new();
    let manager = manager(&broker);

    assert!(manager.subscribe(destinations::NOTIFICATIONS, |_| {}).is_none());
    assert!(manager.subscriptions().is_empty());
    assert_eq!(broker.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn publish_while_disconnected_returns_false() {
    let broker = TestBroker::new();
    let manager = manager(&broker);

    assert!(!manager.publish(destinations::PRIVATE_SEND, "hi", &[]));
    assert!(!manager.send(&OutboundMessage::join_room("general", "alice")));
    assert_eq!(broker.opens(), 0);
    assert!(broker.received(Command::Send).is_empty());
}

#[tokio::test(start_paused = true)]
async fn publish_while_connecting_is_rejected() {
    let broker = TestBroker::with_mode(BrokerMode::Silent);
    let manager = manager(&broker);
    let _pending = manager.connect("alice");

    assert!(!manager.publish("/app/update", "x", &[]));
    assert!(manager.subscribe(destinations::PRESENCE, |_| {}).is_none());
    settle().await;
    assert!(broker.received(Command::Send).is_empty());
    assert!(broker.received(Command::Subscribe).is_empty());
}

// =============================================================
// Subscriptions and delivery
// =============================================================

#[tokio::test(start_paused = true)]
async fn second_subscribe_replaces_the_first() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");
    let first_inbox = Inbox::default();
    let second_inbox = Inbox::default();

    let first = manager
        .subscribe(destinations::PRESENCE, first_inbox.handler())
        .expect("first");
    let second = manager
        .subscribe(destinations::PRESENCE, second_inbox.handler())
        .expect("second");
    settle().await;

    assert_ne!(first.id(), second.id());
    assert_eq!(manager.subscriptions(), vec![destinations::PRESENCE.to_owned()]);
    assert_eq!(manager.subscription_count(), 1);
    assert_eq!(broker.received(Command::Unsubscribe)[0].header("id"), Some(first.id()));

    broker.publish_raw(destinations::PRESENCE, r#"{"userId":"bob","status":"ONLINE"}"#);
    settle().await;
    assert!(first_inbox.take().is_empty());
    assert_eq!(second_inbox.take().len(), 1);

    assert!(!first.is_active());
    assert!(second.is_active());
    assert!(!first.unsubscribe());
    assert_eq!(manager.subscriptions().len(), 1);
    assert!(second.unsubscribe());
    assert!(manager.subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_by_destination_cancels_on_the_broker() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");
    let inbox = Inbox::default();
    let subscription = manager
        .subscribe(destinations::LIVE_DATA, inbox.handler())
        .expect("sub");

    manager.unsubscribe(destinations::LIVE_DATA);
    manager.unsubscribe("/topic/never-subscribed");
    settle().await;

    let unsubscribes = broker.received(Command::Unsubscribe);
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(unsubscribes[0].header("id"), Some(subscription.id()));
    broker.publish_raw(destinations::LIVE_DATA, "{}");
    settle().await;
    assert!(inbox.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn subscribe_forwards_extra_headers() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");

    manager
        .subscribe_with(
            destinations::DEMO_CHAT,
            Arc::new(|_| {}),
            &[("ack".to_owned(), "auto".to_owned())],
        )
        .expect("sub");
    settle().await;

    let subscribe = &broker.received(Command::Subscribe)[0];
    assert_eq!(subscribe.header("destination"), Some(destinations::DEMO_CHAT));
    assert_eq!(subscribe.header("ack"), Some("auto"));
}

#[tokio::test(start_paused = true)]
async fn raw_bodies_are_delivered_untouched() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");
    let inbox = Inbox::default();
    manager.subscribe(destinations::DEMO_CHAT, inbox.handler()).expect("sub");
    settle().await;

    broker.publish_raw(destinations::DEMO_CHAT, "plain text, not json");
    settle().await;

    assert_eq!(inbox.take(), vec![Payload::Raw("plain text, not json".to_owned())]);
}

#[tokio::test(start_paused = true)]
async fn private_message_reaches_only_the_receiver() {
    let broker = TestBroker::new();
    let alice = manager(&broker);
    let bob = manager(&broker);
    alice.connect("alice").await.expect("alice");
    bob.connect("bob").await.expect("bob");
    let alice_inbox = Inbox::default();
    let bob_inbox = Inbox::default();
    alice.subscribe(destinations::PRIVATE_QUEUE, alice_inbox.handler()).expect("sub");
    bob.subscribe(destinations::PRIVATE_QUEUE, bob_inbox.handler()).expect("sub");
    settle().await;

    assert!(alice.send(&OutboundMessage::private_message("alice", "bob", "hi bob")));
    settle().await;

    let received = bob_inbox.take();
    assert_eq!(received.len(), 1);
    let message: PrivateMessage = received[0].parse().expect("private message");
    assert_eq!(message.sender, "alice");
    assert_eq!(message.receiver, "bob");
    assert_eq!(message.message, "hi bob");
    assert_eq!(message.timestamp, Some(Timestamp::Millis(TIMESTAMP)));
    assert!(alice_inbox.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn room_join_and_message_are_broadcast_to_the_room() {
    let broker = TestBroker::new();
    let alice = manager(&broker);
    alice.connect("alice").await.expect("connect");
    let room_topic = destinations::room_topic("general");
    let inbox = Inbox::default();
    alice.subscribe(&room_topic, inbox.handler()).expect("sub");
    settle().await;

    assert!(alice.send(&OutboundMessage::join_room("general", "alice")));
    assert!(alice.send(&OutboundMessage::room_message("general", "alice", "hello room")));
    settle().await;

    let messages = inbox
        .take()
        .into_iter()
        .map(|payload| InboundMessage::decode(&room_topic, payload))
        .collect::<Vec<_>>();
    assert_eq!(messages.len(), 2);
    let InboundMessage::Room(join) = &messages[0] else {
        panic!("expected room message, got {:?}", messages[0]);
    };
    assert_eq!(join.message, "alice joined the room");
    let InboundMessage::Room(chat) = &messages[1] else {
        panic!("expected room message, got {:?}", messages[1]);
    };
    assert_eq!(chat.sender, "alice");
    assert_eq!(chat.message, "hello room");
    assert_eq!(chat.room.as_deref(), Some("general"));
}

#[tokio::test(start_paused = true)]
async fn publish_json_sets_content_type() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");

    assert!(manager.publish_json("/app/update", &json!({"carId": "7"})));
    assert!(manager.publish(
        destinations::DEMO_CHAT,
        "hello",
        &[("x-trace".to_owned(), "1".to_owned())]
    ));
    settle().await;

    let sends = broker.received(Command::Send);
    assert_eq!(sends[0].header("destination"), Some("/app/update"));
    assert_eq!(sends[0].header("content-type"), Some("application/json"));
    assert_eq!(sends[0].body, r#"{"carId":"7"}"#);
    assert_eq!(sends[1].header("x-trace"), Some("1"));
    assert_eq!(sends[1].header("content-type"), None);
    assert_eq!(sends[1].body, "hello");
}

// =============================================================
// Observers
// =============================================================

#[tokio::test(start_paused = true)]
async fn connect_observers_receive_the_handshake() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on_connect(move |handshake| {
        sink.lock()
            .expect("seen")
            .push(handshake.session.clone().unwrap_or_default());
    });

    manager.connect("alice").await.expect("connect");

    assert_eq!(*seen.lock().expect("seen"), vec!["session-0".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn removed_observers_are_not_called() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    let kept = count_connects(&manager);
    let removed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&removed);
    let id = manager.on_connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(manager.observer_counts(), (2, 0));

    assert!(manager.remove_observer(id));
    assert!(!manager.remove_observer(id));
    manager.connect("alice").await.expect("connect");

    assert_eq!(manager.observer_counts(), (1, 0));
    assert_eq!(kept.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 0);
}

// =============================================================
// Session loss, heart-beats, reconnect
// =============================================================

#[tokio::test(start_paused = true)]
async fn dropped_session_notifies_and_reconnects_without_resubscribing() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    let connects = count_connects(&manager);
    let disconnects = count_disconnects(&manager);
    manager.connect("alice").await.expect("connect");
    let subscription = manager.subscribe(destinations::NOTIFICATIONS, |_| {}).expect("sub");

    broker.drop_sessions();
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(manager.subscriptions().is_empty());
    assert!(!subscription.is_active());

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    settle().await;

    assert!(manager.is_connected());
    assert_eq!(broker.opens(), 2);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(manager.identity().as_deref(), Some("alice"));
    assert!(manager.subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_reconnect_delay_disables_reconnect() {
    let broker = TestBroker::new();
    let config = ClientConfig {
        reconnect_delay_ms: 0,
        ..ClientConfig::default()
    };
    let manager = manager_with(&broker, config);
    manager.connect("alice").await.expect("connect");

    broker.drop_sessions();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(broker.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_scheduled_reconnect() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");
    broker.drop_sessions();
    settle().await;

    manager.disconnect();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(broker.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_reconnects_keep_retrying() {
    let broker = TestBroker::new();
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");
    broker.set_mode(BrokerMode::Refuse);
    broker.drop_sessions();
    settle().await;

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    settle().await;
    assert_eq!(broker.opens(), 2);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    broker.set_mode(BrokerMode::Accept);
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    settle().await;
    assert_eq!(broker.opens(), 3);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn broker_error_frame_ends_the_session() {
    let broker = TestBroker::new();
    let config = ClientConfig {
        reconnect_delay_ms: 0,
        ..ClientConfig::default()
    };
    let manager = manager_with(&broker, config);
    let disconnects = count_disconnects(&manager);
    manager.connect("alice").await.expect("connect");

    broker.send_error("Server shutting down");
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn heart_beats_are_sent_at_the_negotiated_interval() {
    let broker = TestBroker::new();
    broker.set_heart_beat(HeartBeat::new(0, 1000));
    let manager = manager(&broker);
    manager.connect("alice").await.expect("connect");

    tokio::time::sleep(Duration::from_millis(8_500)).await;
    settle().await;

    assert_eq!(broker.heart_beats(), 2);
    assert!(manager.is_connected());
}

#[tokio::test(start_paused = true)]
async fn broker_silence_drops_the_session() {
    let broker = TestBroker::new();
    broker.set_heart_beat(HeartBeat::new(1000, 0));
    let config = ClientConfig {
        reconnect_delay_ms: 0,
        ..ClientConfig::default()
    };
    let manager = manager_with(&broker, config);
    let disconnects = count_disconnects(&manager);
    manager.connect("alice").await.expect("connect");

    tokio::time::sleep(Duration::from_millis(7_000)).await;
    assert!(manager.is_connected());
    broker.send_heart_beat();
    tokio::time::sleep(Duration::from_millis(7_000)).await;
    assert!(manager.is_connected());

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}
