//! Socket-level behavior: reconnect backoff, heartbeat liveness, routing and
//! membership filtering across incarnations.

mod support;

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{build_socket, build_socket_with, settle};
use trellis::{ChannelStatus, Message, SocketStatus, TransportEvent, Vsn};

#[tokio::test(start_paused = true)]
async fn channel_rejoins_with_a_fresh_incarnation_after_reconnect() {
    let (socket, ctl) = build_socket();
    socket.connect();
    settle().await;

    let channel = socket.channel("rooms:lobby", json!({}));
    channel.join().unwrap();
    settle().await;
    ctl.server_reply(Some("1"), "1", "rooms:lobby", "ok", json!({}));
    settle().await;
    assert_eq!(channel.status(), ChannelStatus::Joined);

    ctl.server_close(1006, "");
    settle().await;
    assert!(!socket.is_connected());
    assert_eq!(socket.status(), SocketStatus::Connecting);
    assert_eq!(channel.status(), ChannelStatus::Errored);

    // reconnect_after(1) later the transport reopens and the channel rejoins
    // immediately, abandoning the old join_ref.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ctl.connects(), 2);
    let sent = ctl.sent();
    assert_eq!(
        sent.last().unwrap(),
        &json!([null, "2", "rooms:lobby", "phx_join", {}])
    );
    assert_eq!(channel.status(), ChannelStatus::Joining);

    ctl.server_reply(Some("2"), "2", "rooms:lobby", "ok", json!({}));
    settle().await;
    assert_eq!(channel.status(), ChannelStatus::Joined);
    assert_eq!(channel.join_ref().as_deref(), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn messages_from_a_stale_incarnation_are_dropped() {
    let (socket, ctl) = build_socket();
    socket.connect();
    settle().await;

    let channel = socket.channel("rooms:lobby", json!({}));
    let messages: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = Arc::clone(&messages);
    channel.on("new_msg", move |message: &Message| {
        sink.lock().unwrap().push(message.payload.clone());
    });
    channel.join().unwrap();
    settle().await;
    ctl.server_reply(Some("1"), "1", "rooms:lobby", "ok", json!({}));
    settle().await;

    // join_ref "5" belongs to some previous incarnation: no subscriber fires.
    ctl.server_frame(Some("5"), None, "rooms:lobby", "new_msg", json!({"body": "old"}));
    settle().await;
    assert!(messages.lock().unwrap().is_empty());

    ctl.server_frame(Some("1"), None, "rooms:lobby", "new_msg", json!({"body": "new"}));
    settle().await;
    assert_eq!(*messages.lock().unwrap(), vec![json!({"body": "new"})]);
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeat_reply_force_closes_and_reconnects() {
    let (socket, ctl) = build_socket();
    socket.connect();
    settle().await;

    // First heartbeat after one interval; the server answers it.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        ctl.sent(),
        vec![json!([null, "1", "phoenix", "heartbeat", {}])]
    );
    ctl.server_reply(None, "1", "phoenix", "ok", json!({}));

    // Second heartbeat goes unanswered.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(ctl.sent().len(), 2);

    // At the next tick the reply is still outstanding: the transport is
    // force-closed and the standard reconnect path takes over.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(ctl
        .closes()
        .contains(&(1000, "heartbeat timeout".to_string())));
    assert_eq!(ctl.connects(), 2);
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn rejoining_evicts_a_duplicate_channel_on_the_same_topic() {
    let (socket, ctl) = build_socket();
    socket.connect();
    settle().await;

    let first = socket.channel("rooms:lobby", json!({}));
    first.join().unwrap();
    settle().await;
    ctl.server_reply(Some("1"), "1", "rooms:lobby", "ok", json!({}));
    settle().await;
    assert_eq!(first.status(), ChannelStatus::Joined);

    let second = socket.channel("rooms:lobby", json!({}));
    second.join().unwrap();
    settle().await;

    assert_eq!(first.status(), ChannelStatus::Closed);
    assert_eq!(second.status(), ChannelStatus::Joining);

    ctl.server_reply(Some("2"), "2", "rooms:lobby", "ok", json!({}));
    settle().await;
    assert_eq!(second.status(), ChannelStatus::Joined);
}

#[tokio::test(start_paused = true)]
async fn disconnect_suppresses_reconnect_until_connect_is_called_again() {
    let (socket, ctl) = build_socket();
    socket.connect();
    settle().await;

    let channel = socket.channel("rooms:lobby", json!({}));
    channel.join().unwrap();
    settle().await;
    ctl.server_reply(Some("1"), "1", "rooms:lobby", "ok", json!({}));
    settle().await;

    socket.disconnect(None, None);
    settle().await;
    assert_eq!(socket.status(), SocketStatus::Closed);
    assert_eq!(ctl.closes(), vec![(1000, String::new())]);
    assert_eq!(channel.status(), ChannelStatus::Errored);

    // No reconnect on its own.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(ctl.attempts(), 1);

    // An explicit connect brings the channel back through a rejoin.
    socket.connect();
    settle().await;
    assert_eq!(ctl.connects(), 2);
    assert_eq!(
        ctl.sent().last().unwrap()[3],
        json!("phx_join")
    );
    ctl.server_reply(Some("2"), "2", "rooms:lobby", "ok", json!({}));
    settle().await;
    assert_eq!(channel.status(), ChannelStatus::Joined);
    assert_eq!(channel.join_ref().as_deref(), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn failed_connects_retry_on_the_backoff_schedule() {
    let (socket, ctl) = build_socket();
    ctl.fail_next_connects(2);

    socket.connect();
    settle().await;
    assert_eq!(ctl.attempts(), 1);
    assert_eq!(socket.status(), SocketStatus::Connecting);

    // Second attempt 10 ms after the first failure.
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert_eq!(ctl.attempts(), 2);
    assert!(!socket.is_connected());

    // Third attempt 50 ms after the second failure succeeds.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(ctl.attempts(), 3);
    assert_eq!(ctl.connects(), 1);
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn socket_open_and_close_callbacks_fire() {
    let (socket, ctl) = build_socket();

    let opens = Arc::new(AtomicUsize::new(0));
    let opens_in_cb = Arc::clone(&opens);
    socket.on_open(move || {
        opens_in_cb.fetch_add(1, Ordering::SeqCst);
    });
    let closes: Arc<Mutex<Vec<(u16, String)>>> = Arc::default();
    let closes_in_cb = Arc::clone(&closes);
    socket.on_close(move |code, reason| {
        closes_in_cb.lock().unwrap().push((code, reason.to_string()));
    });

    socket.connect();
    settle().await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    ctl.server_close(1006, "gone away");
    settle().await;
    assert_eq!(*closes.lock().unwrap(), vec![(1006, "gone away".to_string())]);

    // The automatic reconnect fires the open callbacks again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn v1_serializer_speaks_the_object_form() {
    let (socket, ctl) = build_socket_with(|builder| builder.serializer(Vsn::V1));
    socket.connect();
    settle().await;

    let channel = socket.channel("rooms:lobby", json!({}));
    channel.join().unwrap();
    settle().await;

    assert_eq!(
        ctl.sent(),
        vec![json!({
            "join_ref": null,
            "ref": "1",
            "topic": "rooms:lobby",
            "event": "phx_join",
            "payload": {},
        })]
    );

    ctl.server_send(TransportEvent::Message(
        json!({
            "join_ref": "1",
            "ref": "1",
            "topic": "rooms:lobby",
            "event": "phx_reply",
            "payload": {"status": "ok", "response": {}},
        })
        .to_string(),
    ));
    settle().await;
    assert_eq!(channel.status(), ChannelStatus::Joined);
}
