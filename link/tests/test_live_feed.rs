//! End-to-end tests of the client against an in-process live feed.

mod common;

use common::{wait_until, within, MockFeed};
use pv_link::{
    ChannelState, ConnectionOptions, EventHandlers, PvLinkClient, PvLinkTimeouts, PvValue,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn client_for(feed: &MockFeed, handlers: EventHandlers) -> PvLinkClient {
    PvLinkClient::builder()
        .base_url(feed.base_url())
        .timeouts(PvLinkTimeouts::fast())
        .connection_options(
            ConnectionOptions::default()
                .with_reconnect_delay_ms(50)
                .with_max_reconnect_delay_ms(200),
        )
        .event_handlers(handlers)
        .flush_interval(Duration::from_millis(50))
        .heartbeat_interval(Duration::from_secs(60))
        .build()
        .unwrap()
}

fn sample(value: f64) -> serde_json::Value {
    json!({"value": value, "severity": "NO_ALARM", "connected": true, "updatedAt": 1_700_000_000.0})
}

type Seen = Arc<Mutex<Vec<(String, PvValue)>>>;

fn recorder() -> (Seen, impl Fn(&str, &PvValue) + Send + Sync + 'static) {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    (seen, move |name: &str, value: &PvValue| {
        sink.lock().unwrap().push((name.to_string(), value.clone()));
    })
}

#[tokio::test]
async fn test_initial_values_reach_subscribers() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());
    client.start().unwrap();

    let (seen, callback) = recorder();
    let _handle = client.subscribe("LN:MAG1:I", callback);
    assert_eq!(
        feed.next_message().await,
        json!({"type": "subscribe", "pvNames": ["LN:MAG1:I"]})
    );
    assert_eq!(client.connection_state(), ChannelState::Open);

    feed.send(json!({
        "type": "subscribe-ack",
        "data": {"LN:MAG1:I": sample(12.5), "NOT:MINE": sample(1.0)}
    }));

    wait_until("published value", || client.live_value("LN:MAG1:I").is_some()).await;
    assert_eq!(client.live_value("LN:MAG1:I").unwrap().as_f64(), Some(12.5));
    assert!(client.live_value("NOT:MINE").is_none(), "names without consumers are dropped");

    wait_until("callback", || !seen.lock().unwrap().is_empty()).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "LN:MAG1:I");
    client.dispose();
}

#[tokio::test]
async fn test_burst_is_coalesced_to_last_value() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());
    client.start().unwrap();

    let _handle = client.subscribe("A", |_, _| {});
    feed.next_message().await;

    let mut rx = client.watch_live_values();
    for i in 0..50 {
        feed.send(json!({"type": "diff", "data": {"A": sample(i as f64)}}));
    }
    within("last value published", async {
        loop {
            rx.changed().await.unwrap();
            if rx.borrow_and_update().get("A").and_then(|v| v.as_f64()) == Some(49.0) {
                break;
            }
        }
    })
    .await;
    client.dispose();
}

#[tokio::test]
async fn test_unknown_and_error_frames_do_not_break_the_channel() {
    let mut feed = MockFeed::start().await;
    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    let errs = errors.clone();
    let handlers = EventHandlers::new().on_error(move |e| errs.lock().unwrap().push(e.message));
    let client = client_for(&feed, handlers);
    client.start().unwrap();

    let _handle = client.subscribe("A", |_, _| {});
    feed.next_message().await;

    feed.send(json!({"type": "stats", "clients": 3}));
    feed.send_raw("{not json");
    feed.send(json!({"type": "error", "message": "PV A not found"}));
    feed.send(json!({"type": "heartbeat"}));
    feed.send(json!({"type": "update", "data": {"A": sample(7.0)}}));

    wait_until("value after noise", || client.live_value("A").is_some()).await;
    assert_eq!(errors.lock().unwrap().as_slice(), ["PV A not found"]);
    assert!(client.is_connected());
    assert_eq!(feed.connection_count(), 1);
    client.dispose();
}

#[tokio::test]
async fn test_bad_entry_does_not_drop_the_rest_of_the_frame() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());
    client.start().unwrap();

    let (seen, callback) = recorder();
    let mut consumer = client.consumer(callback);
    consumer.set_pv_names(["A", "B", "C"]);
    feed.next_message().await;

    feed.send(json!({
        "type": "diff",
        "data": {
            "A": {"value": 1.0, "updatedAt": "yesterday"},
            "B": {"value": 2.0, "connected": null, "updatedAt": 1_700_000_000.0, "timestamp": 1.0},
            "C": sample(3.0)
        }
    }));
    feed.send(json!({"type": "diff", "data": null}));

    wait_until("good entries", || seen.lock().unwrap().len() == 2).await;
    let b = client.live_value("B").unwrap();
    assert!(!b.connected);
    assert_eq!(b.updated_at, Some(1_700_000_000.0));
    assert_eq!(client.live_value("C").unwrap().as_f64(), Some(3.0));
    assert!(client.live_value("A").is_none());
    assert!(client.is_connected());
    assert_eq!(feed.connection_count(), 1);
    client.dispose();
}

#[tokio::test]
async fn test_server_ping_is_answered_and_channel_stays_open() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());
    client.start().unwrap();

    let _handle = client.subscribe("A", |_, _| {});
    feed.next_message().await;

    feed.ping(b"are-you-there");
    wait_until("pong", || feed.pongs().iter().any(|p| p.as_slice() == b"are-you-there")).await;

    feed.send(json!({"type": "diff", "data": {"A": sample(4.0)}}));
    wait_until("value after ping", || client.live_value("A").is_some()).await;
    assert!(client.is_connected());
    assert_eq!(feed.connection_count(), 1);
    client.dispose();
}

#[tokio::test]
async fn test_shared_name_is_subscribed_once() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());
    client.start().unwrap();

    let first = client.subscribe("X", |_, _| {});
    let second = client.subscribe("X", |_, _| {});
    assert_eq!(feed.next_message().await, json!({"type": "subscribe", "pvNames": ["X"]}));

    drop(first);
    // A later subscribe must be the next frame: no unsubscribe for X was sent.
    let _other = client.subscribe("Y", |_, _| {});
    assert_eq!(feed.next_message().await, json!({"type": "subscribe", "pvNames": ["Y"]}));

    drop(second);
    assert_eq!(feed.next_message().await, json!({"type": "unsubscribe", "pvNames": ["X"]}));
    client.dispose();
}

#[tokio::test]
async fn test_unsubscribe_is_immediate() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());
    client.start().unwrap();

    let (seen, callback) = recorder();
    let handle = client.subscribe("X", callback);
    feed.next_message().await;
    feed.send(json!({"type": "initial", "data": {"X": sample(1.0)}}));
    wait_until("X published", || client.live_value("X").is_some()).await;

    handle.unsubscribe();
    assert!(client.live_value("X").is_none(), "published entry removed right away");
    assert_eq!(feed.next_message().await, json!({"type": "unsubscribe", "pvNames": ["X"]}));

    let delivered = seen.lock().unwrap().len();
    // Late frame for X, followed by a marker PV to know the frame was processed.
    let _marker = client.subscribe("M", |_, _| {});
    feed.next_message().await;
    feed.send(json!({"type": "diff", "data": {"X": sample(2.0), "M": sample(0.0)}}));
    wait_until("marker published", || client.live_value("M").is_some()).await;

    assert!(client.live_value("X").is_none());
    assert_eq!(seen.lock().unwrap().len(), delivered, "no callback after unsubscribe");
    client.dispose();
}

#[tokio::test]
async fn test_subscriptions_made_before_open_are_sent_on_open() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());

    let _b = client.subscribe("B", |_, _| {});
    let _a = client.subscribe("A", |_, _| {});
    client.start().unwrap();

    assert_eq!(
        feed.next_message().await,
        json!({"type": "subscribe", "pvNames": ["A", "B"]})
    );
    feed.assert_no_message(Duration::from_millis(100)).await;
    client.dispose();
}

#[tokio::test]
async fn test_resubscribes_after_server_drop() {
    let mut feed = MockFeed::start().await;
    let reconnects: Arc<Mutex<Vec<u32>>> = Arc::default();
    let rec = reconnects.clone();
    let handlers = EventHandlers::new().on_reconnect_scheduled(move |attempt, _| rec.lock().unwrap().push(attempt));
    let client = client_for(&feed, handlers);
    client.start().unwrap();

    let _a = client.subscribe("A", |_, _| {});
    let _b = client.subscribe("B", |_, _| {});
    feed.next_message().await;
    feed.next_message().await;

    feed.drop_connections();
    assert_eq!(
        feed.next_message().await,
        json!({"type": "subscribe", "pvNames": ["A", "B"]}),
        "every registered name is re-issued after reconnecting"
    );
    assert_eq!(feed.connection_count(), 2);
    assert_eq!(reconnects.lock().unwrap().as_slice(), [1]);
    wait_until("open again", || client.is_connected()).await;
    assert_eq!(client.channel().reconnect_attempts(), 0, "attempts reset on open");
    client.dispose();
}

#[tokio::test]
async fn test_consumer_set_changes_are_incremental_on_the_wire() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());
    client.start().unwrap();
    wait_until("open", || client.is_connected()).await;

    let mut table = client.consumer(|_, _| {});
    table.set_pv_names(["A", "B", "C"]);
    assert_eq!(
        feed.next_message().await,
        json!({"type": "subscribe", "pvNames": ["A", "B", "C"]})
    );

    table.set_pv_names(["B", "C", "D"]);
    assert_eq!(feed.next_message().await, json!({"type": "unsubscribe", "pvNames": ["A"]}));
    assert_eq!(feed.next_message().await, json!({"type": "subscribe", "pvNames": ["D"]}));

    drop(table);
    assert_eq!(
        feed.next_message().await,
        json!({"type": "unsubscribe", "pvNames": ["B", "C", "D"]})
    );
    client.dispose();
}

#[tokio::test]
async fn test_stop_disconnects_and_start_reconnects() {
    let mut feed = MockFeed::start().await;
    let client = client_for(&feed, EventHandlers::new());
    client.start().unwrap();
    let _a = client.subscribe("A", |_, _| {});
    feed.next_message().await;

    client.stop();
    wait_until("closed", || client.connection_state() == ChannelState::Disconnected).await;
    wait_until("server saw close", || feed.open_connections() == 0).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(feed.connection_count(), 1, "no automatic reconnect after stop");

    client.start().unwrap();
    assert_eq!(feed.next_message().await, json!({"type": "subscribe", "pvNames": ["A"]}));
    assert_eq!(feed.connection_count(), 2);
    client.dispose();
}
