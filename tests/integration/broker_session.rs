// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for `WsTransport` against an in-process
//! `chatcache-broker`.
//!
//! Verifies:
//! 1. Connect handshake, subscribe and publish carry bodies and `reply_to`.
//! 2. A correlated call completes through the broker and its private
//!    destinations are unsubscribed afterwards.
//! 3. Another user's `/user/...` destination is never delivered.
//! 4. Connecting to a dead address fails instead of hanging.
//! 5. After the broker drops the connection, the transport reconnects and
//!    replays its subscriptions.

use std::sync::Arc;
use std::time::Duration;

use chatcache::correlation::{CallOptions, CorrelatedClient};
use chatcache::router::Router;
use chatcache::transport::channel::Channel;
use chatcache::transport::ws::{ReconnectPolicy, WsOptions, WsTransport};
use chatcache::transport::{Transport, TransportType};
use chatcache_broker::broker::{BrokerState, start_server_with_state};
use chatcache_proto::broker::ReplyTo;
use chatcache_proto::message::UserId;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Starts a broker on an ephemeral port and returns its URL and state.
async fn start_broker() -> (String, Arc<BrokerState>) {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

fn options() -> WsOptions {
    WsOptions {
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
        },
        ..WsOptions::default()
    }
}

async fn connect(url: &str, client_id: &str) -> WsTransport {
    WsTransport::connect(url, client_id, options()).await.unwrap()
}

/// Waits until `destination` has `count` subscribers at the broker.
async fn wait_for_subscribers(state: &BrokerState, destination: &str, count: usize) {
    for _ in 0..200 {
        if state.subscriber_count(destination).await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{destination} never reached {count} subscribers");
}

// ---------------------------------------------------------------------------
// Publish / subscribe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_reaches_subscriber_with_reply_to() {
    let (url, state) = start_broker().await;
    let alice = connect(&url, "alice").await;
    let bob = connect(&url, "bob").await;
    assert_eq!(alice.transport_type(), TransportType::WebSocket);
    assert!(alice.is_connected());

    bob.subscribe("/topic/news").await.unwrap();
    wait_for_subscribers(&state, "/topic/news", 1).await;

    let reply_to = ReplyTo {
        success: "/user/alice/queue/x-scss".to_string(),
        error: "/user/alice/queue/x-err".to_string(),
    };
    alice
        .publish("/topic/news", Some(reply_to.clone()), b"{\"n\":1}".to_vec())
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), bob.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.destination, "/topic/news");
    assert_eq!(delivery.reply_to, Some(reply_to));
    assert_eq!(delivery.body, b"{\"n\":1}");
}

#[tokio::test]
async fn correlated_call_through_broker() {
    let (url, state) = start_broker().await;

    let service = connect(&url, "service").await;
    service.subscribe("/app/echo").await.unwrap();
    wait_for_subscribers(&state, "/app/echo", 1).await;
    let _responder = tokio::spawn(async move {
        while let Ok(delivery) = service.recv().await {
            let Some(reply_to) = delivery.reply_to else {
                continue;
            };
            let request: Value = serde_json::from_slice(&delivery.body).unwrap();
            let body = serde_json::to_vec(&json!({ "echo": request })).unwrap();
            service.publish(&reply_to.success, None, body).await.unwrap();
        }
    });

    let channel = Channel::new(Arc::new(connect(&url, "alice").await), Arc::new(Router::new()));
    let _pump = channel.spawn_pump();
    let client = CorrelatedClient::new(channel, Duration::from_secs(5));
    let options = CallOptions::for_request(&UserId::new("alice"), "echo");

    let answer = client
        .call("/app/echo", &json!({ "q": "ping" }), options.clone())
        .await
        .unwrap();

    assert_eq!(answer, json!({ "echo": { "q": "ping" } }));
    wait_for_subscribers(&state, &options.success_destination, 0).await;
    wait_for_subscribers(&state, &options.error_destination, 0).await;
}

#[tokio::test]
async fn other_users_private_destination_is_not_delivered() {
    let (url, state) = start_broker().await;
    let mallory = connect(&url, "mallory").await;
    let bob = connect(&url, "bob").await;

    // The first subscription is refused by the broker; the second is a
    // marker that both frames have been handled.
    mallory.subscribe("/user/bob/queue/secret").await.unwrap();
    mallory.subscribe("/topic/marker").await.unwrap();
    bob.subscribe("/user/bob/queue/secret").await.unwrap();
    wait_for_subscribers(&state, "/topic/marker", 1).await;
    wait_for_subscribers(&state, "/user/bob/queue/secret", 1).await;

    bob.publish("/user/bob/queue/secret", None, b"\"hidden\"".to_vec())
        .await
        .unwrap();
    bob.publish("/topic/marker", None, b"\"visible\"".to_vec())
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(2), mallory.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.destination, "/topic/marker");

    let own = tokio::time::timeout(Duration::from_secs(2), bob.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.destination, "/user/bob/queue/secret");
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_to_dead_address_fails() {
    // Bind then drop a listener to get a port nobody is serving.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = WsTransport::connect(&format!("ws://{addr}/ws"), "alice", options()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn reconnects_and_replays_subscriptions() {
    let (url, state) = start_broker().await;
    let bob = connect(&url, "bob").await;
    bob.subscribe("/topic/t").await.unwrap();
    wait_for_subscribers(&state, "/topic/t", 1).await;

    state.close_all_connections().await;

    // Probes sent before the replayed subscription lands are simply lost.
    let mut delivered = None;
    for _ in 0..100 {
        state
            .publish("/topic/t", None, b"\"probe\"".to_vec())
            .await
            .unwrap();
        if let Ok(Ok(delivery)) =
            tokio::time::timeout(Duration::from_millis(50), bob.recv()).await
        {
            delivered = Some(delivery);
            break;
        }
    }

    let delivery = delivered.expect("no delivery after reconnect");
    assert_eq!(delivery.destination, "/topic/t");
    assert!(bob.is_connected());
}
