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

//! Integration tests for correlated calls over the loopback broker, and for
//! the batch loader that supervises chat loads.
//!
//! Verifies:
//! 1. A call resolves with the payload published to its success destination.
//! 2. An answer on the error destination becomes `CallError::Remote`.
//! 3. Handlers are removed after success, error, timeout and cancellation.
//! 4. Overlapping calls on per-request destinations never see each other's
//!    answers.
//! 5. Decryption merges answers by id and keeps what the server left out.
//! 6. A stalled load is requeued at the front until its retries run out,
//!    then the queue moves on.

use std::sync::Arc;
use std::time::Duration;

use chatcache::correlation::{CallError, CallOptions, CorrelatedClient};
use chatcache::decrypt::{DECRYPT_MESSAGES_ACTION, DecryptConfig, DecryptionClient};
use chatcache::loader::{BatchLoader, LoadStatus, LoaderConfig, LoaderEvent, UnitStatus};
use chatcache::router::Router;
use chatcache::transport::Transport;
use chatcache::transport::channel::Channel;
use chatcache::transport::loopback::{LoopbackBroker, LoopbackTransport};
use chatcache_proto::message::{ChatId, Message, MessageId, Timestamp, UserId};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Connects `alice` and returns her client with its pump running.
fn alice_client(broker: &LoopbackBroker, timeout: Duration) -> CorrelatedClient<LoopbackTransport> {
    let channel = Channel::new(Arc::new(broker.connect("alice")), Arc::new(Router::new()));
    let _pump = channel.spawn_pump();
    CorrelatedClient::new(channel, timeout)
}

/// Subscribes a server connection to `action` and answers every request
/// with `answer`: `Ok` goes to the success destination, `Err` to the error
/// destination.
async fn spawn_responder<F>(broker: &LoopbackBroker, action: &str, answer: F) -> JoinHandle<()>
where
    F: Fn(&Value) -> Result<Value, Value> + Send + 'static,
{
    let server = broker.connect("server");
    server.subscribe(action).await.unwrap();
    tokio::spawn(async move {
        while let Ok(delivery) = server.recv().await {
            let Some(reply_to) = delivery.reply_to else {
                continue;
            };
            let request: Value = serde_json::from_slice(&delivery.body).unwrap();
            let (destination, body) = match answer(&request) {
                Ok(v) => (reply_to.success, v),
                Err(v) => (reply_to.error, v),
            };
            server
                .publish(&destination, None, serde_json::to_vec(&body).unwrap())
                .await
                .unwrap();
        }
    })
}

fn assert_no_handlers(client: &CorrelatedClient<LoopbackTransport>, options: &CallOptions) {
    let router = client.channel().router();
    assert_eq!(router.handler_count(&options.success_destination), 0);
    assert_eq!(router.handler_count(&options.error_destination), 0);
}

/// Waits for the background unsubscribe of a per-request destination.
async fn wait_unsubscribed(broker: &LoopbackBroker, destination: &str) {
    for _ in 0..100 {
        if broker.subscriber_count(destination) == 0 {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("{destination} still subscribed");
}

fn encrypted(id: &str, ts: u64) -> Message {
    Message {
        id: MessageId::new(id),
        chat_id: Some(ChatId::new("c1")),
        sender_id: UserId::new("bob"),
        content: format!("cipher:{id}"),
        timestamp: Timestamp::from_millis(ts),
        is_system: false,
    }
}

// ---------------------------------------------------------------------------
// Correlated calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_resolves_with_success_payload_and_cleans_up() {
    let broker = LoopbackBroker::new();
    let _server = spawn_responder(&broker, "/app/echo", |req| Ok(json!({ "echo": req }))).await;
    let client = alice_client(&broker, Duration::from_secs(5));
    let options = CallOptions::for_request(&UserId::new("alice"), "echo");

    let answer = client
        .call("/app/echo", &json!({ "n": 1 }), options.clone())
        .await
        .unwrap();

    assert_eq!(answer, json!({ "echo": { "n": 1 } }));
    assert_no_handlers(&client, &options);
    wait_unsubscribed(&broker, &options.success_destination).await;
    wait_unsubscribed(&broker, &options.error_destination).await;
}

#[tokio::test]
async fn error_destination_yields_remote_error() {
    let broker = LoopbackBroker::new();
    let _server = spawn_responder(&broker, "/app/deny", |_| {
        Err(json!({ "error": { "message": "not a member" } }))
    })
    .await;
    let client = alice_client(&broker, Duration::from_secs(5));
    let options = CallOptions::for_request(&UserId::new("alice"), "deny");

    let result = client.call("/app/deny", &json!({}), options.clone()).await;

    match result {
        Err(CallError::Remote { message }) => assert_eq!(message, "not a member"),
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_no_handlers(&client, &options);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_cleans_up() {
    let broker = LoopbackBroker::new();
    let client = alice_client(&broker, Duration::from_secs(30));
    let options =
        CallOptions::for_request(&UserId::new("alice"), "void").with_timeout(Duration::from_secs(3));

    let result = client.call("/app/void", &json!({}), options.clone()).await;

    assert!(matches!(result, Err(CallError::Timeout(d)) if d == Duration::from_secs(3)));
    assert_eq!(broker.publish_count("/app/void"), 1);
    assert_no_handlers(&client, &options);
}

#[tokio::test(start_paused = true)]
async fn dropped_call_cleans_up() {
    let broker = LoopbackBroker::new();
    let client = alice_client(&broker, Duration::from_secs(30));
    let options = CallOptions::for_request(&UserId::new("alice"), "void");

    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        client.call("/app/void", &json!({}), options.clone()),
    )
    .await;

    assert!(cancelled.is_err());
    assert_no_handlers(&client, &options);
    wait_unsubscribed(&broker, &options.success_destination).await;
}

#[tokio::test]
async fn overlapping_calls_get_their_own_answers() {
    let broker = LoopbackBroker::new();
    let _server =
        spawn_responder(&broker, "/app/square", |req| Ok(json!(req["n"].as_i64().unwrap().pow(2))))
            .await;
    let client = alice_client(&broker, Duration::from_secs(5));
    let user = UserId::new("alice");

    let calls = (1..=5).map(|n| {
        let client = client.clone();
        let options = CallOptions::for_request(&user, "square");
        async move { client.call("/app/square", &json!({ "n": n }), options).await }
    });
    let answers: Vec<Value> = futures_util::future::join_all(calls)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(answers, vec![json!(1), json!(4), json!(9), json!(16), json!(25)]);
}

#[tokio::test]
async fn subscribing_to_another_users_queue_is_rejected() {
    let broker = LoopbackBroker::new();
    let client = alice_client(&broker, Duration::from_secs(5));
    let options = CallOptions::for_request(&UserId::new("mallory"), "peek");

    let result = client.call("/app/peek", &json!({}), options.clone()).await;

    assert!(matches!(result, Err(CallError::Transport(_))));
    assert_eq!(broker.publish_count("/app/peek"), 0);
    assert_no_handlers(&client, &options);
}

// ---------------------------------------------------------------------------
// Decryption
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn decryption_merges_by_id_across_chunks() {
    let broker = LoopbackBroker::new();
    // Decrypts every message except `m2`.
    let _server = spawn_responder(&broker, DECRYPT_MESSAGES_ACTION, |req| {
        let messages: Vec<Value> = req["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["id"] != "m2")
            .map(|m| json!({ "id": m["id"], "content": format!("plain:{}", m["id"].as_str().unwrap()) }))
            .collect();
        Ok(json!({ "messages": messages }))
    })
    .await;
    let client = alice_client(&broker, Duration::from_secs(5));
    let decrypt = DecryptionClient::new(
        client,
        UserId::new("alice"),
        DecryptConfig {
            chunk_size: 2,
            ..DecryptConfig::default()
        },
    );

    let input = vec![encrypted("m1", 1), encrypted("m2", 2), encrypted("m3", 3)];
    let out = decrypt
        .decrypt_messages(&ChatId::new("c1"), input.clone())
        .await
        .unwrap();

    assert_eq!(broker.publish_count(DECRYPT_MESSAGES_ACTION), 2);
    let contents: Vec<&str> = out.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["plain:m1", "cipher:m2", "plain:m3"]);
    for (before, after) in input.iter().zip(&out) {
        assert_eq!(before.id, after.id);
        assert_eq!(before.timestamp, after.timestamp);
    }
}

#[tokio::test]
async fn single_decryption_with_empty_answer_is_an_error() {
    let broker = LoopbackBroker::new();
    let _server =
        spawn_responder(&broker, DECRYPT_MESSAGES_ACTION, |_| Ok(json!({ "messages": [] }))).await;
    let decrypt = DecryptionClient::new(
        alice_client(&broker, Duration::from_secs(5)),
        UserId::new("alice"),
        DecryptConfig::default(),
    );

    let result = decrypt
        .decrypt_message(&ChatId::new("c1"), encrypted("m1", 1))
        .await;

    assert!(matches!(result, Err(CallError::Remote { .. })));
}

// ---------------------------------------------------------------------------
// Stuck-unit supervision
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stuck_unit_is_requeued_until_retries_run_out() {
    let loader = BatchLoader::new(
        |chat: ChatId| async move {
            if chat.as_str() == "hang" {
                std::future::pending::<()>().await;
            }
            Ok::<(), String>(())
        },
        LoaderConfig {
            stuck_timeout: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            max_retries: 3,
        },
    );
    let mut events = loader.subscribe();
    loader.enqueue(ChatId::new("hang"));
    loader.enqueue(ChatId::new("next"));
    let _tasks = loader.spawn();

    let hang = ChatId::new("hang");
    for retries in 1..=3 {
        assert_eq!(
            events.recv().await.unwrap(),
            LoaderEvent::Stuck {
                chat_id: hang.clone(),
                retries
            }
        );
    }
    match events.recv().await.unwrap() {
        LoaderEvent::Failed {
            chat_id, retries, ..
        } => {
            assert_eq!(chat_id, hang);
            assert_eq!(retries, 4);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        events.recv().await.unwrap(),
        LoaderEvent::Loaded(ChatId::new("next"))
    );

    assert_eq!(
        loader.unit_status(&hang),
        Some(UnitStatus {
            status: LoadStatus::Error,
            retries: 4
        })
    );
    let status = loader.status();
    assert_eq!(status.error, 1);
    assert_eq!(status.loaded, 1);
    assert_eq!(status.loading + status.pending + status.stuck, 0);
}
