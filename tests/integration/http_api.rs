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

//! REST API tests using wiremock.
//!
//! Verifies that `HttpApi` calls the chat service's endpoints with the
//! expected paths and query parameters, normalizes what comes back, and
//! reports failures; and that `RemoteBackend` decrypts fetched pages over
//! the broker, falling back to the ciphertext when decryption fails.

use std::sync::Arc;
use std::time::Duration;

use chatcache::api::{ApiError, HttpApi, RestApi};
use chatcache::cache::CacheConfig;
use chatcache::correlation::CorrelatedClient;
use chatcache::decrypt::{DECRYPT_MESSAGES_ACTION, DecryptConfig, DecryptionClient};
use chatcache::router::Router;
use chatcache::service::{ChatDataService, RemoteBackend};
use chatcache::transport::Transport;
use chatcache::transport::channel::Channel;
use chatcache::transport::loopback::{LoopbackBroker, LoopbackTransport};
use chatcache_proto::message::{ChatId, ChatKind, FileId, MessageId, Timestamp, UserId};
use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper to build an API client for the mock server.
fn api_for(server: &MockServer) -> HttpApi {
    HttpApi::new(&format!("{}/", server.uri()), Duration::from_secs(2)).unwrap()
}

fn alice() -> UserId {
    UserId::new("alice")
}

/// Helper to build a decryption client on the loopback broker.
fn decryption(broker: &LoopbackBroker, config: DecryptConfig) -> DecryptionClient<LoopbackTransport> {
    let channel = Channel::new(Arc::new(broker.connect("alice")), Arc::new(Router::new()));
    let _pump = channel.spawn_pump();
    DecryptionClient::new(
        CorrelatedClient::new(channel, Duration::from_secs(5)),
        alice(),
        config,
    )
}

/// Mounts a chat page for `c1` containing two encrypted messages.
async fn mount_encrypted_page(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/message-tracker/messages/chatId/c1/count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(2)))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/chat/c1/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                { "id": "m1", "chatId": "c1", "senderId": "bob", "content": "enc:1", "timestamp": 1000 },
                { "id": "m2", "chatId": "c1", "senderId": "bob", "content": "enc:2", "timestamp": 2000 },
            ],
            "pagination": { "totalMessages": 2, "totalFiles": 0 },
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn recent_chats_are_requested_and_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/message-tracker/messages/recent/alice"))
        .and(query_param("page", "0"))
        .and(query_param("pageSize", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "direct": [{ "chatId": "c1", "username": "bob", "lastMessageTime": 200 }],
                "groups": [{ "chatId": "g1", "chatName": "Team", "lastMessage": { "content": "hi" } }],
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let chats = api_for(&server).recent_chats(&alice(), 0, 20).await.unwrap();

    assert_eq!(chats.len(), 2);
    let direct = chats.iter().find(|c| c.id.as_str() == "c1").unwrap();
    assert_eq!(direct.kind, ChatKind::Direct);
    assert_eq!(direct.name.as_deref(), Some("bob"));
    assert_eq!(direct.last_activity, Some(Timestamp::from_millis(200)));
    let group = chats.iter().find(|c| c.id.as_str() == "g1").unwrap();
    assert_eq!(group.kind, ChatKind::Group);
    assert_eq!(group.last_message.as_deref(), Some("hi"));
}

#[tokio::test]
async fn message_count_accepts_wrapped_numbers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/message-tracker/messages/chatId/c1/count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "count": "42" })))
        .mount(&server)
        .await;

    let count = api_for(&server).message_count(&ChatId::new("c1")).await.unwrap();
    assert_eq!(count, 42);
}

#[tokio::test]
async fn chat_page_carries_user_and_paging() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chat/c1/data"))
        .and(query_param("userId", "alice"))
        .and(query_param("page", "1"))
        .and(query_param("pageSize", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "messages": [
                    { "messageId": "m2", "senderId": "bob", "content": "later", "createdAt": "2024-01-01T00:00:01Z" },
                    { "messageId": "m1", "senderId": "bob", "content": "earlier", "createdAt": "2024-01-01T00:00:00Z" },
                ],
                "files": [
                    { "fileId": "f1", "originalFileName": "a.png", "fileSize": 10, "mimeType": "image/png", "uploadedAt": 1704067200500_u64 },
                ],
                "pagination": { "totalMessages": 45, "totalFiles": 3 },
            }
        })))
        .mount(&server)
        .await;

    let page = api_for(&server)
        .chat_page(&ChatId::new("c1"), &alice(), 1, 20)
        .await
        .unwrap();

    assert_eq!(page.messages.len(), 2);
    let m1 = page.messages.iter().find(|m| m.id == MessageId::new("m1")).unwrap();
    assert_eq!(m1.timestamp, Timestamp::from_millis(1_704_067_200_000));
    assert_eq!(page.files.len(), 1);
    assert_eq!(page.files[0].id, FileId::new("f1"));
    assert_eq!(page.files[0].name, "a.png");
    assert_eq!(page.files[0].mime_type.as_deref(), Some("image/png"));
    assert_eq!(page.total_messages, Some(45));
    assert_eq!(page.total_files, Some(3));
}

#[tokio::test]
async fn recent_files_are_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/files/recent/alice"))
        .and(query_param("page", "0"))
        .and(query_param("pageSize", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "fileId": "f1", "chatId": "c1", "fileName": "doc.pdf", "size": 99 },
            { "fileName": "no id, skipped" },
        ])))
        .mount(&server)
        .await;

    let files = api_for(&server).recent_files(&alice(), 0, 5).await.unwrap();

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].chat_id, Some(ChatId::new("c1")));
    assert_eq!(files[0].size, 99);
}

#[tokio::test]
async fn error_status_is_reported_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/message-tracker/messages/chatId/c1/count"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let result = api_for(&server).message_count(&ChatId::new("c1")).await;

    match result {
        Err(ApiError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn unexpected_shapes_are_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chat/c1/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["not", "a", "page"])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/message-tracker/messages/chatId/c1/count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "unrelated": true })))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let chat = ChatId::new("c1");
    assert!(matches!(
        api.chat_page(&chat, &alice(), 0, 20).await,
        Err(ApiError::Shape(_))
    ));
    assert!(matches!(api.message_count(&chat).await, Err(ApiError::Shape(_))));
}

#[tokio::test]
async fn remote_backend_decrypts_fetched_pages() {
    let server = MockServer::start().await;
    mount_encrypted_page(&server).await;

    let broker = LoopbackBroker::new();
    let responder = broker.connect("crypto");
    responder.subscribe(DECRYPT_MESSAGES_ACTION).await.unwrap();
    let _responder = tokio::spawn(async move {
        while let Ok(delivery) = responder.recv().await {
            let reply_to = delivery.reply_to.unwrap();
            let request: Value = serde_json::from_slice(&delivery.body).unwrap();
            let plain: Vec<Value> = request["messages"]
                .as_array()
                .unwrap()
                .iter()
                .map(|m| {
                    let content = m["content"].as_str().unwrap().replace("enc:", "plain:");
                    json!({ "id": m["id"], "content": content })
                })
                .collect();
            let body = serde_json::to_vec(&json!({ "messages": plain })).unwrap();
            responder.publish(&reply_to.success, None, body).await.unwrap();
        }
    });

    let backend = RemoteBackend::new(
        api_for(&server),
        decryption(&broker, DecryptConfig::default()),
        20,
    );
    let service = ChatDataService::new(backend, CacheConfig::default());

    let data = service
        .get_data(&ChatId::new("c1"), &alice(), 0, false)
        .await
        .unwrap();

    let contents: Vec<&str> = data.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["plain:1", "plain:2"]);
    assert_eq!(broker.publish_count(DECRYPT_MESSAGES_ACTION), 1);
}

#[tokio::test]
async fn failed_decryption_keeps_ciphertext() {
    let server = MockServer::start().await;
    mount_encrypted_page(&server).await;

    // Nobody answers decryption requests.
    let broker = LoopbackBroker::new();
    let backend = RemoteBackend::new(
        api_for(&server),
        decryption(
            &broker,
            DecryptConfig {
                batch_timeout: Duration::from_millis(100),
                ..DecryptConfig::default()
            },
        ),
        20,
    );
    let service = ChatDataService::new(backend, CacheConfig::default());

    let data = service
        .get_data(&ChatId::new("c1"), &alice(), 0, false)
        .await
        .unwrap();

    let contents: Vec<&str> = data.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["enc:1", "enc:2"]);
}
