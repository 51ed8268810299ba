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

//! Integration tests for the paged chat cache behind `ChatDataService`.
//!
//! Verifies:
//! 1. Concurrent requests for one page share a single fetch.
//! 2. A loaded page is answered from the cache; `force_refresh` refetches.
//! 3. Neighbor pages are fetched in the background, without cascading.
//! 4. Content already cached for an id wins over later merges.
//! 5. Items of another chat are removed on read and the page refetched.
//! 6. The cached chat count stays bounded and listeners hear evictions.
//! 7. A short page clears `has_more`.
//! 8. A failing chat neither stops the preload queue nor `init_cache`.
//! 9. A failed neighbor load leaves the foreground page alone and is retried
//!    on the next read.
//! 10. Index ranges load only their missing pages, in parallel.
//! 11. A zero page size is clamped instead of dividing by zero.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatcache::cache::CacheConfig;
use chatcache::directory::ChatDirectory;
use chatcache::preload::{PreloadConfig, Preloader};
use chatcache::service::{ChatBackend, ChatDataService, ChatPage, PageState, ServiceError};
use chatcache_proto::message::{
    ChatId, ChatKind, ChatSummary, Message, MessageId, Timestamp, UserId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Backend serving `total` messages per chat, with ids `{chat}-m{index}`.
#[derive(Default)]
struct FakeBackend {
    totals: HashMap<ChatId, usize>,
    failing: HashSet<ChatId>,
    failing_pages: Mutex<HashSet<(ChatId, usize)>>,
    recent: Vec<ChatSummary>,
    delay: Duration,
    fetches: Mutex<Vec<(ChatId, usize)>>,
}

impl FakeBackend {
    fn with_chats(chats: &[(&str, usize)]) -> Self {
        Self {
            totals: chats
                .iter()
                .map(|(id, total)| (ChatId::new(*id), *total))
                .collect(),
            recent: chats
                .iter()
                .map(|(id, _)| ChatSummary::new(*id, ChatKind::Direct))
                .collect(),
            ..Self::default()
        }
    }

    fn failing(mut self, chat: &str) -> Self {
        self.failing.insert(ChatId::new(chat));
        self
    }

    fn failing_page(self, chat: &str, page: usize) -> Self {
        self.failing_pages
            .lock()
            .unwrap()
            .insert((ChatId::new(chat), page));
        self
    }

    fn heal_page(&self, chat: &ChatId, page: usize) {
        self.failing_pages
            .lock()
            .unwrap()
            .remove(&(chat.clone(), page));
    }

    const fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    fn fetched_pages(&self, chat: &ChatId) -> Vec<usize> {
        let mut pages: Vec<usize> = self
            .fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == chat)
            .map(|(_, p)| *p)
            .collect();
        pages.sort_unstable();
        pages
    }
}

fn message(chat: &ChatId, index: usize, content: &str) -> Message {
    Message {
        id: MessageId::new(format!("{chat}-m{index}")),
        chat_id: Some(chat.clone()),
        sender_id: UserId::new("bob"),
        content: content.to_string(),
        timestamp: Timestamp::from_millis(1_000 * index as u64 + 1),
        is_system: false,
    }
}

impl ChatBackend for FakeBackend {
    async fn fetch_page(
        &self,
        chat: &ChatId,
        _user: &UserId,
        page: usize,
        page_size: usize,
    ) -> Result<ChatPage, ServiceError> {
        self.fetches.lock().unwrap().push((chat.clone(), page));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(chat) {
            return Err(ServiceError::Remote {
                message: "chat unavailable".to_string(),
            });
        }
        if self.failing_pages.lock().unwrap().contains(&(chat.clone(), page)) {
            return Err(ServiceError::Remote {
                message: format!("page {page} unavailable"),
            });
        }
        let total = self.totals.get(chat).copied().unwrap_or(0);
        let start = (page * page_size).min(total);
        let end = (start + page_size).min(total);
        Ok(ChatPage {
            messages: (start..end).map(|i| message(chat, i, "server")).collect(),
            total_messages: Some(total),
            total_files: Some(0),
            ..ChatPage::default()
        })
    }

    async fn message_count(&self, chat: &ChatId) -> Result<usize, ServiceError> {
        Ok(self.totals.get(chat).copied().unwrap_or(0))
    }

    async fn recent_chats(&self, _user: &UserId) -> Result<Vec<ChatSummary>, ServiceError> {
        Ok(self.recent.clone())
    }
}

fn config(max_cached_chats: usize, preload_pages: usize) -> CacheConfig {
    CacheConfig {
        page_size: 20,
        max_cached_chats,
        preload_pages,
        ..CacheConfig::default()
    }
}

fn alice() -> UserId {
    UserId::new("alice")
}

/// Yields until `done` holds, giving spawned tasks a chance to run.
async fn settle(done: impl Fn() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Request deduplication and cache hits
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_fetch() {
    let chat = ChatId::new("c1");
    let backend = FakeBackend::with_chats(&[("c1", 20)]).delayed(Duration::from_millis(100));
    let service = ChatDataService::new(backend, config(10, 2));
    let user = alice();

    let results = futures_util::future::join_all(
        (0..5).map(|_| service.get_data(&chat, &user, 0, false)),
    )
    .await;

    assert_eq!(service.backend().fetch_count(), 1);
    for result in results {
        let data = result.unwrap();
        assert_eq!(data.messages.len(), 20);
        assert!(!data.from_cache);
    }
    assert_eq!(service.stats().pending_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn page_is_pending_while_fetch_in_flight() {
    let chat = ChatId::new("c1");
    let backend = FakeBackend::with_chats(&[("c1", 20)]).delayed(Duration::from_millis(100));
    let service = ChatDataService::new(backend, config(10, 0));

    let task = {
        let service = service.clone();
        let chat = chat.clone();
        tokio::spawn(async move { service.get_data(&chat, &alice(), 0, false).await })
    };
    settle(|| service.page_state(&chat, 0) == PageState::Pending).await;
    assert_eq!(service.page_state(&chat, 0), PageState::Pending);

    task.await.unwrap().unwrap();
    assert_eq!(service.page_state(&chat, 0), PageState::Loaded);
}

#[tokio::test]
async fn second_read_is_served_from_cache() {
    let chat = ChatId::new("c1");
    let service = ChatDataService::new(FakeBackend::with_chats(&[("c1", 20)]), config(10, 2));
    let user = alice();

    let first = service.get_data(&chat, &user, 0, false).await.unwrap();
    let second = service.get_data(&chat, &user, 0, false).await.unwrap();

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.messages, second.messages);
    assert_eq!(service.backend().fetch_count(), 1);

    let refreshed = service.get_data(&chat, &user, 0, true).await.unwrap();
    assert!(!refreshed.from_cache);
    assert_eq!(service.backend().fetch_count(), 2);
}

#[tokio::test]
async fn pages_come_back_in_timestamp_order() {
    let chat = ChatId::new("c1");
    let service = ChatDataService::new(FakeBackend::with_chats(&[("c1", 15)]), config(10, 0));

    let data = service.get_data(&chat, &alice(), 0, false).await.unwrap();

    let stamps: Vec<Timestamp> = data.messages.iter().map(|m| m.timestamp).collect();
    let mut sorted = stamps.clone();
    sorted.sort();
    assert_eq!(stamps, sorted);
    assert_eq!(data.messages.len(), 15);
}

// ---------------------------------------------------------------------------
// Neighbor preloading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn neighbor_pages_load_in_background_without_cascading() {
    let chat = ChatId::new("c1");
    let service = ChatDataService::new(FakeBackend::with_chats(&[("c1", 100)]), config(10, 2));

    service.get_data(&chat, &alice(), 0, false).await.unwrap();
    settle(|| service.page_state(&chat, 2) == PageState::Loaded).await;
    // Give a cascading preload the chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(service.backend().fetched_pages(&chat), vec![0, 1, 2]);
    assert_eq!(service.page_state(&chat, 1), PageState::Loaded);
    assert_eq!(service.page_state(&chat, 2), PageState::Loaded);
    assert_eq!(service.page_state(&chat, 3), PageState::Unknown);

    let page_one = service.get_data(&chat, &alice(), 1, false).await.unwrap();
    assert!(page_one.from_cache);
}

#[tokio::test]
async fn short_page_clears_has_more() {
    let chat = ChatId::new("c1");
    let service = ChatDataService::new(FakeBackend::with_chats(&[("c1", 25)]), config(10, 0));

    let data = service.get_data(&chat, &alice(), 1, false).await.unwrap();
    assert_eq!(data.messages.len(), 5);

    let (has_more, total) = service
        .cache()
        .read(&chat, |e| (e.messages.has_more(), e.messages.total_count()))
        .unwrap();
    assert!(!has_more);
    assert_eq!(total, 25);
}

#[tokio::test]
async fn failed_neighbor_load_keeps_foreground_page_and_retries() {
    let chat = ChatId::new("c1");
    let backend = FakeBackend::with_chats(&[("c1", 60)]).failing_page("c1", 1);
    let service = ChatDataService::new(backend, config(10, 1));
    let user = alice();

    let data = service.get_data(&chat, &user, 0, false).await.unwrap();
    assert_eq!(data.messages.len(), 20);
    settle(|| {
        service.backend().fetched_pages(&chat).contains(&1)
            && service.page_state(&chat, 1) != PageState::Pending
    })
    .await;

    assert_eq!(service.page_state(&chat, 0), PageState::Loaded);
    assert_eq!(service.page_state(&chat, 1), PageState::Unknown);
    assert!(service.get_data(&chat, &user, 0, false).await.unwrap().from_cache);

    // The next read of page 1 goes back to the backend.
    assert!(service.get_data(&chat, &user, 1, false).await.is_err());
    service.backend().heal_page(&chat, 1);
    let page_one = service.get_data(&chat, &user, 1, false).await.unwrap();
    assert!(!page_one.from_cache);
    assert_eq!(page_one.messages.len(), 20);
    assert_eq!(service.page_state(&chat, 1), PageState::Loaded);

    let page_one_fetches = service
        .backend()
        .fetched_pages(&chat)
        .into_iter()
        .filter(|p| *p == 1)
        .count();
    assert_eq!(page_one_fetches, 3);
}

#[tokio::test]
async fn zero_page_size_is_clamped() {
    let chat = ChatId::new("c1");
    let service = ChatDataService::new(
        FakeBackend::with_chats(&[("c1", 5)]),
        CacheConfig {
            page_size: 0,
            ..config(10, 2)
        },
    );

    let data = service.get_data(&chat, &alice(), 0, false).await.unwrap();
    assert_eq!(service.cache().config().page_size, 1);
    assert_eq!(data.messages.len(), 1);
    settle(|| {
        service.page_state(&chat, 1) == PageState::Loaded
            && service.page_state(&chat, 2) == PageState::Loaded
    })
    .await;
    assert_eq!(service.backend().fetched_pages(&chat), vec![0, 1, 2]);
}

// ---------------------------------------------------------------------------
// Range loading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn range_loads_only_missing_pages() {
    let chat = ChatId::new("c1");
    let service = ChatDataService::new(FakeBackend::with_chats(&[("c1", 100)]), config(10, 0));
    let user = alice();

    let report = service.load_range(&chat, &user, 25, 70).await;
    assert_eq!(report.fetched, vec![1, 2, 3]);
    assert!(report.failed.is_empty());
    assert_eq!(service.backend().fetched_pages(&chat), vec![1, 2, 3]);
    assert!(!service.all_pages_loaded(&chat));

    let window = service.messages_in_range(&chat, 38, 41);
    let indices: Vec<usize> = window.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![38, 39, 40, 41]);
    assert_eq!(window[0].1.id.as_str(), "c1-m38");

    // Cached pages are skipped and the end is clamped to the message count.
    let report = service.load_range(&chat, &user, 0, 500).await;
    assert_eq!(report.fetched, vec![0, 4]);
    assert_eq!(service.backend().fetch_count(), 5);
    assert!(service.all_pages_loaded(&chat));
    assert!(service.messages_in_range(&chat, 200, 300).is_empty());
}

#[tokio::test]
async fn range_reports_failed_pages() {
    let chat = ChatId::new("c1");
    let backend = FakeBackend::with_chats(&[("c1", 60)]).failing_page("c1", 2);
    let service = ChatDataService::new(backend, config(10, 0));

    let report = service.load_range(&chat, &alice(), 0, 59).await;
    assert_eq!(report.fetched, vec![0, 1]);
    assert_eq!(report.failed, vec![2]);
    assert_eq!(service.page_state(&chat, 2), PageState::Unknown);
    assert!(!service.all_pages_loaded(&chat));
    assert!(!service.all_pages_loaded(&ChatId::new("unknown")));
}

// ---------------------------------------------------------------------------
// Merge rules and repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_cached_content_wins() {
    let chat = ChatId::new("c1");
    let service = ChatDataService::new(FakeBackend::with_chats(&[("c1", 1)]), config(10, 0));

    let page = |content: &str| ChatPage {
        messages: vec![message(&chat, 0, content)],
        total_messages: Some(1),
        total_files: Some(0),
        ..ChatPage::default()
    };
    service.add_chat_data_page(&chat, page("first"), 0);
    service.add_chat_data_page(&chat, page("second"), 0);

    let data = service.get_data(&chat, &alice(), 0, false).await.unwrap();
    assert!(data.from_cache);
    assert_eq!(data.messages.len(), 1);
    assert_eq!(data.messages[0].content, "first");
    assert_eq!(service.backend().fetch_count(), 0);
}

#[tokio::test]
async fn live_message_lands_after_loaded_history() {
    let chat = ChatId::new("c1");
    let service = ChatDataService::new(FakeBackend::with_chats(&[("c1", 3)]), config(10, 0));
    service.get_data(&chat, &alice(), 0, false).await.unwrap();

    let mut live = message(&chat, 50, "live");
    live.chat_id = None;
    assert!(service.add_message(&chat, live.clone()));
    assert!(!service.add_message(&chat, live));

    let data = service.get_data(&chat, &alice(), 0, false).await.unwrap();
    assert!(data.from_cache);
    assert_eq!(data.messages.len(), 4);
    let last = data.messages.last().unwrap();
    assert_eq!(last.content, "live");
    assert_eq!(last.chat_id, Some(chat.clone()));
    assert!(data.timeline.iter().any(|t| t.id.as_str() == "msg:c1-m50"));
}

#[tokio::test]
async fn foreign_items_are_dropped_and_page_refetched() {
    let chat = ChatId::new("a");
    let other = ChatId::new("b");
    let service = ChatDataService::new(FakeBackend::with_chats(&[("a", 3)]), config(10, 0));

    let mut stray = message(&chat, 1, "stray");
    stray.chat_id = Some(other.clone());
    let mut unlabeled = message(&chat, 2, "cached");
    unlabeled.chat_id = None;
    service.add_chat_data_page(
        &chat,
        ChatPage {
            messages: vec![message(&chat, 0, "cached"), stray, unlabeled],
            total_messages: Some(3),
            total_files: Some(0),
            ..ChatPage::default()
        },
        0,
    );

    let report = service.cache().validate_entry(&chat).unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.backfilled, 1);
    assert!(report.pages_unmarked >= 1);
    assert_eq!(service.page_state(&chat, 0), PageState::Unknown);

    let data = service.get_data(&chat, &alice(), 0, false).await.unwrap();
    assert!(!data.from_cache);
    assert_eq!(service.backend().fetch_count(), 1);
    assert_eq!(data.messages.len(), 3);
    assert!(data.messages.iter().all(|m| m.chat_id.as_ref() == Some(&chat)));
    assert_eq!(data.messages[1].content, "server");
    assert_eq!(data.messages[2].content, "cached");

    let again = service.cache().validate_entry(&chat).unwrap();
    assert!(again.is_clean());
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn eviction_keeps_bound_and_notifies_listeners() {
    let service = ChatDataService::new(
        FakeBackend::with_chats(&[("c1", 5), ("c2", 5), ("c3", 5), ("c4", 5)]),
        config(2, 0),
    );
    let evicted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&evicted);
    let listener = service.add_eviction_listener(move |chat| {
        sink.lock().unwrap().push(chat.clone());
    });
    let user = alice();
    let (c1, c2, c3, c4) = (
        ChatId::new("c1"),
        ChatId::new("c2"),
        ChatId::new("c3"),
        ChatId::new("c4"),
    );

    service.get_data(&c1, &user, 0, false).await.unwrap();
    service.get_data(&c2, &user, 0, false).await.unwrap();
    service.get_data(&c3, &user, 0, false).await.unwrap();

    assert_eq!(service.cache().len(), 2);
    assert_eq!(*evicted.lock().unwrap(), vec![c1.clone()]);
    assert!(!service.cache().has_entry(&c1));

    // Reading c2 makes c3 the least recently used.
    assert!(service.get_data(&c2, &user, 0, false).await.unwrap().from_cache);
    assert!(service.remove_eviction_listener(listener));
    service.get_data(&c4, &user, 0, false).await.unwrap();

    assert!(service.cache().has_entry(&c2));
    assert!(!service.cache().has_entry(&c3));
    assert_eq!(evicted.lock().unwrap().len(), 1);

    let stats = service.stats();
    assert_eq!(stats.cached_chats, 2);
    assert_eq!(stats.access_order_len, 2);
    assert!(stats.needs_cleanup);
}

#[tokio::test]
async fn clearing_does_not_notify_listeners() {
    let service = ChatDataService::new(FakeBackend::with_chats(&[("c1", 5)]), config(2, 0));
    let calls = Arc::new(Mutex::new(0_usize));
    let sink = Arc::clone(&calls);
    service.add_eviction_listener(move |_| *sink.lock().unwrap() += 1);

    let chat = ChatId::new("c1");
    service.get_data(&chat, &alice(), 0, false).await.unwrap();
    assert!(service.clear_chat_cache(&chat));
    assert!(!service.clear_chat_cache(&chat));
    service.get_data(&chat, &alice(), 0, false).await.unwrap();
    service.clear();

    assert!(service.cache().is_empty());
    assert_eq!(*calls.lock().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn preload_failure_does_not_stop_queue() {
    let backend = FakeBackend::with_chats(&[("good1", 5), ("bad", 5), ("good2", 5)]).failing("bad");
    let service = ChatDataService::new(backend, config(10, 0));
    let preloader = Preloader::new(
        service.clone(),
        Arc::new(ChatDirectory::new()),
        PreloadConfig {
            item_delay: Duration::from_millis(1),
            ..PreloadConfig::default()
        },
    );
    preloader.set_user(alice());

    for id in ["good1", "bad", "good2"] {
        assert!(preloader.schedule(&ChatSummary::new(id, ChatKind::Direct)));
    }
    assert!(!preloader.schedule(&ChatSummary::new("good1", ChatKind::Direct)));

    assert_eq!(preloader.process_queue().await, 2);
    assert!(preloader.is_preloaded(&ChatId::new("good1")));
    assert!(preloader.is_preloaded(&ChatId::new("good2")));
    assert!(!preloader.is_preloaded(&ChatId::new("bad")));
    assert_eq!(preloader.stats().queued, 0);
    assert_eq!(preloader.stats().preloaded, 2);

    // The failed chat was forgotten and can be queued again.
    assert!(preloader.schedule(&ChatSummary::new("bad", ChatKind::Direct)));
}

#[tokio::test]
async fn groups_preload_before_direct_chats() {
    let backend = FakeBackend::with_chats(&[("d1", 1), ("g1", 1), ("d2", 1)]);
    let service = ChatDataService::new(backend, config(10, 0));
    let preloader = Preloader::new(
        service.clone(),
        Arc::new(ChatDirectory::new()),
        PreloadConfig {
            item_delay: Duration::ZERO,
            ..PreloadConfig::default()
        },
    );
    preloader.set_user(alice());

    preloader.schedule(&ChatSummary::new("d1", ChatKind::Direct));
    preloader.schedule(&ChatSummary::new("g1", ChatKind::Group));
    preloader.schedule(&ChatSummary::new("d2", ChatKind::Direct));
    preloader.process_queue().await;

    let order: Vec<ChatId> = service
        .backend()
        .fetches
        .lock()
        .unwrap()
        .iter()
        .map(|(c, _)| c.clone())
        .collect();
    assert_eq!(
        order,
        vec![ChatId::new("g1"), ChatId::new("d1"), ChatId::new("d2")]
    );
}

#[tokio::test]
async fn init_cache_loads_active_chat_first_and_reports_failures() {
    let backend = FakeBackend::with_chats(&[("a", 5), ("bad", 5), ("c", 5)]).failing("bad");
    let service = ChatDataService::new(backend, config(10, 0));
    let active = ChatId::new("c");

    let report = service.init_cache(&alice(), Some(&active)).await.unwrap();

    assert_eq!(report.loaded.first(), Some(&active));
    assert_eq!(report.loaded.len(), 2);
    assert!(report.loaded.contains(&ChatId::new("a")));
    assert_eq!(report.failed, vec![ChatId::new("bad")]);
    assert_eq!(service.page_state(&ChatId::new("a"), 0), PageState::Loaded);
    assert_eq!(service.page_state(&ChatId::new("bad"), 0), PageState::Unknown);
}
