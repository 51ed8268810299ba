//! Per-chat paged cache.
//!
//! [`ChatCache`] owns one [`ChatCacheEntry`] per chat behind a single
//! `parking_lot::Mutex`. Every merge runs to completion under that lock
//! without awaiting, so readers never observe a half-merged page.
//!
//! Entries are created lazily, touched on every read and write, and evicted
//! least-recently-used first once more than `max_cached_chats` exist.
//! Eviction listeners run after the lock has been released.

pub mod entry;
pub mod paged;
pub mod pending;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatcache_proto::message::{ChatId, FileItem, Message, TimelineItem};
use parking_lot::Mutex;

pub use entry::{ChatCacheEntry, CountHints, StreamKind, StreamSelect, ValidationReport};
pub use paged::{CacheItem, PagedStream};
pub use pending::{PendingRequests, RequestKey};
use policy::AccessOrder;

/// Cache sizing. Immutable once the cache is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Items per page in every stream.
    pub page_size: usize,
    /// Chats kept before the least recently used is evicted.
    pub max_cached_chats: usize,
    /// Pages on each side of a foreground load to fetch speculatively.
    pub preload_pages: usize,
    /// Fraction of `max_cached_chats` at which the cache reports it needs
    /// cleanup.
    pub cleanup_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            max_cached_chats: 100,
            preload_pages: 2,
            cleanup_threshold: 0.8,
        }
    }
}

impl CacheConfig {
    /// Returns a copy that the cache can run with: `page_size` and
    /// `max_cached_chats` are at least 1 and `cleanup_threshold` lies in
    /// `0.0..=1.0` (NaN becomes the default).
    #[must_use]
    pub fn normalized(self) -> Self {
        let cleanup_threshold = if self.cleanup_threshold.is_nan() {
            Self::default().cleanup_threshold
        } else {
            self.cleanup_threshold.clamp(0.0, 1.0)
        };
        Self {
            page_size: self.page_size.max(1),
            max_cached_chats: self.max_cached_chats.max(1),
            preload_pages: self.preload_pages,
            cleanup_threshold,
        }
    }

    /// Whether `cached` chats is at or past the cleanup threshold.
    #[must_use]
    pub fn needs_cleanup(&self, cached: usize) -> bool {
        cached as f64 >= self.cleanup_threshold * self.max_cached_chats as f64
    }
}

/// Handle returned by [`ChatCache::add_eviction_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type EvictionListener = Arc<dyn Fn(&ChatId) + Send + Sync>;

struct CacheState {
    entries: HashMap<ChatId, ChatCacheEntry>,
    access: AccessOrder,
}

/// The per-chat cache.
pub struct ChatCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    listeners: Mutex<Vec<(ListenerId, EvictionListener)>>,
    next_listener: AtomicU64,
}

impl ChatCache {
    /// Creates an empty cache. `config` is [normalized](CacheConfig::normalized)
    /// first.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let normalized = config.normalized();
        if normalized != config {
            tracing::warn!(requested = ?config, using = ?normalized, "cache config adjusted");
        }
        let config = normalized;
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                access: AccessOrder::new(config.max_cached_chats),
            }),
            config,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    /// The cache's configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Creates the entry for `chat` if it does not exist, seeding totals
    /// from `hints`. Returns whether it was created. May evict other chats.
    pub fn ensure_entry(&self, chat: &ChatId, hints: CountHints) -> bool {
        let (created, evicted) = {
            let mut state = self.state.lock();
            let created = !state.entries.contains_key(chat);
            if created {
                state.entries.insert(
                    chat.clone(),
                    ChatCacheEntry::new(chat.clone(), self.config.page_size, hints),
                );
                tracing::debug!(chat_id = %chat, "cache entry created");
            }
            state.access.touch(chat);
            let evicted = if created {
                self.evict_locked(&mut state, chat)
            } else {
                Vec::new()
            };
            (created, evicted)
        };
        self.notify_evicted(&evicted);
        created
    }

    /// Whether an entry for `chat` exists.
    #[must_use]
    pub fn has_entry(&self, chat: &ChatId) -> bool {
        self.state.lock().entries.contains_key(chat)
    }

    /// Runs `f` against the entry for `chat` and touches it. `None` if the
    /// chat is not cached.
    pub fn read<R>(&self, chat: &ChatId, f: impl FnOnce(&ChatCacheEntry) -> R) -> Option<R> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(chat)?;
        entry.touch();
        let result = f(entry);
        state.access.touch(chat);
        Some(result)
    }

    /// Items of a loaded page, or `None` (miss) if the page is not loaded.
    pub fn get_page<T: StreamSelect>(&self, chat: &ChatId, page: usize) -> Option<Vec<T>> {
        self.read(chat, |entry| T::stream(entry).page(page)).flatten()
    }

    /// Merges one page of items. Returns the number of new items.
    pub fn add_page<T: StreamSelect>(&self, chat: &ChatId, items: Vec<T>, page: usize) -> usize {
        let count = items.len();
        let added = self.mutate(chat, |entry| {
            let added = T::stream_mut(entry).add_page(items, page);
            T::after_merge(entry);
            added
        });
        tracing::debug!(chat_id = %chat, kind = %T::KIND, page, count, added, "page merged");
        added
    }

    /// Merges a combined page of messages, files and timeline atomically.
    pub fn add_chat_data_page(
        &self,
        chat: &ChatId,
        messages: Vec<Message>,
        files: Vec<FileItem>,
        timeline: Vec<TimelineItem>,
        page: usize,
    ) {
        let counts = (messages.len(), files.len(), timeline.len());
        self.mutate(chat, |entry| {
            entry.messages.add_page(messages, page);
            entry.files.add_page(files, page);
            entry.timeline.add_page(timeline, page);
            entry.synthesize_file_timeline();
        });
        tracing::debug!(
            chat_id = %chat,
            page,
            messages = counts.0,
            files = counts.1,
            timeline = counts.2,
            "chat data page merged"
        );
    }

    /// Appends a live item. Returns `false` if it was already cached.
    pub fn add_single<T: StreamSelect>(&self, chat: &ChatId, item: T) -> bool {
        self.mutate(chat, |entry| {
            let added = T::stream_mut(entry).add_single(item);
            if added {
                T::after_merge(entry);
            }
            added
        })
    }

    /// Raises the known totals of a chat's streams.
    pub fn raise_totals(&self, chat: &ChatId, hints: CountHints) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(chat) {
            if let Some(n) = hints.messages {
                entry.messages.raise_total(n);
            }
            if let Some(n) = hints.files {
                entry.files.raise_total(n);
            }
            if let Some(n) = hints.timeline {
                entry.timeline.raise_total(n);
            }
        }
    }

    /// Repairs the entry for `chat`, logging what was fixed. `None` if the
    /// chat is not cached.
    pub fn validate_entry(&self, chat: &ChatId) -> Option<ValidationReport> {
        let report = self.state.lock().entries.get_mut(chat)?.validate();
        if !report.is_clean() {
            tracing::warn!(
                chat_id = %chat,
                removed = report.removed,
                backfilled = report.backfilled,
                pages_unmarked = report.pages_unmarked,
                "cache entry repaired"
            );
        }
        Some(report)
    }

    /// Whether every stream of `chat` has been loaded to the end.
    #[must_use]
    pub fn is_fully_loaded(&self, chat: &ChatId) -> bool {
        self.state
            .lock()
            .entries
            .get(chat)
            .is_some_and(ChatCacheEntry::is_fully_loaded)
    }

    /// Whether `page` of `T`'s stream is loaded for `chat`.
    #[must_use]
    pub fn is_page_loaded<T: StreamSelect>(&self, chat: &ChatId, page: usize) -> bool {
        self.state
            .lock()
            .entries
            .get(chat)
            .is_some_and(|e| T::stream(e).is_page_loaded(page))
    }

    /// Known total of `T`'s stream for `chat`.
    #[must_use]
    pub fn total_count<T: StreamSelect>(&self, chat: &ChatId) -> Option<usize> {
        self.state
            .lock()
            .entries
            .get(chat)
            .map(|e| T::stream(e).total_count())
    }

    /// Marks `chat` as most recently used.
    pub fn touch(&self, chat: &ChatId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(chat) {
            entry.touch();
            state.access.touch(chat);
        }
    }

    /// Removes one chat. Eviction listeners are not called.
    pub fn clear_chat(&self, chat: &ChatId) -> bool {
        let mut state = self.state.lock();
        state.access.remove(chat);
        state.entries.remove(chat).is_some()
    }

    /// Removes everything. Eviction listeners are not called.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.access.clear();
    }

    /// Number of cached chats.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no chat is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Length of the access order.
    #[must_use]
    pub fn access_order_len(&self) -> usize {
        self.state.lock().access.len()
    }

    /// Cached chat ids from least to most recently used.
    #[must_use]
    pub fn access_order(&self) -> Vec<ChatId> {
        self.state.lock().access.iter().cloned().collect()
    }

    /// Registers a callback run once for every evicted chat.
    pub fn add_eviction_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChatId) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn remove_eviction_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Applies `f` to the entry for `chat`, creating it if needed, then
    /// enforces the size bound.
    fn mutate<R>(&self, chat: &ChatId, f: impl FnOnce(&mut ChatCacheEntry) -> R) -> R {
        let (result, evicted) = {
            let mut state = self.state.lock();
            let page_size = self.config.page_size;
            let entry = state
                .entries
                .entry(chat.clone())
                .or_insert_with(|| ChatCacheEntry::new(chat.clone(), page_size, CountHints::default()));
            let result = f(entry);
            entry.mark_updated();
            state.access.touch(chat);
            let evicted = self.evict_locked(&mut state, chat);
            (result, evicted)
        };
        self.notify_evicted(&evicted);
        result
    }

    fn evict_locked(&self, state: &mut CacheState, protect: &ChatId) -> Vec<ChatId> {
        let victims = policy::select_victims(
            &state.entries,
            &state.access,
            self.config.max_cached_chats,
            protect,
        );
        for chat in &victims {
            state.entries.remove(chat);
            state.access.remove(chat);
            tracing::debug!(chat_id = %chat, "cache entry evicted");
        }
        victims
    }

    fn notify_evicted(&self, evicted: &[ChatId]) {
        if evicted.is_empty() {
            return;
        }
        let listeners: Vec<EvictionListener> =
            self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        for chat in evicted {
            for listener in &listeners {
                listener(chat);
            }
        }
    }
}
