//! Chat data service: the cache plus the fetch path behind it.
//!
//! [`ChatDataService::get_data`] answers from the cache when both the
//! message and file page are loaded. Otherwise it fetches through the
//! pending-request table, so concurrent callers for the same
//! `(chat, user, page)` share one fetch, merges the result, and kicks off
//! background loads of the neighboring pages. Those neighbor loads never
//! schedule further neighbors.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chatcache_proto::message::{
    ChatId, ChatSummary, FileId, FileItem, Message, MessageId, TimelineItem, TimelineRef, UserId,
};
use futures_util::FutureExt;

use crate::api::{ApiError, RestApi};
use crate::cache::pending::SharedFetch;
use crate::cache::{
    CacheConfig, ChatCache, ChatCacheEntry, CountHints, ListenerId, PendingRequests, RequestKey,
};
use crate::correlation::CallError;
use crate::decrypt::DecryptionClient;
use crate::transport::Transport;

/// Errors surfaced by the service. Cloneable so a shared fetch can hand the
/// same error to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The broker connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote side reported an error.
    #[error("remote error: {message}")]
    Remote {
        /// Message from the error payload.
        message: String,
    },

    /// A call timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The REST API failed.
    #[error("api error: {0}")]
    Api(String),

    /// A response channel closed without an answer.
    #[error("closed without a response")]
    Closed,
}

impl From<CallError> for ServiceError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Transport(t) => Self::Transport(t.to_string()),
            CallError::Remote { message } => Self::Remote { message },
            CallError::Timeout(d) => Self::Timeout(d),
            CallError::Closed => Self::Closed,
        }
    }
}

impl From<ApiError> for ServiceError {
    fn from(e: ApiError) -> Self {
        Self::Api(e.to_string())
    }
}

/// One page of a chat as returned by the backend.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChatPage {
    /// Messages on the page.
    pub messages: Vec<Message>,
    /// Files on the page.
    pub files: Vec<FileItem>,
    /// Timeline entries on the page.
    pub timeline: Vec<TimelineItem>,
    /// Total messages in the chat, if reported.
    pub total_messages: Option<usize>,
    /// Total files in the chat, if reported.
    pub total_files: Option<usize>,
}

impl ChatPage {
    fn hints(&self) -> CountHints {
        CountHints {
            messages: self.total_messages,
            files: self.total_files,
            timeline: None,
        }
    }
}

/// What [`ChatDataService::get_data`] returns. Every list is in ascending
/// timestamp order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChatData {
    /// Messages of the page.
    pub messages: Vec<Message>,
    /// Files of the page.
    pub files: Vec<FileItem>,
    /// Timeline entries referring to those messages and files.
    pub timeline: Vec<TimelineItem>,
    /// Whether the answer came from the cache without a fetch.
    pub from_cache: bool,
}

impl ChatData {
    fn from_entry(entry: &ChatCacheEntry, page: usize) -> Option<Self> {
        let messages = entry.messages.page(page)?;
        let files = entry.files.page(page)?;
        let timeline = entry.timeline.iter().cloned().collect();
        Some(Self::assemble(messages, files, timeline, true))
    }

    fn from_page(page: ChatPage) -> Self {
        let mut timeline = page.timeline;
        timeline.extend(page.files.iter().map(TimelineItem::for_file));
        Self::assemble(page.messages, page.files, timeline, false)
    }

    fn assemble(
        mut messages: Vec<Message>,
        mut files: Vec<FileItem>,
        timeline: Vec<TimelineItem>,
        from_cache: bool,
    ) -> Self {
        messages.sort_by_key(|m| m.timestamp);
        files.sort_by_key(|f| f.timestamp);
        let message_ids: HashSet<&MessageId> = messages.iter().map(|m| &m.id).collect();
        let file_ids: HashSet<&FileId> = files.iter().map(|f| &f.id).collect();
        let mut seen = HashSet::new();
        let mut timeline: Vec<TimelineItem> = timeline
            .into_iter()
            .filter(|t| match &t.item {
                TimelineRef::Message(id) | TimelineRef::System(id) => message_ids.contains(id),
                TimelineRef::File(id) => file_ids.contains(id),
            })
            .filter(|t| seen.insert(t.id.clone()))
            .collect();
        timeline.sort_by_key(|t| t.timestamp);
        Self {
            messages,
            files,
            timeline,
            from_cache,
        }
    }
}

/// Load state of one page of a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Neither cached nor being fetched.
    Unknown,
    /// A fetch is in flight.
    Pending,
    /// Messages and files of the page are cached.
    Loaded,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Chats cached.
    pub cached_chats: usize,
    /// Fetches in flight.
    pub pending_requests: usize,
    /// Length of the access order.
    pub access_order_len: usize,
    /// Whether the cached chat count reached the cleanup threshold.
    pub needs_cleanup: bool,
}

/// Outcome of [`ChatDataService::init_cache`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InitReport {
    /// Chats whose first page was loaded.
    pub loaded: Vec<ChatId>,
    /// Chats whose first page failed to load.
    pub failed: Vec<ChatId>,
}

/// Outcome of [`ChatDataService::load_range`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RangeReport {
    /// Pages fetched by this call, ascending.
    pub fetched: Vec<usize>,
    /// Pages whose fetch failed, ascending.
    pub failed: Vec<usize>,
}

/// Where chat data comes from.
pub trait ChatBackend: Send + Sync + 'static {
    /// Fetches one page of a chat.
    fn fetch_page(
        &self,
        chat: &ChatId,
        user: &UserId,
        page: usize,
        page_size: usize,
    ) -> impl Future<Output = Result<ChatPage, ServiceError>> + Send;

    /// Total number of messages in a chat.
    fn message_count(
        &self,
        chat: &ChatId,
    ) -> impl Future<Output = Result<usize, ServiceError>> + Send;

    /// The user's most recently active chats.
    fn recent_chats(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<Vec<ChatSummary>, ServiceError>> + Send;
}

/// Backend reading pages over REST and decrypting them over the broker.
pub struct RemoteBackend<T: Transport, A: RestApi> {
    api: A,
    decrypt: DecryptionClient<T>,
    recent_chats: usize,
}

impl<T: Transport, A: RestApi> RemoteBackend<T, A> {
    /// Creates a backend. `recent_chats` bounds the recent-chat listing.
    pub fn new(api: A, decrypt: DecryptionClient<T>, recent_chats: usize) -> Self {
        Self {
            api,
            decrypt,
            recent_chats,
        }
    }
}

impl<T: Transport, A: RestApi> ChatBackend for RemoteBackend<T, A> {
    async fn fetch_page(
        &self,
        chat: &ChatId,
        user: &UserId,
        page: usize,
        page_size: usize,
    ) -> Result<ChatPage, ServiceError> {
        let mut data = self.api.chat_page(chat, user, page, page_size).await?;

        match self.decrypt.decrypt_messages(chat, data.messages.clone()).await {
            Ok(messages) => data.messages = messages,
            Err(e) => {
                tracing::warn!(chat_id = %chat, page, error = %e, "message decryption failed, keeping ciphertext");
            }
        }
        match self.decrypt.decrypt_files(chat, data.files.clone()).await {
            Ok(files) => data.files = files,
            Err(e) => {
                tracing::warn!(chat_id = %chat, page, error = %e, "file decryption failed, keeping ciphertext");
            }
        }
        Ok(data)
    }

    async fn message_count(&self, chat: &ChatId) -> Result<usize, ServiceError> {
        Ok(self.api.message_count(chat).await?)
    }

    async fn recent_chats(&self, user: &UserId) -> Result<Vec<ChatSummary>, ServiceError> {
        Ok(self.api.recent_chats(user, 0, self.recent_chats).await?)
    }
}

struct ServiceInner<B: ChatBackend> {
    backend: B,
    cache: ChatCache,
    pending: PendingRequests<ChatPage, ServiceError>,
}

impl<B: ChatBackend> ServiceInner<B> {
    /// Fetches a page and merges it. Never recurses into the cached path.
    async fn fetch_and_merge(
        &self,
        chat: &ChatId,
        user: &UserId,
        page: usize,
    ) -> Result<ChatPage, ServiceError> {
        if !self.cache.has_entry(chat) {
            let count = match self.backend.message_count(chat).await {
                Ok(n) => Some(n),
                Err(e) => {
                    tracing::warn!(chat_id = %chat, error = %e, "message count unavailable");
                    None
                }
            };
            self.cache.ensure_entry(
                chat,
                CountHints {
                    messages: count,
                    ..CountHints::default()
                },
            );
        }

        let page_size = self.cache.config().page_size;
        let data = self
            .backend
            .fetch_page(chat, user, page, page_size)
            .await
            .inspect_err(|e| {
                tracing::warn!(chat_id = %chat, page, error = %e, "page fetch failed");
            })?;

        self.merge_page(chat, data.clone(), page);
        Ok(data)
    }

    fn merge_page(&self, chat: &ChatId, data: ChatPage, page: usize) {
        let hints = data.hints();
        self.cache.ensure_entry(chat, hints);
        self.cache.raise_totals(chat, hints);
        self.cache
            .add_chat_data_page(chat, data.messages, data.files, data.timeline, page);
    }
}

fn record_init(chat: &ChatId, result: Result<ChatData, ServiceError>, report: &mut InitReport) {
    match result {
        Ok(_) => report.loaded.push(chat.clone()),
        Err(e) => {
            tracing::warn!(chat_id = %chat, error = %e, "initial load failed");
            report.failed.push(chat.clone());
        }
    }
}

/// The chat data service. Cloning yields another handle to the same cache.
pub struct ChatDataService<B: ChatBackend> {
    inner: Arc<ServiceInner<B>>,
}

impl<B: ChatBackend> Clone for ChatDataService<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ChatBackend> ChatDataService<B> {
    /// Creates a service over `backend` with an empty cache.
    pub fn new(backend: B, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                backend,
                cache: ChatCache::new(config),
                pending: PendingRequests::new(),
            }),
        }
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &ChatCache {
        &self.inner.cache
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Returns page `page` of `chat`, from the cache if possible.
    ///
    /// # Errors
    ///
    /// Returns the fetch error when the page is not cached and loading it
    /// fails. Errors of the background neighbor loads are only logged.
    pub async fn get_data(
        &self,
        chat: &ChatId,
        user: &UserId,
        page: usize,
        force_refresh: bool,
    ) -> Result<ChatData, ServiceError> {
        self.inner.cache.validate_entry(chat);

        if !force_refresh && let Some(data) = self.cached(chat, page) {
            tracing::debug!(chat_id = %chat, page, "cache hit");
            return Ok(data);
        }

        let fetched = self.load_page(chat, user, page).await?;
        self.schedule_adjacent(chat, user, page);

        Ok(self.cached(chat, page).map_or_else(
            || ChatData::from_page(fetched),
            |data| ChatData {
                from_cache: false,
                ..data
            },
        ))
    }

    /// Load state of `page` of `chat`.
    #[must_use]
    pub fn page_state(&self, chat: &ChatId, page: usize) -> PageState {
        if self.inner.pending.contains_page(chat, page) {
            PageState::Pending
        } else if self.is_cached(chat, page) {
            PageState::Loaded
        } else {
            PageState::Unknown
        }
    }

    /// The user's recent chats from the backend.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn recent_chats(&self, user: &UserId) -> Result<Vec<ChatSummary>, ServiceError> {
        self.inner.backend.recent_chats(user).await
    }

    /// Loads the first page of the user's recent chats, the active chat
    /// first. Per-chat failures are logged and reported, not returned.
    ///
    /// # Errors
    ///
    /// Fails only if the recent-chat listing itself fails.
    pub async fn init_cache(
        &self,
        user: &UserId,
        active: Option<&ChatId>,
    ) -> Result<InitReport, ServiceError> {
        let recent = self.recent_chats(user).await?;
        let mut report = InitReport::default();

        if let Some(chat) = active {
            record_init(chat, self.get_data(chat, user, 0, false).await, &mut report);
        }

        let rest: Vec<&ChatId> = recent
            .iter()
            .map(|c| &c.id)
            .filter(|id| Some(*id) != active)
            .collect();
        let results =
            futures_util::future::join_all(rest.iter().map(|c| self.get_data(c, user, 0, false)))
                .await;
        for (chat, result) in rest.into_iter().zip(results) {
            record_init(chat, result, &mut report);
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "cache initialized"
        );
        Ok(report)
    }

    /// Loads the pages overlapping item indices `start..=end` that exist
    /// and are not cached, in parallel. A chat that is not cached yet first
    /// loads the page holding `start` to learn its size. Failed pages are
    /// logged and reported.
    pub async fn load_range(
        &self,
        chat: &ChatId,
        user: &UserId,
        start: usize,
        end: usize,
    ) -> RangeReport {
        let page_size = self.inner.cache.config().page_size;
        let first = start.min(end) / page_size;
        let last = start.max(end) / page_size;
        let mut report = RangeReport::default();

        self.inner.cache.validate_entry(chat);
        if !self.inner.cache.has_entry(chat) {
            match self.load_page(chat, user, first).await {
                Ok(_) => report.fetched.push(first),
                Err(e) => {
                    tracing::warn!(chat_id = %chat, page = first, error = %e, "range load failed");
                    report.failed.push(first);
                    return report;
                }
            }
        }
        let Some(total) = self.inner.cache.total_count::<Message>(chat) else {
            return report;
        };
        let pages = total.div_ceil(page_size);

        let missing: Vec<usize> = (first..pages.min(last.saturating_add(1)))
            .filter(|page| !report.fetched.contains(page) && !self.is_cached(chat, *page))
            .collect();
        let results =
            futures_util::future::join_all(missing.iter().map(|page| self.load_page(chat, user, *page)))
                .await;
        for (page, result) in missing.into_iter().zip(results) {
            match result {
                Ok(_) => report.fetched.push(page),
                Err(e) => {
                    tracing::warn!(chat_id = %chat, page, error = %e, "range load failed");
                    report.failed.push(page);
                }
            }
        }
        report.fetched.sort_unstable();
        tracing::debug!(
            chat_id = %chat,
            start,
            end,
            fetched = report.fetched.len(),
            failed = report.failed.len(),
            "range loaded"
        );
        report
    }

    /// Cached messages at item indices `start..=end`, each with its index.
    /// Empty slots are skipped.
    #[must_use]
    pub fn messages_in_range(&self, chat: &ChatId, start: usize, end: usize) -> Vec<(usize, Message)> {
        self.inner
            .cache
            .read(chat, |entry| entry.messages.items_in(start..=end))
            .unwrap_or_default()
    }

    /// Whether every page the chat's message count spans is cached.
    /// `false` for a chat that is not cached.
    #[must_use]
    pub fn all_pages_loaded(&self, chat: &ChatId) -> bool {
        let Some(total) = self.inner.cache.total_count::<Message>(chat) else {
            return false;
        };
        let pages = total.div_ceil(self.inner.cache.config().page_size);
        (0..pages).all(|page| self.is_cached(chat, page))
    }

    /// Merges a page that arrived without a fetch (e.g. from a stream).
    pub fn add_chat_data_page(&self, chat: &ChatId, data: ChatPage, page: usize) {
        self.inner.merge_page(chat, data, page);
    }

    /// Adds a live message and its timeline entry. Returns `false` if the
    /// message was already cached.
    pub fn add_message(&self, chat: &ChatId, mut message: Message) -> bool {
        if message.chat_id.is_none() {
            message.chat_id = Some(chat.clone());
        }
        let entry = TimelineItem::for_message(&message);
        let added = self.inner.cache.add_single(chat, message);
        if added {
            self.inner.cache.add_single(chat, entry);
        }
        added
    }

    /// Adds a live file. Its timeline entry is synthesized by the cache.
    pub fn add_file(&self, chat: &ChatId, mut file: FileItem) -> bool {
        if file.chat_id.is_none() {
            file.chat_id = Some(chat.clone());
        }
        self.inner.cache.add_single(chat, file)
    }

    /// Drops one chat from the cache.
    pub fn clear_chat_cache(&self, chat: &ChatId) -> bool {
        self.inner.cache.clear_chat(chat)
    }

    /// Drops every chat from the cache.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    /// See [`ChatCache::add_eviction_listener`].
    pub fn add_eviction_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChatId) + Send + Sync + 'static,
    {
        self.inner.cache.add_eviction_listener(listener)
    }

    /// See [`ChatCache::remove_eviction_listener`].
    pub fn remove_eviction_listener(&self, id: ListenerId) -> bool {
        self.inner.cache.remove_eviction_listener(id)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let cache = &self.inner.cache;
        let cached_chats = cache.len();
        CacheStats {
            cached_chats,
            pending_requests: self.inner.pending.len(),
            access_order_len: cache.access_order_len(),
            needs_cleanup: cache.config().needs_cleanup(cached_chats),
        }
    }

    fn is_cached(&self, chat: &ChatId, page: usize) -> bool {
        self.inner.cache.is_page_loaded::<Message>(chat, page)
            && self.inner.cache.is_page_loaded::<FileItem>(chat, page)
    }

    fn cached(&self, chat: &ChatId, page: usize) -> Option<ChatData> {
        self.inner
            .cache
            .read(chat, |entry| ChatData::from_entry(entry, page))
            .flatten()
    }

    fn load_page(&self, chat: &ChatId, user: &UserId, page: usize) -> SharedFetch<ChatPage, ServiceError> {
        let inner = Arc::clone(&self.inner);
        let (chat, user) = (chat.clone(), user.clone());
        let key = RequestKey::new(&chat, &user, page);
        self.inner.pending.get_or_start(key, move || {
            async move { inner.fetch_and_merge(&chat, &user, page).await }.boxed()
        })
    }

    /// Starts background loads of the pages within `preload_pages` of
    /// `page` that are in range, not cached and not already in flight.
    fn schedule_adjacent(&self, chat: &ChatId, user: &UserId, page: usize) {
        let config = *self.inner.cache.config();
        let Some(total) = self.inner.cache.total_count::<Message>(chat) else {
            return;
        };
        let pages = total.div_ceil(config.page_size);

        for distance in 1..=config.preload_pages {
            for candidate in [page.checked_sub(distance), page.checked_add(distance)]
                .into_iter()
                .flatten()
            {
                if candidate >= pages
                    || self.is_cached(chat, candidate)
                    || self
                        .inner
                        .pending
                        .contains(&RequestKey::new(chat, user, candidate))
                {
                    continue;
                }
                let fetch = self.load_page(chat, user, candidate);
                let chat_id = chat.clone();
                tokio::spawn(async move {
                    if let Err(e) = fetch.await {
                        tracing::warn!(chat_id = %chat_id, page = candidate, error = %e, "adjacent page preload failed");
                    }
                });
            }
        }
    }
}
