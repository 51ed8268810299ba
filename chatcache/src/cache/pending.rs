//! De-duplication of in-flight page fetches.
//!
//! At most one fetch runs per [`RequestKey`]. Later callers for the same key
//! get a clone of the same [`Shared`] future. The fetch removes its own
//! table entry when it settles, and a spawned driver polls it to completion
//! so the entry is removed even if every caller gives up waiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatcache_proto::message::{ChatId, UserId};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

/// Identifies one page fetch. Renders as `chatId:userId:page`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// Chat being fetched.
    pub chat_id: ChatId,
    /// User the fetch is made for.
    pub user_id: UserId,
    /// Page number.
    pub page: usize,
}

impl RequestKey {
    /// Creates a key.
    #[must_use]
    pub fn new(chat_id: &ChatId, user_id: &UserId, page: usize) -> Self {
        Self {
            chat_id: chat_id.clone(),
            user_id: user_id.clone(),
            page,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chat_id, self.user_id, self.page)
    }
}

/// A fetch that any number of callers can await.
pub type SharedFetch<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

type Table<V, E> = HashMap<RequestKey, (u64, SharedFetch<V, E>)>;

/// Table of in-flight fetches.
pub struct PendingRequests<V, E> {
    table: Arc<Mutex<Table<V, E>>>,
    next_generation: AtomicU64,
}

impl<V, E> Default for PendingRequests<V, E> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<V, E> PendingRequests<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the in-flight fetch for `key`, or starts one with `start`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_or_start<F>(&self, key: RequestKey, start: F) -> SharedFetch<V, E>
    where
        F: FnOnce() -> BoxFuture<'static, Result<V, E>>,
    {
        let mut table = self.table.lock();
        if let Some((_, existing)) = table.get(&key) {
            tracing::debug!(request = %key, "joining in-flight fetch");
            return existing.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let owner = Arc::clone(&self.table);
        let own_key = key.clone();
        let fetch = start();
        let shared = async move {
            let result = fetch.await;
            {
                let mut table = owner.lock();
                if table.get(&own_key).is_some_and(|(g, _)| *g == generation) {
                    table.remove(&own_key);
                }
            }
            result
        }
        .boxed()
        .shared();

        table.insert(key, (generation, shared.clone()));
        drop(table);
        tokio::spawn(shared.clone());
        shared
    }

    /// Whether a fetch for `key` is in flight.
    #[must_use]
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.table.lock().contains_key(key)
    }

    /// Whether any user's fetch for `chat`/`page` is in flight.
    #[must_use]
    pub fn contains_page(&self, chat: &ChatId, page: usize) -> bool {
        self.table
            .lock()
            .keys()
            .any(|k| &k.chat_id == chat && k.page == page)
    }

    /// Number of fetches in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}
