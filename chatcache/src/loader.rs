//! Serial batch loading with stuck-unit supervision.
//!
//! A worker loads one unit (chat) at a time, each attempt in its own task.
//! A monitor checks every `check_interval` for units that have been
//! `Loading` longer than `stuck_timeout`: it counts one retry per
//! detection, aborts the stale attempt and puts the unit back at the front
//! of the queue. A unit whose retries exceed `max_retries` is marked
//! `Error` and reported as [`LoaderEvent::Failed`].
//!
//! A failed attempt is retried the same way, under the same bound. An
//! attempt that succeeds is accepted even if the unit was requeued in the
//! meantime.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chatcache_proto::message::ChatId;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;

/// Loader tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// How long an attempt may run before it counts as stuck.
    pub stuck_timeout: Duration,
    /// How often the monitor looks for stuck units.
    pub check_interval: Duration,
    /// Retries allowed before a unit is given up on.
    pub max_retries: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            stuck_timeout: Duration::from_secs(5),
            check_interval: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

/// Status of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStatus {
    /// Queued, not yet attempted.
    Pending,
    /// An attempt is running.
    Loading,
    /// Loaded successfully.
    Loaded,
    /// Given up on.
    Error,
    /// Requeued after an attempt stalled.
    Stuck,
}

/// A unit's status and retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStatus {
    /// Current status.
    pub status: LoadStatus,
    /// Retries counted so far.
    pub retries: u32,
}

/// Counts of units per status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoaderStatus {
    /// Units waiting for their first attempt.
    pub pending: usize,
    /// Units with an attempt running.
    pub loading: usize,
    /// Units loaded.
    pub loaded: usize,
    /// Units given up on.
    pub error: usize,
    /// Units requeued after stalling.
    pub stuck: usize,
}

/// Notifications from the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderEvent {
    /// A unit loaded.
    Loaded(ChatId),
    /// A stalled unit was requeued.
    Stuck {
        /// The unit.
        chat_id: ChatId,
        /// Retries counted so far.
        retries: u32,
    },
    /// A failed attempt was requeued.
    Retrying {
        /// The unit.
        chat_id: ChatId,
        /// Retries counted so far.
        retries: u32,
        /// Why the attempt failed.
        reason: String,
    },
    /// A unit exceeded its retries.
    Failed {
        /// The unit.
        chat_id: ChatId,
        /// Retries counted.
        retries: u32,
        /// Why the last attempt ended.
        reason: String,
    },
}

/// Loads one unit.
pub trait UnitLoader: Send + Sync + 'static {
    /// Loads `chat`.
    fn load(&self, chat: ChatId) -> impl Future<Output = Result<(), String>> + Send;
}

impl<F, Fut> UnitLoader for F
where
    F: Fn(ChatId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send,
{
    fn load(&self, chat: ChatId) -> impl Future<Output = Result<(), String>> + Send {
        self(chat)
    }
}

struct Unit {
    status: LoadStatus,
    retries: u32,
    since: Instant,
    attempt: u64,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct State {
    units: HashMap<ChatId, Unit>,
    queue: VecDeque<ChatId>,
}

struct Inner<L> {
    loader: Arc<L>,
    config: LoaderConfig,
    state: Mutex<State>,
    wake: Notify,
    events: broadcast::Sender<LoaderEvent>,
    next_attempt: AtomicU64,
}

/// Serial loader. Cloning yields another handle to the same queue.
pub struct BatchLoader<L: UnitLoader> {
    inner: Arc<Inner<L>>,
}

impl<L: UnitLoader> Clone for BatchLoader<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The loader's background tasks. Dropping this stops them.
pub struct LoaderTasks {
    worker: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl Drop for LoaderTasks {
    fn drop(&mut self) {
        self.worker.abort();
        self.monitor.abort();
    }
}

impl<L: UnitLoader> BatchLoader<L> {
    /// Creates a loader. Nothing runs until [`BatchLoader::spawn`].
    pub fn new(loader: L, config: LoaderConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                loader: Arc::new(loader),
                config,
                state: Mutex::new(State::default()),
                wake: Notify::new(),
                events,
                next_attempt: AtomicU64::new(0),
            }),
        }
    }

    /// Queues `chat`. Returns `false` if it is already known.
    pub fn enqueue(&self, chat: ChatId) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.units.contains_key(&chat) {
                return false;
            }
            state.units.insert(
                chat.clone(),
                Unit {
                    status: LoadStatus::Pending,
                    retries: 0,
                    since: Instant::now(),
                    attempt: 0,
                    abort: None,
                },
            );
            state.queue.push_back(chat);
        }
        self.inner.wake.notify_one();
        true
    }

    /// Subscribes to loader events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.inner.events.subscribe()
    }

    /// Counts of units per status.
    #[must_use]
    pub fn status(&self) -> LoaderStatus {
        let state = self.inner.state.lock();
        let mut status = LoaderStatus::default();
        for unit in state.units.values() {
            match unit.status {
                LoadStatus::Pending => status.pending += 1,
                LoadStatus::Loading => status.loading += 1,
                LoadStatus::Loaded => status.loaded += 1,
                LoadStatus::Error => status.error += 1,
                LoadStatus::Stuck => status.stuck += 1,
            }
        }
        status
    }

    /// One unit's status.
    #[must_use]
    pub fn unit_status(&self, chat: &ChatId) -> Option<UnitStatus> {
        self.inner.state.lock().units.get(chat).map(|u| UnitStatus {
            status: u.status,
            retries: u.retries,
        })
    }

    /// Starts the worker and the monitor.
    #[must_use]
    pub fn spawn(&self) -> LoaderTasks {
        let worker = tokio::spawn(Arc::clone(&self.inner).work());
        let monitor = tokio::spawn(Arc::clone(&self.inner).monitor());
        LoaderTasks { worker, monitor }
    }
}

impl<L: UnitLoader> Inner<L> {
    async fn work(self: Arc<Self>) {
        loop {
            let Some((chat, attempt)) = self.next_unit() else {
                self.wake.notified().await;
                continue;
            };

            let loader = Arc::clone(&self.loader);
            let target = chat.clone();
            let handle = tokio::spawn(async move { loader.load(target).await });
            if let Some(unit) = self.state.lock().units.get_mut(&chat)
                && unit.attempt == attempt
            {
                unit.abort = Some(handle.abort_handle());
            }

            let result = handle.await;
            self.finish(&chat, attempt, result);
        }
    }

    fn next_unit(&self) -> Option<(ChatId, u64)> {
        let mut state = self.state.lock();
        while let Some(chat) = state.queue.pop_front() {
            let Some(unit) = state.units.get_mut(&chat) else {
                continue;
            };
            if !matches!(unit.status, LoadStatus::Pending | LoadStatus::Stuck) {
                continue;
            }
            let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed) + 1;
            unit.status = LoadStatus::Loading;
            unit.since = Instant::now();
            unit.attempt = attempt;
            unit.abort = None;
            return Some((chat, attempt));
        }
        None
    }

    fn finish(&self, chat: &ChatId, attempt: u64, result: Result<Result<(), String>, JoinError>) {
        let event = {
            let mut state = self.state.lock();
            let Some(unit) = state.units.get_mut(chat) else {
                return;
            };
            match result {
                Ok(Ok(())) => {
                    if unit.status == LoadStatus::Loaded {
                        return;
                    }
                    unit.status = LoadStatus::Loaded;
                    unit.abort = None;
                    state.queue.retain(|c| c != chat);
                    tracing::debug!(chat_id = %chat, "unit loaded");
                    LoaderEvent::Loaded(chat.clone())
                }
                Err(e) if e.is_cancelled() => return,
                Ok(Err(_)) | Err(_) if unit.attempt != attempt || unit.status != LoadStatus::Loading => {
                    return;
                }
                Ok(Err(reason)) => self.retry_or_fail(&mut state, chat, reason, false),
                Err(e) => self.retry_or_fail(&mut state, chat, e.to_string(), false),
            }
        };
        let _ = self.events.send(event);
    }

    /// Counts a retry for `chat` and requeues it, or marks it failed.
    /// Stuck units go to the queue front, failed attempts to the back.
    fn retry_or_fail(&self, state: &mut State, chat: &ChatId, reason: String, stuck: bool) -> LoaderEvent {
        let max_retries = self.config.max_retries;
        let Some(unit) = state.units.get_mut(chat) else {
            return LoaderEvent::Failed {
                chat_id: chat.clone(),
                retries: 0,
                reason,
            };
        };
        unit.retries += 1;
        unit.abort = None;
        let retries = unit.retries;
        if retries > max_retries {
            unit.status = LoadStatus::Error;
            tracing::warn!(chat_id = %chat, retries, reason = %reason, "unit failed");
            return LoaderEvent::Failed {
                chat_id: chat.clone(),
                retries,
                reason,
            };
        }
        if stuck {
            unit.status = LoadStatus::Stuck;
            state.queue.push_front(chat.clone());
            tracing::warn!(chat_id = %chat, retries, "unit stuck, requeued");
            LoaderEvent::Stuck {
                chat_id: chat.clone(),
                retries,
            }
        } else {
            unit.status = LoadStatus::Pending;
            state.queue.push_back(chat.clone());
            tracing::warn!(chat_id = %chat, retries, reason = %reason, "unit load failed, requeued");
            LoaderEvent::Retrying {
                chat_id: chat.clone(),
                retries,
                reason,
            }
        }
    }

    async fn monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            ticker.tick().await;
            self.check_stuck();
        }
    }

    fn check_stuck(&self) {
        let now = Instant::now();
        let (events, requeued) = {
            let mut state = self.state.lock();
            let stale: Vec<ChatId> = state
                .units
                .iter()
                .filter(|(_, u)| {
                    u.status == LoadStatus::Loading
                        && now.duration_since(u.since) >= self.config.stuck_timeout
                })
                .map(|(c, _)| c.clone())
                .collect();

            let mut events = Vec::with_capacity(stale.len());
            let mut requeued = false;
            for chat in stale {
                if let Some(abort) = state.units.get_mut(&chat).and_then(|u| u.abort.take()) {
                    abort.abort();
                }
                let event = self.retry_or_fail(
                    &mut state,
                    &chat,
                    format!("no progress for {:?}", self.config.stuck_timeout),
                    true,
                );
                requeued |= matches!(event, LoaderEvent::Stuck { .. });
                events.push(event);
            }
            (events, requeued)
        };

        for event in events {
            let _ = self.events.send(event);
        }
        if requeued {
            self.wake.notify_one();
        }
    }
}
