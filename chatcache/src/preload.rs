//! Background preloading of whole chats.
//!
//! Chats are queued at most once each: groups at the front, direct chats at
//! the back. A single processor loads the first page of one chat at a time,
//! pausing `item_delay` between chats, and runs again every `interval`
//! whether or not anything new was queued. A chat whose load fails is
//! logged and forgotten, so a later trigger may queue it again; the rest
//! of the queue is unaffected.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chatcache_proto::message::{ChatId, ChatKind, ChatSummary, UserId};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::directory::ChatDirectory;
use crate::events::{AppEvent, EventBus};
use crate::service::{ChatBackend, ChatDataService};

/// Preloader pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadConfig {
    /// Pause between two preloaded chats.
    pub item_delay: Duration,
    /// How often the processor runs.
    pub interval: Duration,
    /// Recent chats fetched when a user signs in.
    pub recent_chats: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            item_delay: Duration::from_millis(50),
            interval: Duration::from_secs(3),
            recent_chats: 20,
        }
    }
}

/// Preloader counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadStats {
    /// Chats loaded so far.
    pub preloaded: usize,
    /// Chats waiting in the queue.
    pub queued: usize,
}

#[derive(Debug, Default)]
struct PreloadState {
    queue: VecDeque<ChatSummary>,
    scheduled: HashSet<ChatId>,
    preloaded: HashSet<ChatId>,
}

/// Resets the processing flag even if the processor is cancelled.
struct Processing<'a>(&'a AtomicBool);

impl Drop for Processing<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Chat preload queue.
pub struct Preloader<B: ChatBackend> {
    service: ChatDataService<B>,
    directory: Arc<ChatDirectory>,
    config: PreloadConfig,
    state: Mutex<PreloadState>,
    user: Mutex<Option<UserId>>,
    processing: AtomicBool,
}

impl<B: ChatBackend> Preloader<B> {
    /// Creates an idle preloader.
    pub fn new(
        service: ChatDataService<B>,
        directory: Arc<ChatDirectory>,
        config: PreloadConfig,
    ) -> Self {
        Self {
            service,
            directory,
            config,
            state: Mutex::new(PreloadState::default()),
            user: Mutex::new(None),
            processing: AtomicBool::new(false),
        }
    }

    /// Sets the user chats are loaded for.
    pub fn set_user(&self, user: UserId) {
        *self.user.lock() = Some(user);
    }

    /// Queues `chat` unless it was queued before. Returns `true` if queued.
    pub fn schedule(&self, chat: &ChatSummary) -> bool {
        let mut state = self.state.lock();
        if !state.scheduled.insert(chat.id.clone()) {
            return false;
        }
        match chat.kind {
            ChatKind::Group => state.queue.push_front(chat.clone()),
            ChatKind::Direct => state.queue.push_back(chat.clone()),
        }
        tracing::debug!(chat_id = %chat.id, kind = ?chat.kind, "chat scheduled for preload");
        true
    }

    /// Loads every queued chat, one at a time. Returns how many loaded.
    /// A call made while another is running, or before a user is set,
    /// returns 0 immediately.
    pub async fn process_queue(&self) -> usize {
        if self.processing.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let _processing = Processing(&self.processing);
        let Some(user) = self.user.lock().clone() else {
            return 0;
        };

        let mut loaded = 0;
        loop {
            let Some(chat) = self.state.lock().queue.pop_front() else {
                break;
            };
            match self.service.get_data(&chat.id, &user, 0, false).await {
                Ok(_) => {
                    self.state.lock().preloaded.insert(chat.id.clone());
                    loaded += 1;
                    tracing::debug!(chat_id = %chat.id, "chat preloaded");
                }
                Err(e) => {
                    tracing::warn!(chat_id = %chat.id, error = %e, "chat preload failed");
                    self.state.lock().scheduled.remove(&chat.id);
                }
            }
            tokio::time::sleep(self.config.item_delay).await;
        }
        loaded
    }

    /// Reacts to one application event.
    pub async fn on_event(&self, event: &AppEvent) {
        match event {
            AppEvent::UserAuthenticated(user) => {
                self.set_user(user.clone());
                match self.service.recent_chats(user).await {
                    Ok(chats) => {
                        for chat in chats.iter().take(self.config.recent_chats) {
                            self.schedule(chat);
                        }
                    }
                    Err(e) => tracing::warn!(user_id = %user, error = %e, "recent chats unavailable"),
                }
            }
            AppEvent::ChatAdded(summary) => {
                self.schedule(summary);
            }
            AppEvent::ChatActivated(chat) => {
                for neighbor in self.directory.neighbors(chat, 2, 1) {
                    self.schedule(&neighbor);
                }
            }
            AppEvent::ChatRemoved(_)
            | AppEvent::LastMessageUpdated { .. }
            | AppEvent::ChatEvicted(_) => {}
        }
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> PreloadStats {
        let state = self.state.lock();
        PreloadStats {
            preloaded: state.preloaded.len(),
            queued: state.queue.len(),
        }
    }

    /// Whether `chat` has been preloaded.
    #[must_use]
    pub fn is_preloaded(&self, chat: &ChatId) -> bool {
        self.state.lock().preloaded.contains(chat)
    }

    /// Spawns the processor: reacts to bus events and runs the queue every
    /// `interval`. Stops when the bus closes.
    pub fn spawn(self: Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.process_queue().await;
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            self.on_event(&event).await;
                            self.process_queue().await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "preloader lagged behind the event bus");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
