//! Application events and the sequential directory update queue.
//!
//! # Architecture
//!
//! ```text
//! producers ── DirectoryUpdate ──> UpdateQueue task ──> ChatDirectory
//!                                        │
//!                                        └── AppEvent ──> EventBus subscribers
//! ```
//!
//! Updates are applied one at a time by a single consumer task, which
//! yields to the runtime between items so a burst cannot starve readers.

use std::sync::Arc;

use chatcache_proto::message::{ChatId, ChatSummary, Timestamp, UserId};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::directory::ChatDirectory;

/// Something the rest of the client may react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// A user signed in; their chats should be loaded.
    UserAuthenticated(UserId),
    /// A chat appeared in the directory.
    ChatAdded(ChatSummary),
    /// The user opened a chat.
    ChatActivated(ChatId),
    /// A chat left the directory.
    ChatRemoved(ChatId),
    /// A chat received a new last message.
    LastMessageUpdated {
        /// The chat.
        chat_id: ChatId,
        /// Preview text.
        preview: String,
        /// When the message was sent.
        at: Timestamp,
    },
    /// A chat was evicted from the cache.
    ChatEvicted(ChatId),
}

/// Broadcast bus for [`AppEvent`]s. Cloning yields another sender.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: AppEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

/// A change to the chat directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryUpdate {
    /// Insert or refresh a chat.
    Upsert(ChatSummary),
    /// Record a chat's newest message.
    LastMessage {
        /// The chat.
        chat_id: ChatId,
        /// Preview text.
        preview: String,
        /// When the message was sent.
        at: Timestamp,
    },
    /// Drop a chat.
    Remove(ChatId),
}

enum Op {
    Apply(DirectoryUpdate),
    Flush(oneshot::Sender<()>),
}

/// Handle for enqueueing directory updates.
#[derive(Debug, Clone)]
pub struct UpdateSender {
    tx: mpsc::UnboundedSender<Op>,
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply(u) => f.debug_tuple("Apply").field(u).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl UpdateSender {
    /// Enqueues an update. Returns `false` if the queue task has stopped.
    pub fn send(&self, update: DirectoryUpdate) -> bool {
        self.tx.send(Op::Apply(update)).is_ok()
    }

    /// Waits until every update enqueued before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Op::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// The single consumer of directory updates.
pub struct UpdateQueue;

impl UpdateQueue {
    /// Spawns the consumer. It runs until every [`UpdateSender`] is dropped.
    #[must_use]
    pub fn spawn(directory: Arc<ChatDirectory>, bus: EventBus) -> (UpdateSender, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    Op::Apply(update) => apply(&directory, &bus, update),
                    Op::Flush(done) => {
                        let _ = done.send(());
                    }
                }
                tokio::task::yield_now().await;
            }
            tracing::debug!("directory update queue stopped");
        });
        (UpdateSender { tx }, handle)
    }
}

fn apply(directory: &ChatDirectory, bus: &EventBus, update: DirectoryUpdate) {
    match update {
        DirectoryUpdate::Upsert(summary) => {
            if directory.upsert(summary.clone()) {
                tracing::debug!(chat_id = %summary.id, "chat added");
                bus.publish(AppEvent::ChatAdded(summary));
            }
        }
        DirectoryUpdate::LastMessage {
            chat_id,
            preview,
            at,
        } => {
            if directory.update_last_message(&chat_id, preview.clone(), at) {
                bus.publish(AppEvent::LastMessageUpdated {
                    chat_id,
                    preview,
                    at,
                });
            } else {
                tracing::debug!(chat_id = %chat_id, "last message for unlisted chat ignored");
            }
        }
        DirectoryUpdate::Remove(chat_id) => {
            if directory.remove(&chat_id) {
                bus.publish(AppEvent::ChatRemoved(chat_id));
            }
        }
    }
}
