//! The user's chat list, most recent activity first.

use chatcache_proto::message::{ChatId, ChatSummary, Timestamp};
use parking_lot::Mutex;

/// Ordered chat list. Chats without recorded activity sort last, and ties
/// keep insertion order.
#[derive(Debug, Default)]
pub struct ChatDirectory {
    chats: Mutex<Vec<ChatSummary>>,
}

impl ChatDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a chat. Fields the update leaves empty keep
    /// their previous values. Returns `true` if the chat is new.
    pub fn upsert(&self, summary: ChatSummary) -> bool {
        let mut chats = self.chats.lock();
        let added = match chats.iter_mut().find(|c| c.id == summary.id) {
            Some(existing) => {
                existing.kind = summary.kind;
                if summary.name.is_some() {
                    existing.name = summary.name;
                }
                if summary.last_message.is_some() {
                    existing.last_message = summary.last_message;
                }
                if summary.last_activity > existing.last_activity {
                    existing.last_activity = summary.last_activity;
                }
                false
            }
            None => {
                chats.push(summary);
                true
            }
        };
        sort(&mut chats);
        added
    }

    /// Removes a chat. Returns `false` if it was not listed.
    pub fn remove(&self, chat: &ChatId) -> bool {
        let mut chats = self.chats.lock();
        let before = chats.len();
        chats.retain(|c| &c.id != chat);
        chats.len() != before
    }

    /// Records a new last message. Returns `false` if the chat is not
    /// listed.
    pub fn update_last_message(&self, chat: &ChatId, preview: String, at: Timestamp) -> bool {
        let mut chats = self.chats.lock();
        let Some(entry) = chats.iter_mut().find(|c| &c.id == chat) else {
            return false;
        };
        entry.last_message = Some(preview);
        entry.last_activity = Some(entry.last_activity.map_or(at, |t| t.max(at)));
        sort(&mut chats);
        true
    }

    /// Snapshot of the list.
    #[must_use]
    pub fn list(&self) -> Vec<ChatSummary> {
        self.chats.lock().clone()
    }

    /// One chat's summary.
    #[must_use]
    pub fn get(&self, chat: &ChatId) -> Option<ChatSummary> {
        self.chats.lock().iter().find(|c| &c.id == chat).cloned()
    }

    /// Up to `after` chats following `chat` in the list, then up to
    /// `before` chats preceding it (nearest first).
    #[must_use]
    pub fn neighbors(&self, chat: &ChatId, after: usize, before: usize) -> Vec<ChatSummary> {
        let chats = self.chats.lock();
        let Some(index) = chats.iter().position(|c| &c.id == chat) else {
            return Vec::new();
        };
        let following = chats.iter().skip(index + 1).take(after);
        let preceding = chats[..index].iter().rev().take(before);
        following.chain(preceding).cloned().collect()
    }

    /// Number of chats listed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chats.lock().len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chats.lock().is_empty()
    }
}

fn sort(chats: &mut [ChatSummary]) {
    // Stable; `None` < `Some`, so reversing puts inactive chats last.
    chats.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
}
