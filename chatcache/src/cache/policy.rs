//! Admission policy: access order and eviction victim selection.

use std::collections::{HashMap, HashSet, VecDeque};

use chatcache_proto::message::ChatId;

use super::entry::ChatCacheEntry;

/// Most-recently-used order of chat ids; the back is the most recent.
///
/// A touch removes the id and pushes it to the back. The sequence is
/// trimmed from the front to `max` ids once it grows past `2 * max`.
#[derive(Debug, Clone)]
pub struct AccessOrder {
    order: VecDeque<ChatId>,
    max: usize,
}

impl AccessOrder {
    /// Creates an empty order bounded by `max`.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            order: VecDeque::new(),
            max: max.max(1),
        }
    }

    /// Marks `chat` as most recently used.
    pub fn touch(&mut self, chat: &ChatId) {
        self.remove(chat);
        self.order.push_back(chat.clone());
        if self.order.len() > self.max * 2 {
            let excess = self.order.len() - self.max;
            self.order.drain(..excess);
        }
    }

    /// Forgets `chat`.
    pub fn remove(&mut self, chat: &ChatId) {
        self.order.retain(|c| c != chat);
    }

    /// Number of ids tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids from least to most recent.
    pub fn iter(&self) -> impl Iterator<Item = &ChatId> + '_ {
        self.order.iter()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.order.clear();
    }
}

/// Picks the chats to evict so that at most `max` entries remain.
///
/// Victims come from the front of the access order first. Entries the
/// order no longer knows about (trimmed away) follow, oldest `last_access`
/// first. `protect` is never chosen.
#[must_use]
pub fn select_victims(
    entries: &HashMap<ChatId, ChatCacheEntry>,
    order: &AccessOrder,
    max: usize,
    protect: &ChatId,
) -> Vec<ChatId> {
    let excess = entries.len().saturating_sub(max);
    if excess == 0 {
        return Vec::new();
    }

    let mut victims: Vec<ChatId> = order
        .iter()
        .filter(|c| *c != protect && entries.contains_key(*c))
        .take(excess)
        .cloned()
        .collect();

    if victims.len() < excess {
        let chosen: HashSet<&ChatId> = victims.iter().collect();
        let mut rest: Vec<(&ChatId, &ChatCacheEntry)> = entries
            .iter()
            .filter(|(c, _)| *c != protect && !chosen.contains(c))
            .collect();
        rest.sort_by_key(|(_, e)| e.last_access);
        let extra: Vec<ChatId> = rest
            .into_iter()
            .take(excess - victims.len())
            .map(|(c, _)| c.clone())
            .collect();
        victims.extend(extra);
    }
    victims
}
