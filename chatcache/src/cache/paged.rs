//! One paginated stream (messages, files or timeline) of a chat.
//!
//! Items live in `by_id`; their absolute order lives in `slots`, a sparse
//! map from index to id. Page `p` covers indices `p * page_size ..
//! (p + 1) * page_size`. A page counts as loaded only while every index of
//! its populated range is filled, so a reader never sees a loaded page with
//! a hole in it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::ops::RangeInclusive;

use chatcache_proto::message::{
    ChatId, FileId, FileItem, Message, MessageId, Timestamp, TimelineId, TimelineItem,
};

/// An item that can be stored in a [`PagedStream`].
pub trait CacheItem: Clone + Send + Sync + 'static {
    /// Identifier type.
    type Id: Clone + Eq + Hash + Ord + fmt::Display + Send + Sync;

    /// The item's id.
    fn id(&self) -> &Self::Id;
    /// The chat the item claims to belong to.
    fn chat_id(&self) -> Option<&ChatId>;
    /// Sets the chat the item belongs to.
    fn set_chat_id(&mut self, chat: ChatId);
    /// Sort key within a page.
    fn timestamp(&self) -> Timestamp;
}

impl CacheItem for Message {
    type Id = MessageId;

    fn id(&self) -> &MessageId {
        &self.id
    }
    fn chat_id(&self) -> Option<&ChatId> {
        self.chat_id.as_ref()
    }
    fn set_chat_id(&mut self, chat: ChatId) {
        self.chat_id = Some(chat);
    }
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl CacheItem for FileItem {
    type Id = FileId;

    fn id(&self) -> &FileId {
        &self.id
    }
    fn chat_id(&self) -> Option<&ChatId> {
        self.chat_id.as_ref()
    }
    fn set_chat_id(&mut self, chat: ChatId) {
        self.chat_id = Some(chat);
    }
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl CacheItem for TimelineItem {
    type Id = TimelineId;

    fn id(&self) -> &TimelineId {
        &self.id
    }
    fn chat_id(&self) -> Option<&ChatId> {
        self.chat_id.as_ref()
    }
    fn set_chat_id(&mut self, chat: ChatId) {
        self.chat_id = Some(chat);
    }
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Outcome of [`PagedStream::validate`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamRepair {
    /// Items removed because they belong to another chat.
    pub foreign: usize,
    /// Items that had no chat id and were given this one.
    pub backfilled: usize,
    /// Slots or items removed because the other side was missing.
    pub orphans: usize,
    /// Pages no longer considered loaded.
    pub pages_unmarked: usize,
}

impl StreamRepair {
    /// Whether anything was changed.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.foreign == 0 && self.backfilled == 0 && self.orphans == 0 && self.pages_unmarked == 0
    }
}

/// Sparse, paginated store of one kind of item.
#[derive(Debug, Clone)]
pub struct PagedStream<T: CacheItem> {
    page_size: usize,
    by_id: HashMap<T::Id, T>,
    slots: BTreeMap<usize, T::Id>,
    positions: HashMap<T::Id, usize>,
    loaded_pages: BTreeSet<usize>,
    total_count: usize,
    has_more: bool,
}

impl<T: CacheItem> PagedStream<T> {
    /// Creates an empty stream. `total_hint` seeds the total count; with no
    /// hint the stream assumes there is more to load.
    #[must_use]
    pub fn new(page_size: usize, total_hint: Option<usize>) -> Self {
        let page_size = page_size.max(1);
        Self {
            page_size,
            by_id: HashMap::new(),
            slots: BTreeMap::new(),
            positions: HashMap::new(),
            loaded_pages: BTreeSet::new(),
            total_count: total_hint.unwrap_or(0),
            has_more: total_hint.is_none_or(|t| t > page_size),
        }
    }

    /// Items per page.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of items stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the stream holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Best known total item count on the server. Never decreases.
    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.total_count
    }

    /// Whether the last merged page was full.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// One past the highest occupied index.
    #[must_use]
    pub fn order_len(&self) -> usize {
        self.slots.last_key_value().map_or(0, |(k, _)| k + 1)
    }

    /// Whether `page` is loaded.
    #[must_use]
    pub fn is_page_loaded(&self, page: usize) -> bool {
        self.loaded_pages.contains(&page)
    }

    /// Loaded page numbers in ascending order.
    pub fn loaded_pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.loaded_pages.iter().copied()
    }

    /// Looks up an item.
    #[must_use]
    pub fn get(&self, id: &T::Id) -> Option<&T> {
        self.by_id.get(id)
    }

    /// Whether an item with `id` is stored.
    #[must_use]
    pub fn contains(&self, id: &T::Id) -> bool {
        self.by_id.contains_key(id)
    }

    /// Absolute index of an item.
    #[must_use]
    pub fn position(&self, id: &T::Id) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// All items in index order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.slots.values().filter_map(|id| self.by_id.get(id))
    }

    /// Items stored at indices within `range`, each with its index.
    #[must_use]
    pub fn items_in(&self, range: RangeInclusive<usize>) -> Vec<(usize, T)> {
        if range.is_empty() {
            return Vec::new();
        }
        self.slots
            .range(range)
            .filter_map(|(index, id)| self.by_id.get(id).map(|item| (*index, item.clone())))
            .collect()
    }

    /// Raises the total count to at least `total`.
    pub fn raise_total(&mut self, total: usize) {
        self.total_count = self.total_count.max(total);
    }

    /// Items of a loaded page in index order, or `None` if the page is not
    /// loaded.
    #[must_use]
    pub fn page(&self, page: usize) -> Option<Vec<T>> {
        if !self.loaded_pages.contains(&page) {
            return None;
        }
        let start = page * self.page_size;
        Some(
            self.slots
                .range(start..start + self.page_size)
                .filter_map(|(_, id)| self.by_id.get(id).cloned())
                .collect(),
        )
    }

    /// Merges one server page.
    ///
    /// Items are sorted by timestamp and placed at `page * page_size + i`.
    /// Content already stored for an id is kept. New items push any occupant
    /// of their slot out; the displaced items are re-appended after the
    /// current tail in timestamp order. Returns the number of new items.
    pub fn add_page(&mut self, mut items: Vec<T>, page: usize) -> usize {
        items.sort_by_key(|item| item.timestamp());
        let received = items.len();
        let start = page * self.page_size;
        let mut added = 0;
        let mut displaced: Vec<T::Id> = Vec::new();

        for (offset, item) in items.into_iter().enumerate() {
            let target = start + offset;
            let id = item.id().clone();
            if !self.by_id.contains_key(&id) {
                self.by_id.insert(id.clone(), item);
                added += 1;
            }
            match self.positions.get(&id).copied() {
                Some(current) if current == target => {}
                Some(current) => self.relocate(&id, current, target),
                None => {
                    displaced.retain(|d| d != &id);
                    displaced.extend(self.place(id, target));
                }
            }
        }
        self.append_by_timestamp(displaced);

        if self.verify_page(page) {
            self.loaded_pages.insert(page);
        }
        self.unmark_incomplete();
        self.total_count = self.total_count.max(self.order_len());
        self.has_more = received == self.page_size;
        added
    }

    /// Appends a live item after the last occupied index. Returns `false`
    /// if the id is already stored.
    ///
    /// The page it lands in is marked loaded only when the stream already
    /// holds everything the server reported; otherwise older items are still
    /// missing from that page.
    pub fn add_single(&mut self, item: T) -> bool {
        let id = item.id().clone();
        if self.by_id.contains_key(&id) {
            return false;
        }
        let complete = self.holds_all_known();
        let index = self.order_len();
        self.by_id.insert(id.clone(), item);
        self.positions.insert(id.clone(), index);
        self.slots.insert(index, id);
        self.total_count = (self.total_count + 1).max(self.order_len());

        let page = index / self.page_size;
        if complete && self.verify_page(page) {
            self.loaded_pages.insert(page);
        }
        true
    }

    /// Whether the server has nothing older to send: the last page was
    /// short and every counted item is stored.
    fn holds_all_known(&self) -> bool {
        !self.has_more && self.order_len() >= self.total_count
    }

    /// Whether every index in the populated range of `page` is filled.
    #[must_use]
    pub fn verify_page(&self, page: usize) -> bool {
        let start = page * self.page_size;
        let end = (start + self.page_size).min(self.order_len());
        (start..end).all(|i| self.slots.contains_key(&i))
    }

    /// Removes foreign items, backfills missing chat ids and drops orphans.
    pub fn validate(&mut self, chat: &ChatId) -> StreamRepair {
        let mut repair = StreamRepair::default();

        let foreign: Vec<T::Id> = self
            .by_id
            .iter()
            .filter(|(_, item)| item.chat_id().is_some_and(|c| c != chat))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &foreign {
            self.by_id.remove(id);
        }
        repair.foreign = foreign.len();

        for item in self.by_id.values_mut() {
            if item.chat_id().is_none() {
                item.set_chat_id(chat.clone());
                repair.backfilled += 1;
            }
        }

        let orphan_slots: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, id)| !self.by_id.contains_key(*id))
            .map(|(i, _)| *i)
            .collect();
        for index in orphan_slots {
            if let Some(id) = self.slots.remove(&index) {
                self.positions.remove(&id);
                if !foreign.contains(&id) {
                    repair.orphans += 1;
                }
            }
        }

        let unplaced: Vec<T::Id> = self
            .by_id
            .keys()
            .filter(|id| !self.positions.contains_key(*id))
            .cloned()
            .collect();
        for id in unplaced {
            self.by_id.remove(&id);
            repair.orphans += 1;
        }

        repair.pages_unmarked = self.unmark_incomplete();
        repair
    }

    /// Puts an unplaced id at `target` and returns the previous occupant,
    /// which is left without a position.
    fn place(&mut self, id: T::Id, target: usize) -> Option<T::Id> {
        let occupant = self.slots.insert(target, id.clone());
        if let Some(previous) = &occupant {
            self.positions.remove(previous);
        }
        self.positions.insert(id, target);
        occupant
    }

    /// Gives unplaced ids consecutive indices after the tail, oldest first.
    fn append_by_timestamp(&mut self, mut ids: Vec<T::Id>) {
        ids.sort_by_key(|id| self.by_id.get(id).map(|item| item.timestamp()));
        for id in ids {
            let index = self.order_len();
            self.positions.insert(id.clone(), index);
            self.slots.insert(index, id);
        }
    }

    /// Moves a known id from `from` to `target`, swapping any occupant into
    /// the vacated slot.
    fn relocate(&mut self, id: &T::Id, from: usize, target: usize) {
        self.slots.remove(&from);
        if let Some(occupant) = self.slots.remove(&target) {
            self.positions.insert(occupant.clone(), from);
            self.slots.insert(from, occupant);
        }
        self.positions.insert(id.clone(), target);
        self.slots.insert(target, id.clone());
    }

    /// Drops loaded pages that have a hole. Returns how many were dropped.
    fn unmark_incomplete(&mut self) -> usize {
        let broken: Vec<usize> = self
            .loaded_pages
            .iter()
            .copied()
            .filter(|p| !self.verify_page(*p))
            .collect();
        for page in &broken {
            self.loaded_pages.remove(page);
        }
        broken.len()
    }
}
