//! Per-chat cache entry: three paged streams plus access bookkeeping.

use std::collections::HashSet;

use chatcache_proto::message::{ChatId, FileId, FileItem, Message, Timestamp, TimelineItem};

use super::paged::{CacheItem, PagedStream, StreamRepair};

/// Which stream of an entry an item type lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Chat messages.
    Messages,
    /// Shared files.
    Files,
    /// Unified timeline.
    Timeline,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Messages => write!(f, "messages"),
            Self::Files => write!(f, "files"),
            Self::Timeline => write!(f, "timeline"),
        }
    }
}

/// Server-side totals known when an entry is created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountHints {
    /// Total messages.
    pub messages: Option<usize>,
    /// Total files.
    pub files: Option<usize>,
    /// Total timeline entries.
    pub timeline: Option<usize>,
}

/// Selects an item type's stream within a [`ChatCacheEntry`].
pub trait StreamSelect: CacheItem {
    /// The stream this type is stored in.
    const KIND: StreamKind;

    /// Shared access to the stream.
    fn stream(entry: &ChatCacheEntry) -> &PagedStream<Self>;

    /// Mutable access to the stream.
    fn stream_mut(entry: &mut ChatCacheEntry) -> &mut PagedStream<Self>;

    /// Hook run after items of this type were merged.
    fn after_merge(_entry: &mut ChatCacheEntry) {}
}

impl StreamSelect for Message {
    const KIND: StreamKind = StreamKind::Messages;

    fn stream(entry: &ChatCacheEntry) -> &PagedStream<Self> {
        &entry.messages
    }
    fn stream_mut(entry: &mut ChatCacheEntry) -> &mut PagedStream<Self> {
        &mut entry.messages
    }
}

impl StreamSelect for FileItem {
    const KIND: StreamKind = StreamKind::Files;

    fn stream(entry: &ChatCacheEntry) -> &PagedStream<Self> {
        &entry.files
    }
    fn stream_mut(entry: &mut ChatCacheEntry) -> &mut PagedStream<Self> {
        &mut entry.files
    }
    fn after_merge(entry: &mut ChatCacheEntry) {
        entry.synthesize_file_timeline();
    }
}

impl StreamSelect for TimelineItem {
    const KIND: StreamKind = StreamKind::Timeline;

    fn stream(entry: &ChatCacheEntry) -> &PagedStream<Self> {
        &entry.timeline
    }
    fn stream_mut(entry: &mut ChatCacheEntry) -> &mut PagedStream<Self> {
        &mut entry.timeline
    }
}

/// Repairs made by [`ChatCacheEntry::validate`], summed over all streams.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidationReport {
    /// Items removed (foreign chat or orphaned).
    pub removed: usize,
    /// Items whose missing chat id was filled in.
    pub backfilled: usize,
    /// Pages no longer considered loaded.
    pub pages_unmarked: usize,
}

impl ValidationReport {
    fn absorb(&mut self, repair: StreamRepair) {
        self.removed += repair.foreign + repair.orphans;
        self.backfilled += repair.backfilled;
        self.pages_unmarked += repair.pages_unmarked;
    }

    /// Whether the entry needed no repair.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.removed == 0 && self.backfilled == 0 && self.pages_unmarked == 0
    }
}

/// Everything cached for one chat.
#[derive(Debug, Clone)]
pub struct ChatCacheEntry {
    chat_id: ChatId,
    /// Messages.
    pub messages: PagedStream<Message>,
    /// Files.
    pub files: PagedStream<FileItem>,
    /// Timeline.
    pub timeline: PagedStream<TimelineItem>,
    /// Last time the entry was read or written.
    pub last_access: Timestamp,
    /// Last time the entry's contents changed.
    pub last_updated: Timestamp,
}

impl ChatCacheEntry {
    /// Creates an empty entry.
    #[must_use]
    pub fn new(chat_id: ChatId, page_size: usize, hints: CountHints) -> Self {
        let now = Timestamp::now();
        Self {
            chat_id,
            messages: PagedStream::new(page_size, hints.messages),
            files: PagedStream::new(page_size, hints.files),
            timeline: PagedStream::new(page_size, hints.timeline),
            last_access: now,
            last_updated: now,
        }
    }

    /// The chat this entry belongs to.
    #[must_use]
    pub const fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    /// True once no stream expects more pages.
    #[must_use]
    pub const fn is_fully_loaded(&self) -> bool {
        !self.messages.has_more() && !self.files.has_more() && !self.timeline.has_more()
    }

    /// Records a read.
    pub fn touch(&mut self) {
        self.last_access = Timestamp::now();
    }

    /// Records a write.
    pub fn mark_updated(&mut self) {
        let now = Timestamp::now();
        self.last_updated = now;
        self.last_access = now;
    }

    /// Appends a timeline entry for every file nothing in the timeline
    /// refers to yet. Returns how many were added.
    pub fn synthesize_file_timeline(&mut self) -> usize {
        let referenced: HashSet<FileId> = self
            .timeline
            .iter()
            .filter_map(TimelineItem::file_id)
            .cloned()
            .collect();
        let missing: Vec<TimelineItem> = self
            .files
            .iter()
            .filter(|f| !referenced.contains(&f.id))
            .map(TimelineItem::for_file)
            .collect();
        let mut added = 0;
        for item in missing {
            if self.timeline.add_single(item) {
                added += 1;
            }
        }
        added
    }

    /// Repairs all three streams.
    pub fn validate(&mut self) -> ValidationReport {
        let mut report = ValidationReport::default();
        report.absorb(self.messages.validate(&self.chat_id));
        report.absorb(self.files.validate(&self.chat_id));
        report.absorb(self.timeline.validate(&self.chat_id));
        report
    }
}
