//! Domain types for chat data as it is cached on the client.
//!
//! These are the normalized, typed forms of the items a chat service hands
//! out: messages, file attachments, timeline entries and chat summaries.
//! Upstream JSON is loose about field names, so normalization into these
//! types happens once at the client's transport boundary; the serde
//! representation here is the canonical camelCase form.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from its string form.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the string form of this identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque identifier of a conversation (direct or group).
    ChatId
);
string_id!(
    /// Opaque identifier of a user.
    UserId
);
string_id!(
    /// Identifier of a chat message.
    MessageId
);
string_id!(
    /// Identifier of a shared file.
    FileId
);
string_id!(
    /// Identifier of a timeline entry.
    TimelineId
);

/// Millisecond-precision UTC timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier of the message.
    pub id: MessageId,
    /// Chat the message belongs to. Some upstream shapes omit it; the
    /// client cache backfills it from the entry the message is stored under.
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    /// Author of the message.
    pub sender_id: UserId,
    /// Decrypted text content.
    #[serde(default)]
    pub content: String,
    /// When the message was created.
    pub timestamp: Timestamp,
    /// System notices (joins, renames) render differently in the timeline.
    #[serde(default)]
    pub is_system: bool,
}

/// A file shared in a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileItem {
    /// Unique identifier of the file.
    pub id: FileId,
    /// Chat the file was shared in.
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    /// Who shared the file.
    pub sender_id: UserId,
    /// Original file name.
    #[serde(default)]
    pub name: String,
    /// Size in bytes, when known.
    #[serde(default)]
    pub size: u64,
    /// MIME type, when known.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// When the file was shared.
    pub timestamp: Timestamp,
}

/// What a timeline entry points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "camelCase")]
pub enum TimelineRef {
    /// A regular message.
    Message(MessageId),
    /// A shared file.
    File(FileId),
    /// A system notice.
    System(MessageId),
}

/// One entry of a chat's unified, chronological view of messages and files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    /// Unique identifier of the entry.
    pub id: TimelineId,
    /// Chat the entry belongs to.
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    /// Timestamp of the referenced item.
    pub timestamp: Timestamp,
    /// The referenced message or file.
    pub item: TimelineRef,
}

impl TimelineItem {
    /// Builds the timeline entry for a message.
    #[must_use]
    pub fn for_message(message: &Message) -> Self {
        let item = if message.is_system {
            TimelineRef::System(message.id.clone())
        } else {
            TimelineRef::Message(message.id.clone())
        };
        Self {
            id: TimelineId::new(format!("msg:{}", message.id)),
            chat_id: message.chat_id.clone(),
            timestamp: message.timestamp,
            item,
        }
    }

    /// Builds the timeline entry for a shared file.
    #[must_use]
    pub fn for_file(file: &FileItem) -> Self {
        Self {
            id: TimelineId::new(format!("file:{}", file.id)),
            chat_id: file.chat_id.clone(),
            timestamp: file.timestamp,
            item: TimelineRef::File(file.id.clone()),
        }
    }

    /// Returns the file this entry references, if any.
    #[must_use]
    pub const fn file_id(&self) -> Option<&FileId> {
        match &self.item {
            TimelineRef::File(id) => Some(id),
            TimelineRef::Message(_) | TimelineRef::System(_) => None,
        }
    }
}

/// Whether a chat is a two-party conversation or a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatKind {
    /// Two participants.
    #[default]
    Direct,
    /// Any number of participants.
    Group,
}

/// Entry in the user's chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    /// The chat.
    pub id: ChatId,
    /// Direct or group.
    #[serde(default)]
    pub kind: ChatKind,
    /// Display name, if the chat has one.
    #[serde(default)]
    pub name: Option<String>,
    /// Preview of the most recent message.
    #[serde(default)]
    pub last_message: Option<String>,
    /// Time of the most recent activity.
    #[serde(default)]
    pub last_activity: Option<Timestamp>,
}

impl ChatSummary {
    /// Creates a summary with no name or activity recorded.
    pub fn new(id: impl Into<ChatId>, kind: ChatKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            last_message: None,
            last_activity: None,
        }
    }
}
