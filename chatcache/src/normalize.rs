//! Wire-shape normalization.
//!
//! The chat service is loose about its JSON: ids arrive as `id` or
//! `messageId`, timestamps as epoch millis or RFC 3339 strings, lists nested
//! under `data` or not. Everything that comes off the transport or the REST
//! API passes through this module once and leaves as a typed value; nothing
//! past it inspects raw JSON.
//!
//! Entries that cannot be normalized (no id) are skipped and logged at
//! debug level rather than failing the whole payload.

use chatcache_proto::message::{
    ChatId, ChatKind, ChatSummary, FileId, FileItem, Message, MessageId, Timestamp, TimelineId,
    TimelineItem, TimelineRef, UserId,
};
use serde_json::Value;

use crate::service::ChatPage;

/// First of `keys` present on `v` and not null.
fn field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| v.get(*k))
        .find(|x| !x.is_null())
}

/// String form of the first present key. Numbers are accepted as ids.
fn string_field(v: &Value, keys: &[&str]) -> Option<String> {
    match field(v, keys)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bool_field(v: &Value, keys: &[&str]) -> Option<bool> {
    match field(v, keys)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        _ => None,
    }
}

fn usize_field(v: &Value, keys: &[&str]) -> Option<usize> {
    field(v, keys).and_then(as_usize)
}

fn as_usize(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses a timestamp from epoch millis (number or numeric string) or an
/// RFC 3339 / naive ISO-8601 string (taken as UTC).
#[must_use]
pub fn parse_timestamp(v: &Value) -> Option<Timestamp> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Timestamp::from_millis),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(millis) = s.parse::<u64>() {
                return Some(Timestamp::from_millis(millis));
            }
            let millis = chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .or_else(|_| {
                    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                        .map(|dt| dt.and_utc().timestamp_millis())
                })
                .ok()?;
            u64::try_from(millis).ok().map(Timestamp::from_millis)
        }
        _ => None,
    }
}

fn timestamp_field(v: &Value, keys: &[&str]) -> Timestamp {
    field(v, keys)
        .and_then(parse_timestamp)
        .unwrap_or_default()
}

fn chat_id_field(v: &Value) -> Option<ChatId> {
    string_field(v, &["chatId", "chat_id"]).map(ChatId::from)
}

/// Finds the item array in the usual places: the value itself, `data.<key>`,
/// `<key>`, or `data` when it is an array.
fn list<'a>(v: &'a Value, key: &str) -> &'a [Value] {
    if let Some(arr) = v.as_array() {
        return arr;
    }
    let candidates = [
        v.get("data").and_then(|d| d.get(key)),
        v.get(key),
        v.get("data"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
}

/// Normalizes one message.
#[must_use]
pub fn message(v: &Value) -> Option<Message> {
    let id = string_field(v, &["id", "messageId", "message_id"])?;
    let is_system = bool_field(v, &["isSystem", "system"]).unwrap_or_else(|| {
        field(v, &["messageType", "type"])
            .and_then(Value::as_str)
            .is_some_and(|t| t.eq_ignore_ascii_case("system"))
    });
    Some(Message {
        id: MessageId::from(id),
        chat_id: chat_id_field(v),
        sender_id: UserId::from(
            string_field(v, &["senderId", "sender_id", "userId", "username"]).unwrap_or_default(),
        ),
        content: string_field(v, &["content", "text", "message"]).unwrap_or_default(),
        timestamp: timestamp_field(v, &["timestamp", "createdAt", "created_at", "sentAt"]),
        is_system,
    })
}

/// Normalizes a list of messages from any of the accepted envelopes.
#[must_use]
pub fn messages(v: &Value) -> Vec<Message> {
    collect(list(v, "messages"), message, "message")
}

/// Normalizes one file.
#[must_use]
pub fn file(v: &Value) -> Option<FileItem> {
    let id = string_field(v, &["fileId", "file_id", "id"])?;
    Some(FileItem {
        id: FileId::from(id),
        chat_id: chat_id_field(v),
        sender_id: UserId::from(
            string_field(v, &["senderId", "sender_id", "uploadedBy", "userId"]).unwrap_or_default(),
        ),
        name: string_field(v, &["originalFileName", "fileName", "name"]).unwrap_or_default(),
        size: usize_field(v, &["fileSize", "size"]).map_or(0, |s| s as u64),
        mime_type: string_field(v, &["mimeType", "mime_type", "contentType"]),
        timestamp: timestamp_field(v, &["timestamp", "uploadedAt", "createdAt", "created_at"]),
    })
}

/// Normalizes a list of files.
#[must_use]
pub fn files(v: &Value) -> Vec<FileItem> {
    collect(list(v, "files"), file, "file")
}

/// Normalizes one timeline entry.
#[must_use]
pub fn timeline_item(v: &Value) -> Option<TimelineItem> {
    let kind = string_field(v, &["type", "kind"])
        .unwrap_or_default()
        .to_ascii_lowercase();
    let file_ref = string_field(v, &["fileId", "file_id"]);
    let message_ref = string_field(v, &["messageId", "message_id"]);
    let generic_ref = string_field(v, &["ref", "itemId"]);

    let item = match kind.as_str() {
        "file" => TimelineRef::File(FileId::from(file_ref.or(generic_ref)?)),
        "system" => TimelineRef::System(MessageId::from(message_ref.or(generic_ref)?)),
        _ => match (message_ref, file_ref) {
            (Some(m), _) => TimelineRef::Message(MessageId::from(m)),
            (None, Some(f)) => TimelineRef::File(FileId::from(f)),
            (None, None) => TimelineRef::Message(MessageId::from(generic_ref?)),
        },
    };
    let id = string_field(v, &["id"]).unwrap_or_else(|| match &item {
        TimelineRef::Message(m) | TimelineRef::System(m) => format!("msg:{m}"),
        TimelineRef::File(f) => format!("file:{f}"),
    });
    Some(TimelineItem {
        id: TimelineId::from(id),
        chat_id: chat_id_field(v),
        timestamp: timestamp_field(v, &["timestamp", "createdAt", "created_at"]),
        item,
    })
}

/// Normalizes a list of timeline entries.
#[must_use]
pub fn timeline(v: &Value) -> Vec<TimelineItem> {
    collect(list(v, "timeline"), timeline_item, "timeline")
}

fn collect<T>(items: &[Value], f: impl Fn(&Value) -> Option<T>, what: &str) -> Vec<T> {
    let out: Vec<T> = items.iter().filter_map(&f).collect();
    if out.len() != items.len() {
        tracing::debug!(
            kind = what,
            skipped = items.len() - out.len(),
            "skipped entries without an id"
        );
    }
    out
}

/// Maps `chatType` / `type` to a [`ChatKind`]; anything other than "group"
/// falls back to `default`.
fn chat_kind(v: &Value, default: ChatKind) -> ChatKind {
    match field(v, &["chatType", "type"]).and_then(Value::as_str) {
        Some(t) if t.eq_ignore_ascii_case("group") => ChatKind::Group,
        Some(t) if t.eq_ignore_ascii_case("direct") => ChatKind::Direct,
        _ => default,
    }
}

/// Normalizes one chat summary.
#[must_use]
pub fn chat_summary(v: &Value, default_kind: ChatKind) -> Option<ChatSummary> {
    let id = string_field(v, &["chatId", "chat_id", "id"])?;
    let last_message = field(v, &["lastMessage", "last_message"]).and_then(|m| match m {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => string_field(m, &["content", "text"]),
        _ => None,
    });
    Some(ChatSummary {
        id: ChatId::from(id),
        kind: chat_kind(v, default_kind),
        name: string_field(v, &["name", "chatName", "displayName", "username"]),
        last_message,
        last_activity: field(
            v,
            &["lastMessageTime", "lastActivity", "updatedAt", "timestamp"],
        )
        .and_then(parse_timestamp),
    })
}

/// Normalizes a chat list: a bare array, `data.chats`, `chats`, `data`, or
/// separate `direct` and `groups` arrays (at the top level or under `data`).
#[must_use]
pub fn chat_list(v: &Value) -> Vec<ChatSummary> {
    let root = v.get("data").filter(|d| d.is_object()).unwrap_or(v);
    if root.get("direct").is_some() || root.get("groups").is_some() {
        let direct = root
            .get("direct")
            .and_then(Value::as_array)
            .map_or(&[][..], Vec::as_slice);
        let groups = root
            .get("groups")
            .and_then(Value::as_array)
            .map_or(&[][..], Vec::as_slice);
        let mut out = collect(direct, |c| chat_summary(c, ChatKind::Direct), "chat");
        out.extend(collect(groups, |c| chat_summary(c, ChatKind::Group), "chat"));
        return out;
    }
    collect(
        list(v, "chats"),
        |c| chat_summary(c, ChatKind::Direct),
        "chat",
    )
}

/// Extracts a count from a bare number or `count` / `total` / `data`.
#[must_use]
pub fn count(v: &Value) -> Option<usize> {
    as_usize(v).or_else(|| usize_field(v, &["count", "total", "totalCount", "data"]))
}

/// Extracts a human-readable message from an error payload.
#[must_use]
pub fn error_message(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "unknown error".to_string(),
        _ => match field(v, &["message", "error"]) {
            Some(Value::String(s)) => s.clone(),
            Some(inner @ Value::Object(_)) => error_message(inner),
            _ => v.to_string(),
        },
    }
}

/// Normalizes a chat-data page: `{messages, files, timeline, pagination}`,
/// optionally wrapped in `data`.
#[must_use]
pub fn chat_page(v: &Value) -> ChatPage {
    let root = v.get("data").filter(|d| d.is_object()).unwrap_or(v);
    let pagination = root.get("pagination").unwrap_or(&Value::Null);
    ChatPage {
        messages: root.get("messages").map(messages).unwrap_or_default(),
        files: root.get("files").map(files).unwrap_or_default(),
        timeline: root.get("timeline").map(timeline).unwrap_or_default(),
        total_messages: usize_field(pagination, &["totalMessages", "messageCount"])
            .or_else(|| usize_field(root, &["totalMessages"])),
        total_files: usize_field(pagination, &["totalFiles", "fileCount"])
            .or_else(|| usize_field(root, &["totalFiles"])),
    }
}

/// A stream payload after discriminating on its `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    /// `STREAM_COMPLETE`: the stream has ended.
    Complete,
    /// `MESSAGE_DATA`: one message.
    Message {
        /// Chat from the envelope or the message itself.
        chat_id: Option<ChatId>,
        /// The (still encrypted) message.
        message: Message,
    },
    /// `FILE_DATA`: one file.
    File {
        /// Chat from the envelope or the file itself.
        chat_id: Option<ChatId>,
        /// The (still encrypted) file record.
        file: FileItem,
    },
    /// `CHAT_DATA`: a chat summary.
    Chat(ChatSummary),
    /// `CHAT_PAGE`: a page of a chat's data.
    Page {
        /// The chat.
        chat_id: ChatId,
        /// Page number.
        page: usize,
        /// Page contents.
        data: ChatPage,
    },
    /// Not an object, an unknown `type`, or a known type missing its body.
    Invalid,
}

/// Discriminates a stream payload on its case-insensitive `type`.
#[must_use]
pub fn stream_payload(v: &Value) -> StreamPayload {
    if !v.is_object() {
        return StreamPayload::Invalid;
    }
    let kind = v
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_uppercase();
    let envelope_chat = chat_id_field(v);

    let parsed = match kind.as_str() {
        "STREAM_COMPLETE" => Some(StreamPayload::Complete),
        "MESSAGE_DATA" => v.get("message").and_then(message).map(|m| StreamPayload::Message {
            chat_id: envelope_chat.or_else(|| m.chat_id.clone()),
            message: m,
        }),
        "FILE_DATA" => v.get("file").and_then(file).map(|f| StreamPayload::File {
            chat_id: envelope_chat.or_else(|| f.chat_id.clone()),
            file: f,
        }),
        "CHAT_DATA" => {
            let body = v.get("chat").unwrap_or(v);
            chat_summary(body, ChatKind::Direct).map(StreamPayload::Chat)
        }
        "CHAT_PAGE" => envelope_chat.map(|chat_id| StreamPayload::Page {
            chat_id,
            page: usize_field(v, &["page"]).unwrap_or(0),
            data: chat_page(v),
        }),
        _ => None,
    };
    parsed.unwrap_or(StreamPayload::Invalid)
}
