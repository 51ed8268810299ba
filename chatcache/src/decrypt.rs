//! Decryption of messages and files through correlated broker calls.
//!
//! Items go out in chunks of `chunk_size`, paced by `chunk_delay`. Each
//! chunk is one call on private per-request destinations. Answers are
//! merged back by id, so an item the server leaves out keeps its original
//! (encrypted) content.

use std::collections::HashMap;
use std::time::Duration;

use chatcache_proto::message::{ChatId, FileItem, Message, UserId};
use serde_json::{Value, json};

use crate::correlation::{CallError, CallOptions, CorrelatedClient};
use crate::normalize;
use crate::transport::Transport;

/// Destination message decryption requests are published to.
pub const DECRYPT_MESSAGES_ACTION: &str = "/app/get-decrypted-messages";
/// Destination file decryption requests are published to.
pub const DECRYPT_FILES_ACTION: &str = "/app/get-decrypted-files";

const MESSAGES_QUEUE: &str = "decrypted-messages";
const FILES_QUEUE: &str = "decrypted-files";

/// Decryption call tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptConfig {
    /// Timeout of one batch call.
    pub batch_timeout: Duration,
    /// Timeout of a single-item call.
    pub single_timeout: Duration,
    /// Items per call.
    pub chunk_size: usize,
    /// Pause between consecutive chunks.
    pub chunk_delay: Duration,
}

impl Default for DecryptConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_secs(45),
            single_timeout: Duration::from_secs(10),
            chunk_size: 50,
            chunk_delay: Duration::from_millis(100),
        }
    }
}

/// Client for the decryption actions.
pub struct DecryptionClient<T: Transport> {
    client: CorrelatedClient<T>,
    user: UserId,
    config: DecryptConfig,
}

impl<T: Transport> Clone for DecryptionClient<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            user: self.user.clone(),
            config: self.config,
        }
    }
}

impl<T: Transport> DecryptionClient<T> {
    /// Creates a client answering on `user`'s queues.
    pub fn new(client: CorrelatedClient<T>, user: UserId, config: DecryptConfig) -> Self {
        Self {
            client,
            user,
            config,
        }
    }

    /// The user whose queues receive the answers.
    #[must_use]
    pub const fn user(&self) -> &UserId {
        &self.user
    }

    /// Decrypts `messages` of `chat`, preserving their order.
    ///
    /// # Errors
    ///
    /// Returns the first failing chunk's [`CallError`].
    pub async fn decrypt_messages(
        &self,
        chat: &ChatId,
        messages: Vec<Message>,
    ) -> Result<Vec<Message>, CallError> {
        let mut out = Vec::with_capacity(messages.len());
        for (i, chunk) in messages.chunks(self.config.chunk_size.max(1)).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            let payload = json!({ "chatId": chat, "messages": chunk });
            let answer = self
                .request(DECRYPT_MESSAGES_ACTION, MESSAGES_QUEUE, &payload, self.config.batch_timeout)
                .await?;
            let decrypted: HashMap<_, _> = normalize::messages(&answer)
                .into_iter()
                .map(|m| (m.id.clone(), m))
                .collect();
            out.extend(chunk.iter().map(|m| merge_message(m, decrypted.get(&m.id))));
        }
        tracing::debug!(chat_id = %chat, count = out.len(), "messages decrypted");
        Ok(out)
    }

    /// Decrypts one message.
    ///
    /// # Errors
    ///
    /// Returns the call error, or [`CallError::Remote`] if the answer holds
    /// no message.
    pub async fn decrypt_message(&self, chat: &ChatId, message: Message) -> Result<Message, CallError> {
        let payload = json!({
            "chatId": message.chat_id.as_ref().unwrap_or(chat),
            "messages": [&message],
        });
        let answer = self
            .request(DECRYPT_MESSAGES_ACTION, MESSAGES_QUEUE, &payload, self.config.single_timeout)
            .await?;
        let decrypted = normalize::messages(&answer)
            .into_iter()
            .next()
            .ok_or_else(|| CallError::Remote {
                message: "no decrypted messages returned".to_string(),
            })?;
        Ok(merge_message(&message, Some(&decrypted)))
    }

    /// Decrypts `files` of `chat`, preserving their order.
    ///
    /// # Errors
    ///
    /// Returns the first failing chunk's [`CallError`].
    pub async fn decrypt_files(
        &self,
        chat: &ChatId,
        files: Vec<FileItem>,
    ) -> Result<Vec<FileItem>, CallError> {
        let mut out = Vec::with_capacity(files.len());
        for (i, chunk) in files.chunks(self.config.chunk_size.max(1)).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            let payload = json!({ "chatId": chat, "files": chunk });
            let answer = self
                .request(DECRYPT_FILES_ACTION, FILES_QUEUE, &payload, self.config.batch_timeout)
                .await?;
            let decrypted: HashMap<_, _> = normalize::files(&answer)
                .into_iter()
                .map(|f| (f.id.clone(), f))
                .collect();
            out.extend(chunk.iter().map(|f| merge_file(f, decrypted.get(&f.id))));
        }
        Ok(out)
    }

    /// Decrypts one file record.
    ///
    /// # Errors
    ///
    /// Returns the call error, or [`CallError::Remote`] if the answer holds
    /// no file.
    pub async fn decrypt_file(&self, chat: &ChatId, file: FileItem) -> Result<FileItem, CallError> {
        let payload = json!({
            "chatId": file.chat_id.as_ref().unwrap_or(chat),
            "files": [&file],
        });
        let answer = self
            .request(DECRYPT_FILES_ACTION, FILES_QUEUE, &payload, self.config.single_timeout)
            .await?;
        let decrypted = normalize::files(&answer)
            .into_iter()
            .next()
            .ok_or_else(|| CallError::Remote {
                message: "no decrypted files returned".to_string(),
            })?;
        Ok(merge_file(&file, Some(&decrypted)))
    }

    async fn request(
        &self,
        action: &str,
        queue: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let options = CallOptions::for_request(&self.user, queue).with_timeout(timeout);
        self.client.call(action, payload, options).await
    }
}

/// Takes the decrypted content, keeping identity and placement fields from
/// the original when the answer lacks them.
fn merge_message(original: &Message, decrypted: Option<&Message>) -> Message {
    let Some(d) = decrypted else {
        return original.clone();
    };
    Message {
        id: original.id.clone(),
        chat_id: original.chat_id.clone().or_else(|| d.chat_id.clone()),
        sender_id: if d.sender_id.as_str().is_empty() {
            original.sender_id.clone()
        } else {
            d.sender_id.clone()
        },
        content: d.content.clone(),
        timestamp: original.timestamp,
        is_system: original.is_system || d.is_system,
    }
}

fn merge_file(original: &FileItem, decrypted: Option<&FileItem>) -> FileItem {
    let Some(d) = decrypted else {
        return original.clone();
    };
    FileItem {
        id: original.id.clone(),
        chat_id: original.chat_id.clone().or_else(|| d.chat_id.clone()),
        sender_id: original.sender_id.clone(),
        name: if d.name.is_empty() {
            original.name.clone()
        } else {
            d.name.clone()
        },
        size: if d.size == 0 { original.size } else { d.size },
        mime_type: d.mime_type.clone().or_else(|| original.mime_type.clone()),
        timestamp: original.timestamp,
    }
}
