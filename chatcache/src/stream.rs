//! Streaming ingestion sessions.
//!
//! A [`StreamSession`] subscribes a success and an error destination,
//! publishes one request, and turns every payload arriving on those
//! destinations into a [`StreamEvent`]. Message and file items are run
//! through an [`ItemProcessor`] (normally decryption), one task per item,
//! so a slow or failing item never holds up the others. A
//! `STREAM_COMPLETE` payload waits for the items still in flight, emits
//! [`StreamEvent::Complete`], and ends the session.
//!
//! The session relies on the channel's pump (see
//! [`Channel::spawn_pump`]) to dispatch deliveries.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chatcache_proto::broker::ReplyTo;
use chatcache_proto::message::{ChatId, ChatSummary, FileItem, Message, UserId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};

use crate::decrypt::DecryptionClient;
use crate::normalize::{self, StreamPayload};
use crate::router::{HandlerError, HandlerId};
use crate::service::ChatPage;
use crate::transport::channel::Channel;
use crate::transport::{Transport, TransportError};

/// Default number of events buffered between a session and its consumer.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Errors starting a session.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// `start` was already called on this session.
    #[error("stream session already started")]
    AlreadyStarted,

    /// Subscribing or publishing the request failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// What to request and where the stream answers.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Destination the request is published to.
    pub destination: String,
    /// Request body.
    pub payload: Value,
    /// Destination stream items arrive on.
    pub success_destination: String,
    /// Destination a stream failure arrives on.
    pub error_destination: String,
    /// Whether the destinations belong to this session alone.
    pub per_request: bool,
}

impl StreamConfig {
    /// A stream answering on private `/user/{user}/queue/{queue}-scss/{id}`
    /// and `-err/{id}` destinations.
    #[must_use]
    pub fn for_user(user: &UserId, destination: &str, queue: &str, payload: Value) -> Self {
        let id = uuid::Uuid::now_v7();
        Self {
            destination: destination.to_string(),
            payload,
            success_destination: format!("/user/{user}/queue/{queue}-scss/{id}"),
            error_destination: format!("/user/{user}/queue/{queue}-err/{id}"),
            per_request: true,
        }
    }
}

/// A processed stream item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// One message.
    Message {
        /// Chat the message belongs to.
        chat_id: ChatId,
        /// The processed message.
        message: Message,
    },
    /// One file record.
    File {
        /// Chat the file belongs to.
        chat_id: ChatId,
        /// The processed file.
        file: FileItem,
    },
    /// A chat summary.
    Chat(ChatSummary),
    /// A page of a chat's data.
    Page {
        /// The chat.
        chat_id: ChatId,
        /// Page number.
        page: usize,
        /// Page contents.
        data: ChatPage,
    },
}

/// Events emitted by a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An item was received and processed.
    Item(StreamItem),
    /// The stream ended normally. Always the last event.
    Complete,
    /// The remote side reported a failure. Always the last event.
    Error(String),
    /// Processing one item failed; the stream goes on.
    ProcessingError {
        /// The raw payload of the item.
        item: Value,
        /// Why processing failed.
        reason: String,
    },
    /// A payload that could not be understood.
    InvalidData(Value),
}

/// Per-item processing applied to streamed messages and files.
pub trait ItemProcessor: Send + Sync + 'static {
    /// Processes one message of `chat`.
    fn process_message(
        &self,
        chat: &ChatId,
        message: Message,
    ) -> impl Future<Output = Result<Message, String>> + Send;

    /// Processes one file of `chat`.
    fn process_file(
        &self,
        chat: &ChatId,
        file: FileItem,
    ) -> impl Future<Output = Result<FileItem, String>> + Send;
}

/// Processor that returns items unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ItemProcessor for PassThrough {
    async fn process_message(&self, _chat: &ChatId, message: Message) -> Result<Message, String> {
        Ok(message)
    }

    async fn process_file(&self, _chat: &ChatId, file: FileItem) -> Result<FileItem, String> {
        Ok(file)
    }
}

impl<T: Transport> ItemProcessor for DecryptionClient<T> {
    async fn process_message(&self, chat: &ChatId, message: Message) -> Result<Message, String> {
        self.decrypt_message(chat, message)
            .await
            .map_err(|e| e.to_string())
    }

    async fn process_file(&self, chat: &ChatId, file: FileItem) -> Result<FileItem, String> {
        self.decrypt_file(chat, file).await.map_err(|e| e.to_string())
    }
}

enum Raw {
    Data(Value),
    Failure(Value),
}

struct Registrations {
    success: HandlerId,
    error: HandlerId,
    task: Option<AbortHandle>,
}

struct Shared<T: Transport> {
    channel: Arc<Channel<T>>,
    config: StreamConfig,
    registrations: Mutex<Option<Registrations>>,
}

impl<T: Transport> Shared<T> {
    /// Removes the handlers once. Returns `false` if already torn down.
    fn teardown(&self, abort: bool) -> bool {
        let Some(regs) = self.registrations.lock().take() else {
            return false;
        };
        let router = self.channel.router();
        router.unsubscribe(&self.config.success_destination, regs.success);
        router.unsubscribe(&self.config.error_destination, regs.error);
        if self.config.per_request {
            self.channel.release(&self.config.success_destination);
            self.channel.release(&self.config.error_destination);
        }
        if abort && let Some(task) = regs.task {
            task.abort();
        }
        true
    }
}

/// One streaming request.
pub struct StreamSession<T: Transport, P: ItemProcessor> {
    shared: Arc<Shared<T>>,
    processor: Arc<P>,
    started: AtomicBool,
    capacity: usize,
}

impl<T: Transport, P: ItemProcessor> StreamSession<T, P> {
    /// Creates a session. Nothing is sent until [`StreamSession::start`].
    pub fn new(channel: Arc<Channel<T>>, processor: Arc<P>, config: StreamConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                config,
                registrations: Mutex::new(None),
            }),
            processor,
            started: AtomicBool::new(false),
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Sets how many events may queue up before the session waits for the
    /// consumer.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Subscribes both destinations, publishes the request, and returns the
    /// event receiver.
    ///
    /// # Errors
    ///
    /// - [`StreamError::AlreadyStarted`] on a second call.
    /// - [`StreamError::Transport`] if subscribing or publishing fails; the
    ///   handlers are removed again.
    pub async fn start(&self) -> Result<mpsc::Receiver<StreamEvent>, StreamError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyStarted);
        }
        let shared = &self.shared;
        let config = &shared.config;
        let router = shared.channel.router();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let data_tx = raw_tx.clone();
        let success = router.subscribe(&config.success_destination, move |v| {
            data_tx
                .send(Raw::Data(v.clone()))
                .map_err(|_| HandlerError::new("stream session closed"))
        });
        let error = router.subscribe(&config.error_destination, move |v| {
            raw_tx
                .send(Raw::Failure(v.clone()))
                .map_err(|_| HandlerError::new("stream session closed"))
        });
        *shared.registrations.lock() = Some(Registrations {
            success,
            error,
            task: None,
        });

        if let Err(e) = self.open().await {
            tracing::warn!(destination = %config.destination, error = %e, "stream request failed");
            shared.teardown(true);
            return Err(e.into());
        }

        let (events_tx, events_rx) = mpsc::channel(self.capacity);
        let task = tokio::spawn(run(
            Arc::clone(shared),
            Arc::clone(&self.processor),
            raw_rx,
            events_tx,
        ));
        match shared.registrations.lock().as_mut() {
            Some(regs) => regs.task = Some(task.abort_handle()),
            None => task.abort(),
        }
        tracing::debug!(destination = %config.destination, "stream started");
        Ok(events_rx)
    }

    /// Stops the session. Idempotent; returns `true` on the call that
    /// actually tore it down.
    pub fn stop(&self) -> bool {
        self.shared.teardown(true)
    }

    /// Whether the session is subscribed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.registrations.lock().is_some()
    }

    async fn open(&self) -> Result<(), TransportError> {
        let channel = &self.shared.channel;
        let config = &self.shared.config;
        channel.ensure_subscribed(&config.success_destination).await?;
        channel.ensure_subscribed(&config.error_destination).await?;
        let reply_to = ReplyTo {
            success: config.success_destination.clone(),
            error: config.error_destination.clone(),
        };
        channel
            .publish_json(&config.destination, Some(reply_to), &config.payload)
            .await
    }
}

impl<T: Transport, P: ItemProcessor> Drop for StreamSession<T, P> {
    fn drop(&mut self) {
        self.shared.teardown(true);
    }
}

async fn run<T: Transport, P: ItemProcessor>(
    shared: Arc<Shared<T>>,
    processor: Arc<P>,
    mut raw: mpsc::UnboundedReceiver<Raw>,
    events: mpsc::Sender<StreamEvent>,
) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            next = raw.recv() => {
                let Some(next) = next else { break };
                let value = match next {
                    Raw::Failure(v) => {
                        let message = normalize::error_message(&v);
                        tracing::warn!(error = %message, "stream failed");
                        let _ = events.send(StreamEvent::Error(message)).await;
                        shared.teardown(false);
                        break;
                    }
                    Raw::Data(v) => v,
                };
                match normalize::stream_payload(&value) {
                    StreamPayload::Complete => {
                        while in_flight.join_next().await.is_some() {}
                        let _ = events.send(StreamEvent::Complete).await;
                        shared.teardown(false);
                        tracing::debug!("stream complete");
                        break;
                    }
                    StreamPayload::Message { chat_id: Some(chat_id), message } => {
                        let (processor, events) = (Arc::clone(&processor), events.clone());
                        in_flight.spawn(async move {
                            let event = match processor.process_message(&chat_id, message).await {
                                Ok(message) => StreamEvent::Item(StreamItem::Message { chat_id, message }),
                                Err(reason) => StreamEvent::ProcessingError { item: value, reason },
                            };
                            let _ = events.send(event).await;
                        });
                    }
                    StreamPayload::File { chat_id: Some(chat_id), file } => {
                        let (processor, events) = (Arc::clone(&processor), events.clone());
                        in_flight.spawn(async move {
                            let event = match processor.process_file(&chat_id, file).await {
                                Ok(file) => StreamEvent::Item(StreamItem::File { chat_id, file }),
                                Err(reason) => StreamEvent::ProcessingError { item: value, reason },
                            };
                            let _ = events.send(event).await;
                        });
                    }
                    StreamPayload::Chat(summary) => {
                        let _ = events.send(StreamEvent::Item(StreamItem::Chat(summary))).await;
                    }
                    StreamPayload::Page { chat_id, page, data } => {
                        let item = StreamItem::Page { chat_id, page, data };
                        let _ = events.send(StreamEvent::Item(item)).await;
                    }
                    StreamPayload::Message { chat_id: None, .. }
                    | StreamPayload::File { chat_id: None, .. }
                    | StreamPayload::Invalid => {
                        tracing::debug!("invalid stream payload");
                        let _ = events.send(StreamEvent::InvalidData(value)).await;
                    }
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "stream item task failed");
                }
            }
        }
    }
}
