//! Draining stream events into the cache and the chat directory.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::events::{DirectoryUpdate, UpdateSender};
use crate::preload::Preloader;
use crate::service::{ChatBackend, ChatDataService};
use crate::stream::{StreamEvent, StreamItem};

/// What one ingestion run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// New messages cached.
    pub messages: usize,
    /// New files cached.
    pub files: usize,
    /// Chat summaries forwarded to the directory.
    pub chats: usize,
    /// Pages merged.
    pub pages: usize,
    /// Items whose processing failed.
    pub processing_errors: usize,
    /// Payloads that could not be understood.
    pub invalid: usize,
    /// Whether the stream ended with `Complete`.
    pub completed: bool,
    /// The remote failure the stream ended with, if any.
    pub error: Option<String>,
}

/// Applies stream events to a [`ChatDataService`].
pub struct StreamIngestor<B: ChatBackend> {
    service: ChatDataService<B>,
    updates: UpdateSender,
    preloader: Option<Arc<Preloader<B>>>,
}

impl<B: ChatBackend> StreamIngestor<B> {
    /// Creates an ingestor writing to `service` and `updates`.
    pub fn new(service: ChatDataService<B>, updates: UpdateSender) -> Self {
        Self {
            service,
            updates,
            preloader: None,
        }
    }

    /// Also schedules every streamed chat for preloading.
    #[must_use]
    pub fn with_preloader(mut self, preloader: Arc<Preloader<B>>) -> Self {
        self.preloader = Some(preloader);
        self
    }

    /// Consumes events until the session closes its sender.
    pub async fn ingest(&self, mut events: mpsc::Receiver<StreamEvent>) -> IngestReport {
        let mut report = IngestReport::default();
        while let Some(event) = events.recv().await {
            self.apply(event, &mut report);
        }
        tracing::info!(
            messages = report.messages,
            files = report.files,
            chats = report.chats,
            pages = report.pages,
            processing_errors = report.processing_errors,
            invalid = report.invalid,
            completed = report.completed,
            "stream ingested"
        );
        report
    }

    fn apply(&self, event: StreamEvent, report: &mut IngestReport) {
        match event {
            StreamEvent::Item(StreamItem::Message { chat_id, message }) => {
                let (preview, at) = (message.content.clone(), message.timestamp);
                if self.service.add_message(&chat_id, message) {
                    report.messages += 1;
                    self.updates.send(DirectoryUpdate::LastMessage {
                        chat_id,
                        preview,
                        at,
                    });
                }
            }
            StreamEvent::Item(StreamItem::File { chat_id, file }) => {
                if self.service.add_file(&chat_id, file) {
                    report.files += 1;
                }
            }
            StreamEvent::Item(StreamItem::Chat(summary)) => {
                if let Some(preloader) = &self.preloader {
                    preloader.schedule(&summary);
                }
                self.updates.send(DirectoryUpdate::Upsert(summary));
                report.chats += 1;
            }
            StreamEvent::Item(StreamItem::Page {
                chat_id,
                page,
                data,
            }) => {
                self.service.add_chat_data_page(&chat_id, data, page);
                report.pages += 1;
            }
            StreamEvent::Complete => report.completed = true,
            StreamEvent::Error(message) => {
                tracing::warn!(error = %message, "stream ended with an error");
                report.error = Some(message);
            }
            StreamEvent::ProcessingError { reason, .. } => {
                tracing::warn!(reason = %reason, "stream item dropped");
                report.processing_errors += 1;
            }
            StreamEvent::InvalidData(value) => {
                tracing::debug!(payload = %value, "invalid stream payload ignored");
                report.invalid += 1;
            }
        }
    }
}
