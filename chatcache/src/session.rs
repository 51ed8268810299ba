//! A signed-in client: every component wired together.
//!
//! [`Session`] constructs and owns the router, correlated client, cache
//! service, chat directory, event bus, preloader and batch loader for one
//! user. Nothing is global; dropping the session stops its tasks.

use std::sync::Arc;

use chatcache_proto::message::{ChatId, ChatSummary, UserId};
use serde_json::json;
use tokio::task::JoinHandle;

use crate::api::RestApi;
use crate::config::ClientConfig;
use crate::correlation::{CallOptions, CorrelatedClient};
use crate::decrypt::DecryptionClient;
use crate::directory::ChatDirectory;
use crate::events::{AppEvent, DirectoryUpdate, EventBus, UpdateQueue, UpdateSender};
use crate::ingest::{IngestReport, StreamIngestor};
use crate::loader::{BatchLoader, LoaderTasks, UnitLoader};
use crate::normalize;
use crate::preload::Preloader;
use crate::router::Router;
use crate::service::{ChatBackend, ChatData, ChatDataService, InitReport, RemoteBackend, ServiceError};
use crate::stream::{StreamConfig, StreamError, StreamSession};
use crate::transport::Transport;
use crate::transport::channel::Channel;

/// Destination the user's chat list is requested from.
pub const USER_CHATS_ACTION: &str = "/app/get-user-chats";

const EVENT_BUS_CAPACITY: usize = 256;

/// Loads the first page of a chat for the batch loader.
pub struct FirstPageLoader<B: ChatBackend> {
    service: ChatDataService<B>,
    user: UserId,
}

impl<B: ChatBackend> UnitLoader for FirstPageLoader<B> {
    async fn load(&self, chat: ChatId) -> Result<(), String> {
        self.service
            .get_data(&chat, &self.user, 0, false)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

type Backend<T, A> = RemoteBackend<T, A>;

/// One user's client.
pub struct Session<T: Transport, A: RestApi> {
    user: UserId,
    channel: Arc<Channel<T>>,
    client: CorrelatedClient<T>,
    decrypt: DecryptionClient<T>,
    service: ChatDataService<Backend<T, A>>,
    directory: Arc<ChatDirectory>,
    bus: EventBus,
    updates: UpdateSender,
    preloader: Arc<Preloader<Backend<T, A>>>,
    loader: BatchLoader<FirstPageLoader<Backend<T, A>>>,
    _loader_tasks: LoaderTasks,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport, A: RestApi> Session<T, A> {
    /// Wires a session for `user` over `transport` and `api`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<T>, api: A, user: UserId, config: &ClientConfig) -> Self {
        let channel = Channel::new(transport, Arc::new(Router::new()));
        let pump = channel.spawn_pump();

        let client = CorrelatedClient::new(Arc::clone(&channel), config.call_timeout);
        let decrypt = DecryptionClient::new(client.clone(), user.clone(), config.decrypt);
        let backend = RemoteBackend::new(api, decrypt.clone(), config.preload.recent_chats);
        let service = ChatDataService::new(backend, config.cache);

        let directory = Arc::new(ChatDirectory::new());
        let bus = EventBus::new(EVENT_BUS_CAPACITY);
        let (updates, update_task) = UpdateQueue::spawn(Arc::clone(&directory), bus.clone());

        let evictions = bus.clone();
        service.add_eviction_listener(move |chat| {
            evictions.publish(AppEvent::ChatEvicted(chat.clone()));
        });

        let preloader = Arc::new(Preloader::new(
            service.clone(),
            Arc::clone(&directory),
            config.preload,
        ));
        preloader.set_user(user.clone());
        let preload_task = Arc::clone(&preloader).spawn(&bus);

        let loader = BatchLoader::new(
            FirstPageLoader {
                service: service.clone(),
                user: user.clone(),
            },
            config.loader,
        );
        let loader_tasks = loader.spawn();

        tracing::info!(user_id = %user, "session started");
        Self {
            user,
            channel,
            client,
            decrypt,
            service,
            directory,
            bus,
            updates,
            preloader,
            loader,
            _loader_tasks: loader_tasks,
            tasks: vec![pump, update_task, preload_task],
        }
    }

    /// The signed-in user.
    #[must_use]
    pub const fn user(&self) -> &UserId {
        &self.user
    }

    /// The data service.
    #[must_use]
    pub const fn service(&self) -> &ChatDataService<Backend<T, A>> {
        &self.service
    }

    /// The chat directory.
    #[must_use]
    pub fn directory(&self) -> &ChatDirectory {
        &self.directory
    }

    /// The event bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The correlated client.
    #[must_use]
    pub const fn client(&self) -> &CorrelatedClient<T> {
        &self.client
    }

    /// The chat preloader.
    #[must_use]
    pub fn preloader(&self) -> &Preloader<Backend<T, A>> {
        &self.preloader
    }

    /// The batch loader.
    #[must_use]
    pub const fn loader(&self) -> &BatchLoader<FirstPageLoader<Backend<T, A>>> {
        &self.loader
    }

    /// Announces the user, which makes the preloader queue their recent
    /// chats.
    pub fn authenticate(&self) {
        self.bus
            .publish(AppEvent::UserAuthenticated(self.user.clone()));
    }

    /// Announces that the user opened `chat`.
    pub fn activate_chat(&self, chat: &ChatId) {
        self.bus.publish(AppEvent::ChatActivated(chat.clone()));
    }

    /// Requests the user's chats over the broker and puts them in the
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns the call error.
    pub async fn load_user_chats(&self) -> Result<Vec<ChatSummary>, ServiceError> {
        let answer = self
            .client
            .call(
                USER_CHATS_ACTION,
                &json!({ "userId": self.user }),
                CallOptions::for_request(&self.user, "user-chats"),
            )
            .await?;
        let chats = normalize::chat_list(&answer);
        for chat in &chats {
            self.updates.send(DirectoryUpdate::Upsert(chat.clone()));
        }
        self.updates.flush().await;
        tracing::info!(count = chats.len(), "user chats loaded");
        Ok(chats)
    }

    /// See [`ChatDataService::get_data`].
    ///
    /// # Errors
    ///
    /// Returns the fetch error.
    pub async fn get_data(
        &self,
        chat: &ChatId,
        page: usize,
        force_refresh: bool,
    ) -> Result<ChatData, ServiceError> {
        self.service.get_data(chat, &self.user, page, force_refresh).await
    }

    /// See [`ChatDataService::init_cache`].
    ///
    /// # Errors
    ///
    /// Fails if the recent-chat listing fails.
    pub async fn init_cache(&self, active: Option<&ChatId>) -> Result<InitReport, ServiceError> {
        self.service.init_cache(&self.user, active).await
    }

    /// Runs a stream session to its end, decrypting items and merging them
    /// into the cache and the directory.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError`] if the stream cannot be started.
    pub async fn stream(&self, config: StreamConfig) -> Result<IngestReport, StreamError> {
        let session = StreamSession::new(
            Arc::clone(&self.channel),
            Arc::new(self.decrypt.clone()),
            config,
        );
        let events = session.start().await?;
        let ingestor = StreamIngestor::new(self.service.clone(), self.updates.clone())
            .with_preloader(Arc::clone(&self.preloader));
        let report = ingestor.ingest(events).await;
        self.updates.flush().await;
        Ok(report)
    }

    /// Queues chats for supervised background loading.
    pub fn load_in_background(&self, chats: impl IntoIterator<Item = ChatId>) -> usize {
        chats
            .into_iter()
            .filter(|chat| self.loader.enqueue(chat.clone()))
            .count()
    }
}

impl<T: Transport, A: RestApi> Drop for Session<T, A> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
