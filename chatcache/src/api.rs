//! REST reads against the chat service.
//!
//! [`RestApi`] is the seam the service depends on; [`HttpApi`] implements
//! it with `reqwest`. Responses are normalized on arrival, so callers only
//! see typed values.

use std::future::Future;
use std::time::Duration;

use chatcache_proto::message::{ChatId, ChatSummary, FileItem, UserId};
use serde_json::Value;
use url::Url;

use crate::normalize;
use crate::service::ChatPage;

/// Errors from the REST API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request could not be sent or the body not read.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// A request URL could not be built.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The body did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

/// Read-only REST operations the cache needs.
pub trait RestApi: Send + Sync + 'static {
    /// The user's recently active chats.
    fn recent_chats(
        &self,
        user: &UserId,
        page: usize,
        page_size: usize,
    ) -> impl Future<Output = Result<Vec<ChatSummary>, ApiError>> + Send;

    /// Total number of messages in a chat.
    fn message_count(
        &self,
        chat: &ChatId,
    ) -> impl Future<Output = Result<usize, ApiError>> + Send;

    /// One page of a chat's messages, files and timeline.
    fn chat_page(
        &self,
        chat: &ChatId,
        user: &UserId,
        page: usize,
        page_size: usize,
    ) -> impl Future<Output = Result<ChatPage, ApiError>> + Send;

    /// Files the user shared recently.
    fn recent_files(
        &self,
        user: &UserId,
        page: usize,
        page_size: usize,
    ) -> impl Future<Output = Result<Vec<FileItem>, ApiError>> + Send;
}

/// [`RestApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpApi {
    /// Creates a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Url`] if `base_url` is not a valid URL, or
    /// [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: Url::parse(base_url)?,
        })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, ApiError> {
        let mut url = self.base.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    async fn get_json(&self, url: Url) -> Result<Value, ApiError> {
        tracing::debug!(url = %url, "GET");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

fn paging(page: usize, page_size: usize) -> [(&'static str, String); 2] {
    [("page", page.to_string()), ("pageSize", page_size.to_string())]
}

impl RestApi for HttpApi {
    async fn recent_chats(
        &self,
        user: &UserId,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<ChatSummary>, ApiError> {
        let url = self.url(
            &format!("api/message-tracker/messages/recent/{user}"),
            &paging(page, page_size),
        )?;
        Ok(normalize::chat_list(&self.get_json(url).await?))
    }

    async fn message_count(&self, chat: &ChatId) -> Result<usize, ApiError> {
        let url = self.url(&format!("api/message-tracker/messages/chatId/{chat}/count"), &[])?;
        let body = self.get_json(url).await?;
        normalize::count(&body).ok_or_else(|| ApiError::Shape(format!("no count in {body}")))
    }

    async fn chat_page(
        &self,
        chat: &ChatId,
        user: &UserId,
        page: usize,
        page_size: usize,
    ) -> Result<ChatPage, ApiError> {
        let [p, s] = paging(page, page_size);
        let url = self.url(
            &format!("api/chat/{chat}/data"),
            &[("userId", user.to_string()), p, s],
        )?;
        let body = self.get_json(url).await?;
        if !body.is_object() {
            return Err(ApiError::Shape("chat page is not an object".to_string()));
        }
        Ok(normalize::chat_page(&body))
    }

    async fn recent_files(
        &self,
        user: &UserId,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<FileItem>, ApiError> {
        let url = self.url(&format!("api/files/recent/{user}"), &paging(page, page_size))?;
        Ok(normalize::files(&self.get_json(url).await?))
    }
}
