//! HTTP transport + paginated inventory retrieval shared by both platform clients.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "sweep-http";

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Opaque API credential. Never printed, not even through `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken([REDACTED])")
    }
}

#[derive(Debug, Clone)]
pub enum Authorization {
    Token(ApiToken),
    Bearer(ApiToken),
}

impl Authorization {
    fn header_value(&self) -> String {
        match self {
            Authorization::Token(token) => format!("token {}", token.expose()),
            Authorization::Bearer(token) => format!("Bearer {}", token.expose()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    RemoteRejection,
    DataShape,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    Rejected { status: u16, url: String, body: String },
    #[error("unexpected response shape from {url}: {reason}")]
    Shape { url: String, reason: String },
    #[error("inventory still had pages after the cap of {pages}")]
    PageCapExceeded { pages: usize },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout { .. } | FetchError::Transport { .. } => ErrorKind::Transport,
            FetchError::Rejected { .. } => ErrorKind::RemoteRejection,
            FetchError::Shape { .. } | FetchError::PageCapExceeded { .. } => ErrorKind::DataShape,
            FetchError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                    let refills = (elapsed.as_nanos() / self.refill_every.as_nanos().max(1))
                        .min(u32::MAX as u128) as u32;
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill = Instant::now();
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn body_text(&self) -> String {
        truncate_body(&self.body)
    }
}

/// Thin reqwest wrapper: every call carries the configured timeout, and failures
/// come back as a typed [`FetchError`] instead of being retried.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<SimpleTokenBucket>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            token_bucket: config.token_bucket.map(SimpleTokenBucket::new),
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, FetchError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        request
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        auth: &Authorization,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let request = self
            .client
            .get(url)
            .header(AUTHORIZATION, auth.header_value())
            .query(query);
        async {
            let response = self.send(request, url).await?;
            decode_json(response, url).await
        }
        .instrument(info_span!("http_fetch", method = "GET", url))
        .await
    }

    pub async fn post_json<B, T>(
        &self,
        url: &str,
        auth: &Authorization,
        body: &B,
    ) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self
            .client
            .post(url)
            .header(AUTHORIZATION, auth.header_value())
            .json(body);
        async {
            let response = self.send(request, url).await?;
            decode_json(response, url).await
        }
        .instrument(info_span!("http_fetch", method = "POST", url))
        .await
    }

    pub async fn delete(
        &self,
        url: &str,
        auth: &Authorization,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self
            .client
            .delete(url)
            .header(AUTHORIZATION, auth.header_value())
            .query(query);
        async {
            let response = self.send(request, url).await?;
            let status = response.status();
            let final_url = response.url().to_string();
            let body = response
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?
                .to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", method = "DELETE", url))
        .await
    }
}

async fn decode_json<T: DeserializeOwned>(
    response: reqwest::Response,
    url: &str,
) -> Result<T, FetchError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| FetchError::from_reqwest(url, err))?;
    if !status.is_success() {
        return Err(FetchError::Rejected {
            status: status.as_u16(),
            url: url.to_string(),
            body: truncate_body(&body),
        });
    }
    serde_json::from_slice(&body).map_err(|err| FetchError::Shape {
        url: url.to_string(),
        reason: err.to_string(),
    })
}

fn truncate_body(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(MAX_ERROR_BODY_CHARS)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// Integer `page` parameter starting at 1; an empty page ends the stream.
    PageNumber,
    /// Follow the `next` link of the previous page; no link ends the stream.
    CursorLink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    First,
    Number(u32),
    Link(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn new(records: Vec<T>, next: Option<String>) -> Self {
        Self { records, next }
    }

    /// A page that terminates the stream. Sources return this for malformed bodies.
    pub fn end() -> Self {
        Self {
            records: Vec::new(),
            next: None,
        }
    }
}

#[async_trait]
pub trait PageSource: Send + Sync {
    type Record: Send + 'static;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<Self::Record>, FetchError>;
}

pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Every call to [`records`](Self::records) starts again from the first page. A page
/// error or running out of page budget ends the stream with an error.
pub struct PagedInventoryFetcher<S> {
    source: S,
    pagination: Pagination,
    max_pages: usize,
    cancel: CancellationToken,
}

impl<S: PageSource> PagedInventoryFetcher<S> {
    pub fn new(source: S, pagination: Pagination) -> Self {
        Self {
            source,
            pagination,
            max_pages: DEFAULT_MAX_PAGES,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn records(&self) -> impl Stream<Item = Result<S::Record, FetchError>> + Send + '_ {
        try_stream! {
            let mut request = match self.pagination {
                Pagination::PageNumber => PageRequest::Number(1),
                Pagination::CursorLink => PageRequest::First,
            };
            let mut page_no: u32 = 1;
            let mut followed: HashSet<String> = HashSet::new();
            let mut pages = 0usize;

            loop {
                if self.cancel.is_cancelled() {
                    Err::<(), FetchError>(FetchError::Cancelled)?;
                }
                if pages >= self.max_pages {
                    warn!(pages, "page cap reached with pages remaining; inventory is incomplete");
                    Err::<(), FetchError>(FetchError::PageCapExceeded { pages })?;
                }

                let page = self.source.fetch_page(&request).await?;
                pages += 1;
                let received = page.records.len();
                debug!(page = pages, received, "fetched inventory page");

                let next = page.next;
                for record in page.records {
                    yield record;
                }

                request = match self.pagination {
                    Pagination::PageNumber => {
                        if received == 0 {
                            break;
                        }
                        page_no += 1;
                        PageRequest::Number(page_no)
                    }
                    Pagination::CursorLink => match next {
                        Some(link) if followed.insert(link.clone()) => PageRequest::Link(link),
                        Some(link) => {
                            warn!(%link, "next link repeats an earlier page; ending inventory stream");
                            break;
                        }
                        None => break,
                    },
                };
            }
        }
    }

    pub async fn collect_all(&self) -> Result<Vec<S::Record>, FetchError> {
        self.records().try_collect().await
    }
}
