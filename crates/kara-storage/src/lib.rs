//! Data lake file store, HTTP transport and relational store for the Kara pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use kara_core::ScrapedMessage;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;
mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{escape_like, DetectionSink, MessageReader, RawRecordSink, StoreError};

pub const BATCH_FILE_NAME: &str = "messages.json";

#[derive(Debug, Clone)]
pub struct StoredBatch {
    pub path: PathBuf,
    pub channel_name: String,
    pub message_count: usize,
    pub byte_size: usize,
    pub content_hash: String,
}

/// Hierarchical `<root>/<YYYY-MM-DD>/<channel>/` store for scraped batches and photos.
#[derive(Debug, Clone)]
pub struct DataLake {
    root: PathBuf,
}

impl DataLake {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn batch_dir(&self, date: NaiveDate, channel: &str) -> PathBuf {
        self.root
            .join(date.format("%Y-%m-%d").to_string())
            .join(channel)
    }

    pub fn batch_path(&self, date: NaiveDate, channel: &str) -> PathBuf {
        self.batch_dir(date, channel).join(BATCH_FILE_NAME)
    }

    pub fn photo_path(&self, date: NaiveDate, channel: &str, message_id: i64) -> PathBuf {
        self.batch_dir(date, channel)
            .join(format!("photo_{message_id}.jpg"))
    }

    /// Writes the channel's batch as pretty JSON, replacing any earlier batch of the same day.
    pub async fn write_batch(
        &self,
        date: NaiveDate,
        channel: &str,
        messages: &[ScrapedMessage],
    ) -> anyhow::Result<StoredBatch> {
        let bytes = serde_json::to_vec_pretty(messages)
            .with_context(|| format!("serializing batch for {channel}"))?;
        let path = self.batch_path(date, channel);
        write_atomic(&path, &bytes).await?;
        Ok(StoredBatch {
            path,
            channel_name: channel.to_string(),
            message_count: messages.len(),
            byte_size: bytes.len(),
            content_hash: Self::sha256_hex(&bytes),
        })
    }

    pub async fn write_photo(
        &self,
        date: NaiveDate,
        channel: &str,
        message_id: i64,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let path = self.photo_path(date, channel, message_id);
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    /// Every `messages.json` below the root, sorted by path.
    pub async fn list_batches(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking {}", self.root.display()))?
        {
            return Ok(found);
        }
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("reading {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if entry.file_name() == BATCH_FILE_NAME {
                    found.push(entry.path());
                }
            }
        }
        found.sort();
        Ok(found)
    }

    pub async fn read_batch(&self, path: &Path) -> anyhow::Result<Vec<ScrapedMessage>> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Temp-file write followed by a rename so readers never observe a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Sent with every request, e.g. service credentials.
    pub default_headers: Vec<(String, String)>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            default_headers: Vec::new(),
            global_concurrency: 8,
            per_scope_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http fetcher is shut down")]
    Closed,
}

impl FetchError {
    /// True when the remote end could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_connect() || err.is_timeout(),
            FetchError::HttpStatus { status, .. } => *status == 502 || *status == 503,
            FetchError::Decode { .. } => false,
            FetchError::Closed => true,
        }
    }
}

/// Rate-limited `reqwest` client with exponential backoff for transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let mut value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    pub async fn get_bytes(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send(scope, url, || self.client.get(url)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, scope: &str, url: &str) -> Result<T, FetchError> {
        let resp = self.get_bytes(scope, url).await?;
        decode_json(&resp)
    }

    pub async fn delete(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send(scope, url, || self.client.delete(url)).await
    }

    /// POSTs `body` with the given content type and decodes a JSON reply.
    pub async fn post_bytes_for_json<T: DeserializeOwned>(
        &self,
        scope: &str,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<T, FetchError> {
        let resp = self
            .send(scope, url, || {
                self.client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(body.clone())
            })
            .await?;
        decode_json(&resp)
    }

    async fn send<F>(&self, scope: &str, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_scope = self.per_scope_semaphore(scope).await;
        let _scope = per_scope.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", scope, url);
        async {
            let mut attempt = 0usize;
            loop {
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = match resp.bytes().await {
                                Ok(bytes) => bytes.to_vec(),
                                Err(err) => return Err(FetchError::Request(err)),
                            };
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(%status, attempt, "retrying after http status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retrying after request error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn decode_json<T: DeserializeOwned>(resp: &FetchedResponse) -> Result<T, FetchError> {
    serde_json::from_slice(&resp.body).map_err(|source| FetchError::Decode {
        url: resp.final_url.clone(),
        source,
    })
}
