//! Messaging-service contract and the per-channel scraper that fills the data lake.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kara_core::{normalize_channel_handle, ErrorKind, ScrapedMessage, UnitFailure};
use kara_storage::DataLake;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

mod gateway;

pub use gateway::TelegramGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    None,
    Photo,
    Other,
}

/// A message as reported by the messaging service, before defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub sender_id: Option<i64>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub media: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    /// Handle as configured, e.g. `t.me/lobelia4cosmetics`.
    pub handle: String,
    /// Normalized name used for data lake partitioning.
    pub name: String,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("messaging service unreachable: {0}")]
    Connectivity(String),
    #[error("channel {channel} could not be resolved: {reason}")]
    UnknownChannel { channel: String, reason: String },
    #[error("fetch failed for {unit}: {reason}")]
    Fetch { unit: String, reason: String },
    #[error("malformed message payload: {0}")]
    Decode(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::Connectivity(_) => ErrorKind::Connectivity,
            ScrapeError::Decode(_) => ErrorKind::Parse,
            ScrapeError::UnknownChannel { .. } | ScrapeError::Fetch { .. } | ScrapeError::Storage(_) => {
                ErrorKind::PartialFetch
            }
        }
    }
}

/// Client session against the messaging service.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn connect(&self) -> Result<(), ScrapeError>;

    async fn resolve_channel(&self, handle: &str) -> Result<ChannelRef, ScrapeError>;

    /// Newest first, at most `limit`. Messages that cannot be decoded come back as
    /// individual errors so the rest of the channel is still usable.
    async fn recent_messages(
        &self,
        channel: &ChannelRef,
        limit: usize,
    ) -> Result<Vec<Result<SourceMessage, ScrapeError>>, ScrapeError>;

    async fn download_photo(&self, channel: &ChannelRef, message_id: i64) -> Result<Vec<u8>, ScrapeError>;

    async fn disconnect(&self) -> Result<(), ScrapeError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeSummary {
    pub written: Vec<PathBuf>,
    pub channels: usize,
    pub messages: usize,
    pub photos: usize,
    pub failures: Vec<UnitFailure>,
}

pub struct ChannelScraper {
    source: Arc<dyn MessageSource>,
    lake: DataLake,
}

impl ChannelScraper {
    pub fn new(source: Arc<dyn MessageSource>, lake: DataLake) -> Self {
        Self { source, lake }
    }

    pub fn lake(&self) -> &DataLake {
        &self.lake
    }

    /// Scrapes every channel into `<root>/<date>/<channel>/messages.json`.
    ///
    /// Only a failure to connect is returned as an error. Channel, message and photo
    /// failures, including timeouts and 5xx answers for a single channel, are logged,
    /// recorded as `PartialFetch` in the summary, and the next channel is tried.
    pub async fn scrape(
        &self,
        channels: &[String],
        limit: usize,
        date: NaiveDate,
    ) -> Result<ScrapeSummary, ScrapeError> {
        self.source.connect().await?;
        info!("messaging client connected");

        let mut summary = ScrapeSummary {
            channels: channels.len(),
            ..ScrapeSummary::default()
        };

        for handle in channels {
            let channel_name = normalize_channel_handle(handle);
            info!(channel = %channel_name, "processing channel");
            match self.scrape_channel(handle, limit, date, &mut summary).await {
                Ok(Some(path)) => summary.written.push(path),
                Ok(None) => warn!(channel = %channel_name, "no messages scraped"),
                Err(err) => {
                    error!(channel = %channel_name, error = %err, "channel failed");
                    summary
                        .failures
                        .push(UnitFailure::new(ErrorKind::PartialFetch, channel_name, &err));
                }
            }
        }

        if let Err(err) = self.source.disconnect().await {
            warn!(error = %err, "messaging client did not disconnect cleanly");
        } else {
            info!("messaging client disconnected");
        }
        Ok(summary)
    }

    async fn scrape_channel(
        &self,
        handle: &str,
        limit: usize,
        date: NaiveDate,
        summary: &mut ScrapeSummary,
    ) -> Result<Option<PathBuf>, ScrapeError> {
        let channel = self.source.resolve_channel(handle).await?;
        let items = self.source.recent_messages(&channel, limit).await?;

        let mut batch = Vec::with_capacity(items.len());
        for item in items.into_iter().take(limit) {
            let message = match item {
                Ok(message) => message,
                Err(err) => {
                    error!(channel = %channel.name, error = %err, "skipping message");
                    summary
                        .failures
                        .push(UnitFailure::new(err.kind(), channel.name.clone(), &err));
                    continue;
                }
            };

            let mut media = None;
            if message.media == MediaKind::Photo {
                match self.fetch_photo(&channel, message.id, date).await {
                    Ok(path) => {
                        info!(message_id = message.id, path = %path.display(), "downloaded photo");
                        media = Some(path.display().to_string());
                        summary.photos += 1;
                    }
                    Err(err) => {
                        error!(message_id = message.id, error = %err, "photo download failed");
                        summary.failures.push(UnitFailure::new(
                            ErrorKind::PartialFetch,
                            format!("{}#{}", channel.name, message.id),
                            &err,
                        ));
                    }
                }
            }

            batch.push(ScrapedMessage {
                message_id: message.id,
                date: message.date,
                text: message.text.unwrap_or_default(),
                sender_id: message.sender_id,
                views: message.views.unwrap_or(0),
                forwards: message.forwards.unwrap_or(0),
                media,
            });
        }

        if batch.is_empty() {
            return Ok(None);
        }

        let stored = self.lake.write_batch(date, &channel.name, &batch).await?;
        summary.messages += stored.message_count;
        info!(
            channel = %channel.name,
            messages = stored.message_count,
            path = %stored.path.display(),
            sha256 = %stored.content_hash,
            "saved batch"
        );
        Ok(Some(stored.path))
    }

    async fn fetch_photo(
        &self,
        channel: &ChannelRef,
        message_id: i64,
        date: NaiveDate,
    ) -> Result<PathBuf, ScrapeError> {
        let bytes = self.source.download_photo(channel, message_id).await?;
        Ok(self
            .lake
            .write_photo(date, &channel.name, message_id, &bytes)
            .await?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewLine {
    pub message_id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPreview {
    pub path: PathBuf,
    pub total: usize,
    pub sample: Vec<PreviewLine>,
    pub error: Option<String>,
}

const PREVIEW_TEXT_CHARS: usize = 100;

/// First `per_file` messages of every stored batch; unreadable files are reported, not fatal.
pub async fn preview_batches(lake: &DataLake, per_file: usize) -> anyhow::Result<Vec<BatchPreview>> {
    let mut previews = Vec::new();
    for path in lake.list_batches().await? {
        match lake.read_batch(&path).await {
            Ok(messages) => previews.push(BatchPreview {
                total: messages.len(),
                sample: messages
                    .iter()
                    .take(per_file)
                    .map(|m| PreviewLine {
                        message_id: m.message_id,
                        date: m.date,
                        text: m.text.chars().take(PREVIEW_TEXT_CHARS).collect(),
                    })
                    .collect(),
                path,
                error: None,
            }),
            Err(err) => previews.push(BatchPreview {
                path,
                total: 0,
                sample: Vec::new(),
                error: Some(format!("{err:#}")),
            }),
        }
    }
    Ok(previews)
}
