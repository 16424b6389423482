use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kara_core::ApiCredentials;
use kara_storage::{FetchError, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{ChannelRef, MediaKind, MessageSource, ScrapeError, SourceMessage};

const SCOPE: &str = "telegram-gateway";

/// HTTP client for a Telegram bridge that holds the MTProto session.
///
/// Endpoints, relative to the base URL:
/// `POST v1/session`, `DELETE v1/session`, `GET v1/channels/{name}`,
/// `GET v1/channels/{name}/messages?limit=N` and
/// `GET v1/channels/{name}/messages/{id}/photo`.
#[derive(Debug)]
pub struct TelegramGateway {
    base: Url,
    fetcher: HttpFetcher,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    date: DateTime<Utc>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sender_id: Option<i64>,
    #[serde(default)]
    views: Option<i64>,
    #[serde(default)]
    forwards: Option<i64>,
    #[serde(default)]
    media: Option<String>,
}

impl From<WireMessage> for SourceMessage {
    fn from(wire: WireMessage) -> Self {
        let media = match wire.media.as_deref() {
            None | Some("") => MediaKind::None,
            Some(kind) if kind.eq_ignore_ascii_case("photo") => MediaKind::Photo,
            Some(_) => MediaKind::Other,
        };
        SourceMessage {
            id: wire.id,
            date: wire.date,
            text: wire.text,
            sender_id: wire.sender_id,
            views: wire.views,
            forwards: wire.forwards,
            media,
        }
    }
}

impl TelegramGateway {
    pub fn new(base_url: &str, credentials: &ApiCredentials, timeout: Duration) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(format!("kara-scraper/{}", env!("CARGO_PKG_VERSION"))),
            default_headers: vec![
                ("X-Telegram-Api-Id".to_string(), credentials.api_id.clone()),
                ("X-Telegram-Api-Hash".to_string(), credentials.api_hash.clone()),
            ],
            ..HttpClientConfig::default()
        })?;
        Ok(Self { base, fetcher })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ScrapeError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ScrapeError::Connectivity(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_session(&self, url: &Url) -> Result<(), ScrapeError> {
        self.fetcher
            .post_bytes_for_json::<Value>(SCOPE, url.as_str(), "application/json", b"{}".to_vec())
            .await
            .map(|_| ())
            .map_err(connectivity)
    }
}

fn connectivity(err: FetchError) -> ScrapeError {
    ScrapeError::Connectivity(err.to_string())
}

fn fetch_error(unit: &str, err: FetchError) -> ScrapeError {
    if err.is_connectivity() {
        ScrapeError::Connectivity(err.to_string())
    } else {
        ScrapeError::Fetch {
            unit: unit.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl MessageSource for TelegramGateway {
    async fn connect(&self) -> Result<(), ScrapeError> {
        let url = self.endpoint(&["v1", "session"])?;
        self.post_session(&url).await
    }

    async fn resolve_channel(&self, handle: &str) -> Result<ChannelRef, ScrapeError> {
        let name = kara_core::normalize_channel_handle(handle);
        let url = self.endpoint(&["v1", "channels", &name])?;
        let info: ChannelInfo = self
            .fetcher
            .get_json(SCOPE, url.as_str())
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status: 404, .. } => ScrapeError::UnknownChannel {
                    channel: name.clone(),
                    reason: "not found".to_string(),
                },
                other => fetch_error(&name, other),
            })?;
        Ok(ChannelRef {
            handle: handle.to_string(),
            name: info.username.filter(|u| !u.is_empty()).unwrap_or(name),
        })
    }

    async fn recent_messages(
        &self,
        channel: &ChannelRef,
        limit: usize,
    ) -> Result<Vec<Result<SourceMessage, ScrapeError>>, ScrapeError> {
        let mut url = self.endpoint(&["v1", "channels", &channel.name, "messages"])?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        let page: MessagePage = self
            .fetcher
            .get_json(SCOPE, url.as_str())
            .await
            .map_err(|err| fetch_error(&channel.name, err))?;
        debug!(channel = %channel.name, count = page.messages.len(), "message page received");

        Ok(page
            .messages
            .into_iter()
            .map(|value| {
                serde_json::from_value::<WireMessage>(value)
                    .map(SourceMessage::from)
                    .map_err(|err| ScrapeError::Decode(format!("{}: {err}", channel.name)))
            })
            .collect())
    }

    async fn download_photo(&self, channel: &ChannelRef, message_id: i64) -> Result<Vec<u8>, ScrapeError> {
        let id = message_id.to_string();
        let url = self.endpoint(&["v1", "channels", &channel.name, "messages", &id, "photo"])?;
        let unit = format!("{}#{message_id}", channel.name);
        let resp = self
            .fetcher
            .get_bytes(SCOPE, url.as_str())
            .await
            .map_err(|err| fetch_error(&unit, err))?;
        Ok(resp.body)
    }

    async fn disconnect(&self) -> Result<(), ScrapeError> {
        let url = self.endpoint(&["v1", "session"])?;
        self.fetcher
            .delete(SCOPE, url.as_str())
            .await
            .map(|_| ())
            .map_err(connectivity)
    }
}
