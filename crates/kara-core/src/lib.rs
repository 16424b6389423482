//! Core domain model and error taxonomy for the Kara medical analytics stack.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{ApiCredentials, KaraConfig};

/// One message snapshot as written by the scraper into a data lake batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedMessage {
    pub message_id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
    pub sender_id: Option<i64>,
    pub views: i64,
    pub forwards: i64,
    pub media: Option<String>,
}

/// Staging row before insertion; the database assigns `id` and `loaded_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawRecord {
    pub json_data: serde_json::Value,
    pub file_name: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    pub json_data: serde_json::Value,
    pub file_name: String,
    pub channel_name: String,
    pub loaded_at: DateTime<Utc>,
}

/// Normalized fact row produced by the transform step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub channel_name: String,
    pub message_text: String,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopProduct {
    pub product_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelActivity {
    /// Calendar date of `posted_at`, formatted `YYYY-MM-DD`.
    pub date: String,
    pub count: i64,
}

/// Detection confidence, always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ConfidenceScore(f64);

impl ConfidenceScore {
    pub fn new(value: f64) -> Option<Self> {
        if (0.0..=1.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for ConfidenceScore {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("confidence {value} outside [0, 1]"))
    }
}

impl From<ConfidenceScore> for f64 {
    fn from(score: ConfidenceScore) -> Self {
        score.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDetection {
    pub image_path: String,
    pub detected_object_class: String,
    pub confidence_score: ConfidenceScore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDetection {
    pub id: i64,
    pub image_path: String,
    pub detected_object_class: String,
    pub confidence_score: ConfidenceScore,
    pub detected_at: DateTime<Utc>,
}

/// Failure taxonomy shared by every stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Database or messaging service unreachable.
    Connectivity,
    /// Malformed JSON input.
    Parse,
    /// One channel or message failed while scraping.
    PartialFetch,
    /// Observed input differs from what configuration expects.
    ConfigurationMismatch,
    /// Report store unreachable while answering a query.
    DataUnavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Parse => "parse",
            ErrorKind::PartialFetch => "partial_fetch",
            ErrorKind::ConfigurationMismatch => "configuration_mismatch",
            ErrorKind::DataUnavailable => "data_unavailable",
        };
        f.write_str(name)
    }
}

/// A contained unit-level error (one message, file, channel or image) that did not
/// abort its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub kind: ErrorKind,
    pub unit: String,
    pub reason: String,
}

impl UnitFailure {
    pub fn new(kind: ErrorKind, unit: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            kind,
            unit: unit.into(),
            reason: reason.to_string(),
        }
    }
}

/// Turns `t.me/<name>`, `https://t.me/<name>` and `@name` into the bare channel name.
pub fn normalize_channel_handle(handle: &str) -> String {
    let handle = handle.trim();
    if handle.contains("t.me") {
        handle
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(handle)
            .to_string()
    } else {
        handle.trim_start_matches('@').to_string()
    }
}
