use async_trait::async_trait;
use kara_core::{ChannelActivity, Message, NewDetection, NewRawRecord, TopProduct};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err),
            _ => StoreError::Query(err),
        }
    }
}

/// Destination of the raw loader: the `raw.telegram_messages` staging table.
#[async_trait]
pub trait RawRecordSink: Send + Sync {
    /// Drops and recreates the staging table. One-time setup, never part of a load.
    async fn create_raw_table(&self) -> Result<(), StoreError>;

    /// Creates schema and table when missing and leaves existing rows alone.
    async fn ensure_raw_table(&self) -> Result<(), StoreError>;

    /// Inserts every record in one transaction and returns the row count.
    async fn insert_raw_records(&self, records: &[NewRawRecord]) -> Result<u64, StoreError>;
}

/// Destination of image enrichment: `analytics.fct_image_detections`.
#[async_trait]
pub trait DetectionSink: Send + Sync {
    /// Creates schema and table when missing; safe to call repeatedly.
    async fn ensure_detection_table(&self) -> Result<(), StoreError>;

    /// Appends every detection in one transaction. Never deduplicates.
    async fn insert_detections(&self, detections: &[NewDetection]) -> Result<u64, StoreError>;
}

/// Read-only report queries over `fct_messages`.
#[async_trait]
pub trait MessageReader: Send + Sync {
    async fn top_products(&self, limit: u32) -> Result<Vec<TopProduct>, StoreError>;

    async fn channel_activity(&self, channel_name: &str) -> Result<Vec<ChannelActivity>, StoreError>;

    async fn search_messages(&self, query: &str) -> Result<Vec<Message>, StoreError>;
}

/// Escapes `LIKE` metacharacters so `query` matches as a literal substring.
pub fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 2);
    out.push('%');
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}
