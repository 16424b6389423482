use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use kara_core::{
    ChannelActivity, ImageDetection, Message, NewDetection, NewRawRecord, RawRecord, TopProduct,
};
use tokio::sync::Mutex;

use crate::store::{DetectionSink, MessageReader, RawRecordSink, StoreError};

/// In-process store with the same semantics as `PgStore`, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    raw: Mutex<Vec<RawRecord>>,
    detections: Mutex<Vec<ImageDetection>>,
    detection_table: AtomicBool,
    messages: Mutex<Vec<Message>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
            ..Self::default()
        }
    }

    /// Makes every subsequent call fail as if the database were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub async fn raw_records(&self) -> Vec<RawRecord> {
        self.raw.lock().await.clone()
    }

    pub async fn detections(&self) -> Vec<ImageDetection> {
        self.detections.lock().await.clone()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RawRecordSink for MemoryStore {
    async fn create_raw_table(&self) -> Result<(), StoreError> {
        self.check_online()?;
        self.raw.lock().await.clear();
        Ok(())
    }

    async fn ensure_raw_table(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn insert_raw_records(&self, records: &[NewRawRecord]) -> Result<u64, StoreError> {
        self.check_online()?;
        let mut raw = self.raw.lock().await;
        let loaded_at = Utc::now();
        for record in records {
            let id = raw.len() as i64 + 1;
            raw.push(RawRecord {
                id,
                json_data: record.json_data.clone(),
                file_name: record.file_name.clone(),
                channel_name: record.channel_name.clone(),
                loaded_at,
            });
        }
        Ok(records.len() as u64)
    }
}

#[async_trait]
impl DetectionSink for MemoryStore {
    async fn ensure_detection_table(&self) -> Result<(), StoreError> {
        self.check_online()?;
        self.detection_table.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_detections(&self, detections: &[NewDetection]) -> Result<u64, StoreError> {
        self.check_online()?;
        if !self.detection_table.load(Ordering::SeqCst) {
            return Err(StoreError::InvalidRow {
                table: "analytics.fct_image_detections",
                reason: "table does not exist".to_string(),
            });
        }
        let mut rows = self.detections.lock().await;
        let detected_at = Utc::now();
        for detection in detections {
            let id = rows.len() as i64 + 1;
            rows.push(ImageDetection {
                id,
                image_path: detection.image_path.clone(),
                detected_object_class: detection.detected_object_class.clone(),
                confidence_score: detection.confidence_score,
                detected_at,
            });
        }
        Ok(detections.len() as u64)
    }
}

#[async_trait]
impl MessageReader for MemoryStore {
    async fn top_products(&self, limit: u32) -> Result<Vec<TopProduct>, StoreError> {
        self.check_online()?;
        let messages = self.messages.lock().await;
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for message in messages.iter() {
            *counts.entry(message.message_text.as_str()).or_default() += 1;
        }
        let mut ranked = counts
            .into_iter()
            .map(|(text, count)| TopProduct {
                product_name: text.to_string(),
                count,
            })
            .collect::<Vec<_>>();
        // BTreeMap already yields names ascending; a stable sort keeps that as the tie-break.
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        ranked.truncate(limit as usize);
        Ok(ranked)
    }

    async fn channel_activity(&self, channel_name: &str) -> Result<Vec<ChannelActivity>, StoreError> {
        self.check_online()?;
        let messages = self.messages.lock().await;
        let mut per_day: BTreeMap<String, i64> = BTreeMap::new();
        for message in messages.iter().filter(|m| m.channel_name == channel_name) {
            let day = message.posted_at.date_naive().format("%Y-%m-%d").to_string();
            *per_day.entry(day).or_default() += 1;
        }
        Ok(per_day
            .into_iter()
            .map(|(date, count)| ChannelActivity { date, count })
            .collect())
    }

    async fn search_messages(&self, query: &str) -> Result<Vec<Message>, StoreError> {
        self.check_online()?;
        let needle = query.to_lowercase();
        let messages = self.messages.lock().await;
        let mut found = messages
            .iter()
            .filter(|m| m.message_text.to_lowercase().contains(&needle))
            .cloned()
            .collect::<Vec<_>>();
        found.sort_by_key(|m| m.id);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use kara_core::ConfidenceScore;

    fn msg(id: i64, channel: &str, text: &str, posted_at: DateTime<Utc>) -> Message {
        Message {
            id,
            channel_name: channel.to_string(),
            message_text: text.to_string(),
            posted_at,
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).single().expect("valid timestamp")
    }

    fn sample() -> MemoryStore {
        MemoryStore::with_messages(vec![
            msg(1, "Chemed123", "Paracetamol 500mg", at(10, 8)),
            msg(2, "Chemed123", "Paracetamol 500mg", at(10, 17)),
            msg(3, "Chemed123", "Amoxicillin", at(11, 9)),
            msg(4, "lobelia4cosmetics", "Sunscreen SPF50", at(11, 9)),
            msg(5, "lobelia4cosmetics", "Paracetamol 500mg", at(12, 9)),
            msg(6, "tikvahpharma", "Amoxicillin", at(12, 23)),
        ])
    }

    #[tokio::test]
    async fn top_products_respects_limit_and_exact_counts() {
        let store = sample();
        let top = store.top_products(2).await.expect("top products");
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].product_name, "Paracetamol 500mg");
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].product_name, "Amoxicillin");
        assert_eq!(top[1].count, 2);

        let all = store.top_products(10).await.expect("top products");
        assert_eq!(all.iter().map(|t| t.count).sum::<i64>(), 6);
        assert!(store.top_products(0).await.expect("top products").is_empty());
    }

    #[tokio::test]
    async fn channel_activity_partitions_by_calendar_date() {
        let store = sample();
        let activity = store.channel_activity("Chemed123").await.expect("channel activity");
        assert_eq!(
            activity,
            vec![
                ChannelActivity { date: "2025-01-10".into(), count: 2 },
                ChannelActivity { date: "2025-01-11".into(), count: 1 },
            ]
        );
        assert!(store.channel_activity("unknown").await.expect("channel activity").is_empty());
    }

    #[tokio::test]
    async fn search_is_case_insensitive_substring() {
        let store = sample();
        let found = store.search_messages("paracetamol").await.expect("search messages");
        assert_eq!(found.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2, 5]);
        assert!(store.search_messages("ibuprofen").await.expect("search messages").is_empty());
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = sample();
        store.set_offline(true);
        let err = store.top_products(10).await.expect_err("offline store");
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn detections_require_table_and_append() {
        let store = MemoryStore::new();
        let detection = NewDetection {
            image_path: "/lake/photo_1.jpg".into(),
            detected_object_class: "bottle".into(),
            confidence_score: ConfidenceScore::new(0.9).expect("confidence in range"),
        };
        assert!(store.insert_detections(&[detection.clone()]).await.is_err());

        store.ensure_detection_table().await.expect("ensure detection table");
        store.ensure_detection_table().await.expect("ensure detection table");
        store.insert_detections(&[detection.clone()]).await.expect("insert detections");
        store.insert_detections(&[detection]).await.expect("insert detections");
        assert_eq!(store.detections().await.len(), 2);
    }

    #[tokio::test]
    async fn ensuring_raw_table_keeps_rows_but_recreating_clears_them() {
        let store = MemoryStore::new();
        store
            .insert_raw_records(&[NewRawRecord {
                json_data: serde_json::json!({"message_id": 1}),
                file_name: "a.json".into(),
                channel_name: "a".into(),
            }])
            .await
            .expect("insert raw record");
        assert_eq!(store.raw_records().await.len(), 1);
        store.ensure_raw_table().await.expect("ensure raw table");
        assert_eq!(store.raw_records().await.len(), 1);
        store.create_raw_table().await.expect("create raw table");
        assert!(store.raw_records().await.is_empty());
    }
}
