use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kara_core::{ChannelActivity, Message, NewDetection, NewRawRecord, TopProduct};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::store::{escape_like, DetectionSink, MessageReader, RawRecordSink, StoreError};

const RAW_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS raw";

const RAW_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS raw.telegram_messages (
        id SERIAL PRIMARY KEY,
        json_data JSONB NOT NULL,
        file_name VARCHAR(255),
        channel_name VARCHAR(255),
        loaded_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
"#;

const RECREATE_RAW_TABLE: [&str; 3] = [
    RAW_SCHEMA,
    "DROP TABLE IF EXISTS raw.telegram_messages CASCADE",
    RAW_TABLE,
];

const ENSURE_RAW_TABLE: [&str; 2] = [RAW_SCHEMA, RAW_TABLE];

const CREATE_DETECTION_TABLE: [&str; 2] = [
    "CREATE SCHEMA IF NOT EXISTS analytics",
    r#"
    CREATE TABLE IF NOT EXISTS analytics.fct_image_detections (
        detection_id SERIAL PRIMARY KEY,
        image_path TEXT NOT NULL,
        detected_object_class TEXT NOT NULL,
        confidence_score FLOAT NOT NULL,
        detected_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
    "#,
];

/// Literal substring match: `$1` comes from `escape_like`, which escapes with `\`.
/// Messages without a timestamp are left out, as in the activity report.
const SEARCH_MESSAGES: &str = r#"
    SELECT CAST(id AS BIGINT) AS id,
           COALESCE(channel_name, '') AS channel_name,
           COALESCE(message_text, '') AS message_text,
           CAST(posted_at AS TIMESTAMPTZ) AS posted_at
      FROM fct_messages
     WHERE message_text ILIKE $1 ESCAPE '\'
       AND posted_at IS NOT NULL
     ORDER BY id
"#;

/// Postgres-backed store. Each call checks a connection out of the pool and returns it
/// when the call finishes, whether it succeeded or not.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Builds the pool without connecting; the first query opens the first connection.
    pub fn connect_lazy(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let options = database_url
            .parse::<PgConnectOptions>()
            .map_err(StoreError::from)?
            .options([("TimeZone", "UTC")]);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect_lazy_with(options);
        Ok(Self { pool })
    }

    async fn execute_all(&self, statements: &[&str]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            sqlx::query(*statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl RawRecordSink for PgStore {
    async fn create_raw_table(&self) -> Result<(), StoreError> {
        self.execute_all(&RECREATE_RAW_TABLE).await?;
        info!("raw.telegram_messages recreated");
        Ok(())
    }

    async fn ensure_raw_table(&self) -> Result<(), StoreError> {
        self.execute_all(&ENSURE_RAW_TABLE).await
    }

    async fn insert_raw_records(&self, records: &[NewRawRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO raw.telegram_messages (json_data, file_name, channel_name)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&record.json_data)
            .bind(&record.file_name)
            .bind(&record.channel_name)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        debug!(inserted, "raw records committed");
        Ok(inserted)
    }
}

#[async_trait]
impl DetectionSink for PgStore {
    async fn ensure_detection_table(&self) -> Result<(), StoreError> {
        self.execute_all(&CREATE_DETECTION_TABLE).await
    }

    async fn insert_detections(&self, detections: &[NewDetection]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for detection in detections {
            let result = sqlx::query(
                r#"
                INSERT INTO analytics.fct_image_detections
                    (image_path, detected_object_class, confidence_score)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&detection.image_path)
            .bind(&detection.detected_object_class)
            .bind(detection.confidence_score.value())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        debug!(inserted, "detections committed");
        Ok(inserted)
    }
}

#[async_trait]
impl MessageReader for PgStore {
    async fn top_products(&self, limit: u32) -> Result<Vec<TopProduct>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(message_text, '') AS product_name,
                   COUNT(*) AS count
              FROM fct_messages
             GROUP BY COALESCE(message_text, '')
             ORDER BY count DESC, product_name ASC
             LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<TopProduct, StoreError> {
                Ok(TopProduct {
                    product_name: row.try_get("product_name")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn channel_activity(&self, channel_name: &str) -> Result<Vec<ChannelActivity>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT CAST(DATE(posted_at) AS TEXT) AS date,
                   COUNT(*) AS count
              FROM fct_messages
             WHERE channel_name = $1
               AND posted_at IS NOT NULL
             GROUP BY DATE(posted_at)
             ORDER BY DATE(posted_at)
            "#,
        )
        .bind(channel_name)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<ChannelActivity, StoreError> {
                Ok(ChannelActivity {
                    date: row.try_get("date")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn search_messages(&self, query: &str) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(SEARCH_MESSAGES)
        .bind(escape_like(query))
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<Message, StoreError> {
                let posted_at: DateTime<Utc> = row.try_get("posted_at")?;
                Ok(Message {
                    id: row.try_get("id")?,
                    channel_name: row.try_get("channel_name")?,
                    message_text: row.try_get("message_text")?,
                    posted_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_escape_character_matches_escape_like() {
        assert!(SEARCH_MESSAGES.contains(r"ILIKE $1 ESCAPE '\'"));
        assert!(SEARCH_MESSAGES.contains("posted_at IS NOT NULL"));
        assert_eq!(escape_like("50%"), r"%50\%%");
    }

    #[test]
    fn only_init_drops_the_raw_table() {
        assert!(RECREATE_RAW_TABLE.iter().any(|sql| sql.starts_with("DROP TABLE")));
        assert!(ENSURE_RAW_TABLE.iter().all(|sql| !sql.contains("DROP")));
        assert!(ENSURE_RAW_TABLE.iter().all(|sql| sql.contains("IF NOT EXISTS")));
    }

    /// Runs the report SQL against a temporary `fct_messages` on a single pooled connection.
    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a Postgres server"]
    async fn report_queries_against_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PgStore::connect_lazy(&url, 1, Duration::from_secs(5)).expect("pool options");
        {
            let mut conn = store.pool.acquire().await.expect("connection");
            sqlx::query(
                "CREATE TEMP TABLE fct_messages \
                 (id INTEGER, channel_name TEXT, message_text TEXT, posted_at TIMESTAMP)",
            )
            .execute(&mut *conn)
            .await
            .expect("create temp table");
            sqlx::query(
                r#"
                INSERT INTO fct_messages VALUES
                    (1, 'Chemed123', 'Paracetamol 50% off', '2025-01-10 08:00'),
                    (2, 'Chemed123', 'Paracetamol 500mg', '2025-01-10 17:00'),
                    (3, 'Chemed123', 'Paracetamol 500mg', NULL),
                    (4, 'tikvahpharma', NULL, '2025-01-11 09:00')
                "#,
            )
            .execute(&mut *conn)
            .await
            .expect("seed rows");
        }

        let top = store.top_products(10).await.expect("top products");
        let top = top
            .iter()
            .map(|t| (t.product_name.as_str(), t.count))
            .collect::<Vec<_>>();
        assert_eq!(
            top,
            vec![("Paracetamol 500mg", 2), ("", 1), ("Paracetamol 50% off", 1)]
        );

        let activity = store.channel_activity("Chemed123").await.expect("activity");
        assert_eq!(
            activity,
            vec![ChannelActivity {
                date: "2025-01-10".into(),
                count: 2
            }]
        );

        let literal = store.search_messages("50%").await.expect("search literal");
        assert_eq!(literal.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1]);

        let found = store.search_messages("PARACETAMOL").await.expect("search");
        assert_eq!(found.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
