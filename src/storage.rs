//! SQLite archive of finished sessions.
//!
//! Each finalized [`SessionSummary`] is stored as one row. The columns used
//! for listing (`patient_id`, `finished_at`, `outcome`, `distance_m`) are
//! kept alongside the full summary serialized as JSON in `body`.
//!
//! The engine never touches this module; the HTTP layer archives a summary
//! when asked to.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{debug, instrument};

use crate::model::TestOutcome;
use crate::session::SessionSummary;

/// Default number of rows returned by [`Storage::list_recent`].
pub const DEFAULT_LIST_LIMIT: u32 = 20;

/// Listing entry for an archived session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: i64,
    pub patient_id: String,
    pub finished_at: DateTime<Utc>,
    pub outcome: TestOutcome,
    pub distance_m: f32,
}

/// An archived session with its full summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSummary {
    pub id: i64,
    pub summary: SessionSummary,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:walktest.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_id TEXT NOT NULL,
                finished_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                distance_m REAL NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Listing is newest-first, optionally per patient
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_session_summaries_patient_finished
            ON session_summaries(patient_id, finished_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Archive a summary. Returns the new row id.
    #[instrument(skip(self, summary), fields(patient_id = %summary.preparation.patient_id))]
    pub async fn insert_summary(&self, summary: &SessionSummary) -> anyhow::Result<i64> {
        let body = serde_json::to_string(summary)?;

        let result = sqlx::query(
            r#"
            INSERT INTO session_summaries (patient_id, finished_at, outcome, distance_m, body)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.preparation.patient_id)
        .bind(summary.finished_at.timestamp_millis())
        .bind(summary.outcome.as_str())
        .bind(summary.distance_m as f64)
        .bind(body)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, "Session summary archived");
        Ok(id)
    }

    /// Fetch one archived summary.
    pub async fn get_summary(&self, id: i64) -> anyhow::Result<Option<StoredSummary>> {
        let row = sqlx::query(
            r#"
            SELECT id, body FROM session_summaries WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.get("body");
        Ok(Some(StoredSummary {
            id: row.get("id"),
            summary: serde_json::from_str(&body)?,
        }))
    }

    /// List archived sessions, newest first.
    ///
    /// # Arguments
    ///
    /// * `patient_id` - Only list sessions of this patient
    /// * `limit` - Maximum number of rows
    pub async fn list_recent(
        &self,
        patient_id: Option<&str>,
        limit: u32,
    ) -> anyhow::Result<Vec<SummaryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, patient_id, finished_at, outcome, distance_m
            FROM session_summaries
            WHERE ? IS NULL OR patient_id = ?
            ORDER BY finished_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(patient_id)
        .bind(patient_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> anyhow::Result<SummaryRecord> {
    let finished_ms: i64 = row.get("finished_at");
    let finished_at = Utc
        .timestamp_millis_opt(finished_ms)
        .single()
        .ok_or_else(|| anyhow::anyhow!("invalid finished_at timestamp {finished_ms}"))?;
    let outcome: String = row.get("outcome");
    let distance_m: f64 = row.get("distance_m");

    Ok(SummaryRecord {
        id: row.get("id"),
        patient_id: row.get("patient_id"),
        finished_at,
        outcome: outcome.parse().map_err(anyhow::Error::msg)?,
        distance_m: distance_m as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MinuteSnapshot, PreparationData, RecoveryData, StopRecord};
    use crate::recorder::VitalExtrema;

    fn summary(patient_id: &str, finished_at: DateTime<Utc>, distance_m: f32) -> SessionSummary {
        SessionSummary {
            preparation: PreparationData {
                patient_id: patient_id.to_string(),
                stride_length_m: 0.65,
                basal_spo2: Some(97),
                basal_heart_rate: Some(72),
                notes: Some("post-op week 3".to_string()),
            },
            outcome: TestOutcome::Completed,
            started_at: finished_at - chrono::Duration::minutes(6),
            finished_at,
            elapsed_ms: 360_000,
            distance_m,
            spo2_points: Vec::new(),
            heart_rate_points: Vec::new(),
            extrema: VitalExtrema::default(),
            snapshots: vec![MinuteSnapshot {
                minute_mark: 1,
                min_spo2_overall: Some(95),
                max_hr_overall: Some(110),
                distance_at_minute_end: Some(70.0),
            }],
            stops: vec![StopRecord {
                stop_time_millis: 200_000,
                spo2: 91,
                heart_rate: 122,
                distance_at_stop_time: 250.0,
            }],
            recovery: Some(RecoveryData {
                spo2: Some(96),
                heart_rate: Some(88),
                period_over: true,
                captured_during_period: true,
            }),
            distance_resets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let original = summary("p-001", Utc::now(), 412.5);

        let id = storage.insert_summary(&original).await.unwrap();
        let stored = storage.get_summary(id).await.unwrap().unwrap();

        assert_eq!(stored.id, id);
        assert_eq!(stored.summary, original);
    }

    #[tokio::test]
    async fn test_get_missing_summary() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        assert!(storage.get_summary(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_recent_newest_first() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        for i in 0..3 {
            let s = summary("p-001", now - chrono::Duration::days(i), 100.0 * i as f32);
            storage.insert_summary(&s).await.unwrap();
        }

        let records = storage.list_recent(None, 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].finished_at > records[1].finished_at);
        assert_eq!(records[0].distance_m, 0.0);
        assert_eq!(records[0].outcome, TestOutcome::Completed);
    }

    #[tokio::test]
    async fn test_list_recent_by_patient() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        storage.insert_summary(&summary("p-001", now, 300.0)).await.unwrap();
        storage.insert_summary(&summary("p-002", now, 350.0)).await.unwrap();
        storage.insert_summary(&summary("p-002", now, 360.0)).await.unwrap();

        let records = storage
            .list_recent(Some("p-002"), DEFAULT_LIST_LIMIT)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.patient_id == "p-002"));
    }
}
