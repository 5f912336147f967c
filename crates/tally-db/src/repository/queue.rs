//! # Record Queue Repository
//!
//! The durable queues behind the delivery loop.
//!
//! ## Drain / Confirm Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Queue Lifecycle                                      │
//! │                                                                         │
//! │  add_record(events, "abc", data, automatic)                            │
//! │       │   INSERT ... → returns rows queued for "abc"                   │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ events                                                          │   │
//! │  │ id │ token │ data            │ automatic_data │ created_at       │   │
//! │  │ 1  │ abc   │ {"event":...}   │ 0              │ 1700000000000    │   │
//! │  │ 2  │ abc   │ {"event":...}   │ 1              │ 1700000000100    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       │  drain_batch(limit) → PersistedBatch { watermark: 2, "[..]" }  │
//! │       ▼                                                                 │
//! │  HTTP POST (tally-sync)                                                │
//! │       │                                                                 │
//! │       ├── confirmed ──► delete_up_to(2) ──► rows 1..=2 gone            │
//! │       └── failed    ──► nothing deleted, retried later                 │
//! │                                                                         │
//! │  Rows added after the drain have larger ids and survive the delete.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::DbResult;
use tally_core::{PersistedBatch, Table};

/// Repository for the `events` and `people` queues.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    /// Creates a new QueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        QueueRepository { pool }
    }

    /// Appends a serialized record and returns the number of rows now
    /// queued in `table` for `token`.
    pub async fn add_record(
        &self,
        table: Table,
        token: &str,
        data: &str,
        automatic: bool,
    ) -> DbResult<u64> {
        let now = Utc::now().timestamp_millis();

        let insert = format!(
            "INSERT INTO {} (token, data, automatic_data, created_at) VALUES (?1, ?2, ?3, ?4)",
            table.as_str()
        );
        sqlx::query(&insert)
            .bind(token)
            .bind(data)
            .bind(automatic)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let depth = self.count(table, token).await?;

        debug!(table = %table, token = %token, depth, "Record queued");

        Ok(depth)
    }

    /// Number of rows queued in `table` for `token`.
    pub async fn count(&self, table: Table, token: &str) -> DbResult<u64> {
        let query = format!("SELECT COUNT(*) FROM {} WHERE token = ?1", table.as_str());
        let count: i64 = sqlx::query_scalar(&query)
            .bind(token)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    /// Returns the oldest `limit` records for `token`, in insertion order.
    ///
    /// Automatic records are left out unless `include_automatic` is set.
    /// Rows whose data is not valid JSON are logged and left out of the
    /// payload, but still count toward the watermark so a confirmed
    /// delivery removes them.
    pub async fn drain_batch(
        &self,
        table: Table,
        token: &str,
        include_automatic: bool,
        limit: u32,
    ) -> DbResult<Option<PersistedBatch>> {
        let query = format!(
            "SELECT id, data FROM {} WHERE token = ?1{} ORDER BY id ASC LIMIT ?2",
            table.as_str(),
            automatic_filter(include_automatic)
        );

        let rows = sqlx::query(&query)
            .bind(token)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        let Some(last) = rows.last() else {
            return Ok(None);
        };
        let watermark: i64 = last.try_get("id")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let data: String = row.try_get("data")?;

            if serde_json::from_str::<serde_json::Value>(&data).is_err() {
                warn!(table = %table, id, "Skipping malformed queued record");
                continue;
            }
            records.push(data);
        }

        Ok(Some(PersistedBatch::from_records(watermark, &records)))
    }

    /// Deletes every row for `token` with `id <= watermark`.
    ///
    /// With `include_automatic` unset, automatic rows are kept, matching
    /// the drain that produced the watermark.
    pub async fn delete_up_to(
        &self,
        watermark: i64,
        table: Table,
        token: &str,
        include_automatic: bool,
    ) -> DbResult<u64> {
        let query = format!(
            "DELETE FROM {} WHERE id <= ?1 AND token = ?2{}",
            table.as_str(),
            automatic_filter(include_automatic)
        );

        let result = sqlx::query(&query)
            .bind(watermark)
            .bind(token)
            .execute(&self.pool)
            .await?;

        debug!(
            table = %table,
            token = %token,
            watermark,
            deleted = result.rows_affected(),
            "Delivered records removed"
        );

        Ok(result.rows_affected())
    }

    /// Deletes every row in `table` created before `cutoff_ms`.
    pub async fn purge_older_than(&self, cutoff_ms: i64, table: Table) -> DbResult<u64> {
        let query = format!("DELETE FROM {} WHERE created_at <= ?1", table.as_str());

        let result = sqlx::query(&query)
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Empties both queues. Sequence numbers are untouched.
    pub async fn delete_all(&self) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        for table in Table::ALL {
            let query = format!("DELETE FROM {}", table.as_str());
            sqlx::query(&query).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn automatic_filter(include_automatic: bool) -> &'static str {
    if include_automatic {
        ""
    } else {
        " AND automatic_data = 0"
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
