//! # Record Store
//!
//! The persistence seam the worker drives: append, drain, confirm, purge.
//!
//! ## Implementations
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        RecordStore                                      │
//! │                                                                         │
//! │   ┌───────────────────────────┐      ┌──────────────────────────────┐  │
//! │   │  SqliteRecordStore        │      │  MemoryStore                 │  │
//! │   │                           │      │                              │  │
//! │   │  tally-db QueueRepository │      │  Vec of rows behind a mutex  │  │
//! │   │  durable across restarts  │      │  same drain/delete semantics │  │
//! │   └───────────────────────────┘      └──────────────────────────────┘  │
//! │                                                                         │
//! │   add_record ──► Queued(depth) | OutOfMemory                           │
//! │   drain_batch ──► PersistedBatch { watermark, payload, count } | None  │
//! │   delete_up_to(watermark) ──► only after a confirmed delivery          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tally_core::{PersistedBatch, Table};
use tally_db::{Database, QueueRepository};

use crate::error::SyncResult;

/// Result of appending a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Stored; carries the number of rows queued for the token.
    Queued(u64),

    /// Refused for lack of space. The caller should flush now.
    OutOfMemory,
}

/// Durable queue of serialized records, keyed by (table, token).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Appends a record.
    async fn add_record(
        &self,
        table: Table,
        token: &str,
        record: &str,
        automatic: bool,
    ) -> SyncResult<AddOutcome>;

    /// Returns the oldest queued records for `token`, or `None` when empty.
    async fn drain_batch(
        &self,
        table: Table,
        token: &str,
        include_automatic: bool,
    ) -> SyncResult<Option<PersistedBatch>>;

    /// Deletes records for `token` up to and including `watermark`.
    async fn delete_up_to(
        &self,
        watermark: i64,
        table: Table,
        token: &str,
        include_automatic: bool,
    ) -> SyncResult<()>;

    /// Deletes records created at or before `cutoff_ms`.
    async fn purge_older_than(&self, cutoff_ms: i64, table: Table) -> SyncResult<()>;

    /// Deletes every queued record.
    async fn delete_all(&self) -> SyncResult<()>;
}

// =============================================================================
// SQLite Store
// =============================================================================

/// [`RecordStore`] backed by the SQLite queue tables.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    queue: QueueRepository,
    batch_size: u32,
    max_queue_depth: Option<u64>,
}

impl SqliteRecordStore {
    pub fn new(db: &Database, batch_size: u32) -> Self {
        SqliteRecordStore {
            queue: db.queue(),
            batch_size,
            max_queue_depth: None,
        }
    }

    /// Refuse new records once a token has this many queued.
    pub fn with_max_queue_depth(mut self, max: Option<u64>) -> Self {
        self.max_queue_depth = max;
        self
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn add_record(
        &self,
        table: Table,
        token: &str,
        record: &str,
        automatic: bool,
    ) -> SyncResult<AddOutcome> {
        if let Some(max) = self.max_queue_depth {
            if self.queue.count(table, token).await? >= max {
                warn!(table = %table, token = %token, max, "Queue depth ceiling reached");
                return Ok(AddOutcome::OutOfMemory);
            }
        }

        match self.queue.add_record(table, token, record, automatic).await {
            Ok(depth) => Ok(AddOutcome::Queued(depth)),
            Err(e) if e.is_storage_full() => {
                warn!(table = %table, token = %token, error = %e, "Storage full");
                Ok(AddOutcome::OutOfMemory)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn drain_batch(
        &self,
        table: Table,
        token: &str,
        include_automatic: bool,
    ) -> SyncResult<Option<PersistedBatch>> {
        Ok(self
            .queue
            .drain_batch(table, token, include_automatic, self.batch_size)
            .await?)
    }

    async fn delete_up_to(
        &self,
        watermark: i64,
        table: Table,
        token: &str,
        include_automatic: bool,
    ) -> SyncResult<()> {
        self.queue
            .delete_up_to(watermark, table, token, include_automatic)
            .await?;
        Ok(())
    }

    async fn purge_older_than(&self, cutoff_ms: i64, table: Table) -> SyncResult<()> {
        let purged = self.queue.purge_older_than(cutoff_ms, table).await?;
        if purged > 0 {
            debug!(table = %table, purged, "Expired records purged");
        }
        Ok(())
    }

    async fn delete_all(&self) -> SyncResult<()> {
        self.queue.delete_all().await?;
        Ok(())
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Debug, Clone)]
struct MemoryRow {
    id: i64,
    table: Table,
    token: String,
    data: String,
    automatic: bool,
    created_at: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: Vec<MemoryRow>,
}

/// [`RecordStore`] kept in process memory. Nothing survives a restart.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    batch_size: usize,
    max_queue_depth: Option<u64>,
}

impl MemoryStore {
    pub fn new(batch_size: usize) -> Self {
        MemoryStore {
            state: Mutex::new(MemoryState {
                next_id: 1,
                rows: Vec::new(),
            }),
            batch_size,
            max_queue_depth: None,
        }
    }

    pub fn with_max_queue_depth(mut self, max: Option<u64>) -> Self {
        self.max_queue_depth = max;
        self
    }

    /// Serialized records queued for (table, token), oldest first.
    pub async fn pending(&self, table: Table, token: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .rows
            .iter()
            .filter(|row| row.table == table && row.token == token)
            .map(|row| row.data.clone())
            .collect()
    }

    /// Total queued records across tables and tokens.
    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn depth(state: &MemoryState, table: Table, token: &str) -> u64 {
        state
            .rows
            .iter()
            .filter(|row| row.table == table && row.token == token)
            .count() as u64
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn add_record(
        &self,
        table: Table,
        token: &str,
        record: &str,
        automatic: bool,
    ) -> SyncResult<AddOutcome> {
        let mut state = self.state.lock().await;

        if let Some(max) = self.max_queue_depth {
            if Self::depth(&state, table, token) >= max {
                return Ok(AddOutcome::OutOfMemory);
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        state.rows.push(MemoryRow {
            id,
            table,
            token: token.to_string(),
            data: record.to_string(),
            automatic,
            created_at: Utc::now().timestamp_millis(),
        });

        Ok(AddOutcome::Queued(Self::depth(&state, table, token)))
    }

    async fn drain_batch(
        &self,
        table: Table,
        token: &str,
        include_automatic: bool,
    ) -> SyncResult<Option<PersistedBatch>> {
        let state = self.state.lock().await;

        let rows: Vec<&MemoryRow> = state
            .rows
            .iter()
            .filter(|row| row.table == table && row.token == token)
            .filter(|row| include_automatic || !row.automatic)
            .take(self.batch_size)
            .collect();

        let Some(last) = rows.last() else {
            return Ok(None);
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            if serde_json::from_str::<serde_json::Value>(&row.data).is_err() {
                warn!(table = %table, id = row.id, "Skipping malformed queued record");
                continue;
            }
            records.push(row.data.as_str());
        }

        Ok(Some(PersistedBatch::from_records(last.id, &records)))
    }

    async fn delete_up_to(
        &self,
        watermark: i64,
        table: Table,
        token: &str,
        include_automatic: bool,
    ) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state.rows.retain(|row| {
            let covered = row.table == table
                && row.token == token
                && row.id <= watermark
                && (include_automatic || !row.automatic);
            !covered
        });
        Ok(())
    }

    async fn purge_older_than(&self, cutoff_ms: i64, table: Table) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        state
            .rows
            .retain(|row| !(row.table == table && row.created_at <= cutoff_ms));
        Ok(())
    }

    async fn delete_all(&self) -> SyncResult<()> {
        self.state.lock().await.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_db::DbConfig;

    #[tokio::test]
    async fn test_memory_store_drain_and_delete() {
        let store = MemoryStore::new(2);
        for n in 0..3 {
            store
                .add_record(Table::Events, "abc", &format!(r#"{{"n":{n}}}"#), false)
                .await
                .unwrap();
        }

        let batch = store.drain_batch(Table::Events, "abc", false).await.unwrap().unwrap();
        assert_eq!(batch.count, 2);
        assert_eq!(batch.payload, r#"[{"n":0},{"n":1}]"#);

        store
            .delete_up_to(batch.watermark, Table::Events, "abc", false)
            .await
            .unwrap();
        assert_eq!(store.pending(Table::Events, "abc").await, vec![r#"{"n":2}"#]);
    }

    #[tokio::test]
    async fn test_memory_store_ceiling() {
        let store = MemoryStore::new(50).with_max_queue_depth(Some(1));
        assert_eq!(
            store.add_record(Table::Events, "abc", "{}", false).await.unwrap(),
            AddOutcome::Queued(1)
        );
        assert_eq!(
            store.add_record(Table::Events, "abc", "{}", false).await.unwrap(),
            AddOutcome::OutOfMemory
        );
        assert_eq!(
            store.add_record(Table::Events, "xyz", "{}", false).await.unwrap(),
            AddOutcome::Queued(1)
        );
    }

    #[tokio::test]
    async fn test_memory_store_keeps_automatic_when_excluded() {
        let store = MemoryStore::default();
        store.add_record(Table::Events, "abc", r#"{"a":1}"#, true).await.unwrap();
        store.add_record(Table::Events, "abc", r#"{"m":1}"#, false).await.unwrap();

        let batch = store.drain_batch(Table::Events, "abc", false).await.unwrap().unwrap();
        assert_eq!(batch.payload, r#"[{"m":1}]"#);

        store
            .delete_up_to(batch.watermark, Table::Events, "abc", false)
            .await
            .unwrap();
        assert_eq!(store.pending(Table::Events, "abc").await, vec![r#"{"a":1}"#]);
    }

    #[tokio::test]
    async fn test_sqlite_store_ceiling_and_delete_all() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("store.db")))
            .await
            .unwrap();
        let store = SqliteRecordStore::new(&db, 50).with_max_queue_depth(Some(2));

        assert_eq!(
            store.add_record(Table::People, "abc", "{}", false).await.unwrap(),
            AddOutcome::Queued(1)
        );
        store.add_record(Table::People, "abc", "{}", false).await.unwrap();
        assert_eq!(
            store.add_record(Table::People, "abc", "{}", false).await.unwrap(),
            AddOutcome::OutOfMemory
        );

        store.delete_all().await.unwrap();
        assert!(store.drain_batch(Table::People, "abc", true).await.unwrap().is_none());
    }
}
