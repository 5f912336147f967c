//! # Sequence Generator
//!
//! Durable, per-token, strictly increasing sequence numbers.
//!
//! ```text
//! get_and_increment("abc")
//!   │
//!   ├── cache hit?  no ──► SequenceStore::load("abc") (unseen token → 0)
//!   │
//!   ├── SequenceStore::save("abc", current + 1)   ← persisted first
//!   │
//!   └── return current
//! ```
//!
//! The generator is owned by the worker, so no locking is needed around the
//! read-increment-write. A value is only handed out after its successor is
//! stored, which keeps numbers unique across restarts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use tally_db::{Database, SequenceRepository};

use crate::error::{SyncError, SyncResult};

/// Backing storage for next-values.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// The next value to hand out, if one was stored.
    async fn load(&self, token: &str) -> SyncResult<Option<i64>>;

    /// Stores the next value to hand out.
    async fn save(&self, token: &str, next_value: i64) -> SyncResult<()>;
}

/// [`SequenceStore`] on the `sequence_numbers` table.
#[derive(Debug, Clone)]
pub struct SqliteSequenceStore {
    repo: SequenceRepository,
}

impl SqliteSequenceStore {
    pub fn new(db: &Database) -> Self {
        SqliteSequenceStore {
            repo: db.sequences(),
        }
    }
}

#[async_trait]
impl SequenceStore for SqliteSequenceStore {
    async fn load(&self, token: &str) -> SyncResult<Option<i64>> {
        Ok(self.repo.load(token).await?)
    }

    async fn save(&self, token: &str, next_value: i64) -> SyncResult<()> {
        Ok(self.repo.store(token, next_value).await?)
    }
}

/// [`SequenceStore`] in process memory.
#[derive(Debug, Default)]
pub struct MemorySequenceStore {
    values: Mutex<HashMap<String, i64>>,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceStore for MemorySequenceStore {
    async fn load(&self, token: &str) -> SyncResult<Option<i64>> {
        Ok(self.values.lock().await.get(token).copied())
    }

    async fn save(&self, token: &str, next_value: i64) -> SyncResult<()> {
        let mut values = self.values.lock().await;
        let entry = values.entry(token.to_string()).or_insert(next_value);
        *entry = (*entry).max(next_value);
        Ok(())
    }
}

// =============================================================================
// Generator
// =============================================================================

/// Hands out sequence numbers for the worker.
pub struct SequenceGenerator {
    store: Arc<dyn SequenceStore>,
    cache: HashMap<String, i64>,
}

impl SequenceGenerator {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        SequenceGenerator {
            store,
            cache: HashMap::new(),
        }
    }

    /// Returns the current value for `token` and persists its successor.
    pub async fn get_and_increment(&mut self, token: &str) -> SyncResult<i64> {
        let current = match self.cache.get(token) {
            Some(value) => *value,
            None => self.store.load(token).await?.unwrap_or(0),
        };

        let next = current
            .checked_add(1)
            .ok_or_else(|| SyncError::Internal(format!("sequence overflow for {}", token)))?;

        self.store.save(token, next).await?;
        self.cache.insert(token.to_string(), next);

        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_db::DbConfig;

    #[tokio::test]
    async fn test_unseen_token_starts_at_zero() {
        let mut generator = SequenceGenerator::new(Arc::new(MemorySequenceStore::new()));

        assert_eq!(generator.get_and_increment("abc").await.unwrap(), 0);
        assert_eq!(generator.get_and_increment("abc").await.unwrap(), 1);
        assert_eq!(generator.get_and_increment("xyz").await.unwrap(), 0);
        assert_eq!(generator.get_and_increment("abc").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.db");

        {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            let mut generator = SequenceGenerator::new(Arc::new(SqliteSequenceStore::new(&db)));
            for expected in 0..5 {
                assert_eq!(generator.get_and_increment("abc").await.unwrap(), expected);
            }
            db.close().await;
        }

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let mut generator = SequenceGenerator::new(Arc::new(SqliteSequenceStore::new(&db)));
        assert_eq!(generator.get_and_increment("abc").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_memory_store_never_lowers() {
        let store = MemorySequenceStore::new();
        store.save("abc", 7).await.unwrap();
        store.save("abc", 2).await.unwrap();
        assert_eq!(store.load("abc").await.unwrap(), Some(7));
    }
}
