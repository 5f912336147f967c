//! # Sequence Number Repository
//!
//! Persists the next sequence number per project token. Stored values
//! only ever grow: a write below the current value is ignored.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Repository for the `sequence_numbers` table.
#[derive(Debug, Clone)]
pub struct SequenceRepository {
    pool: SqlitePool,
}

impl SequenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SequenceRepository { pool }
    }

    /// The next value to hand out for `token`, if one was ever stored.
    pub async fn load(&self, token: &str) -> DbResult<Option<i64>> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT next_value FROM sequence_numbers WHERE token = ?1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    /// Stores `next_value` for `token` unless a larger value is already there.
    pub async fn store(&self, token: &str, next_value: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sequence_numbers (token, next_value) VALUES (?1, ?2)
            ON CONFLICT(token) DO UPDATE SET
                next_value = MAX(next_value, excluded.next_value)
            "#,
        )
        .bind(token)
        .bind(next_value)
        .execute(&self.pool)
        .await?;

        debug!(token = %token, next_value, "Sequence number stored");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_load_missing_token() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert_eq!(db.sequences().load("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_never_lowers() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.sequences();

        repo.store("abc", 5).await.unwrap();
        repo.store("abc", 3).await.unwrap();
        assert_eq!(repo.load("abc").await.unwrap(), Some(5));

        repo.store("abc", 6).await.unwrap();
        assert_eq!(repo.load("abc").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_delete_all_keeps_sequences() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.sequences().store("abc", 9).await.unwrap();

        db.queue().delete_all().await.unwrap();

        assert_eq!(db.sequences().load("abc").await.unwrap(), Some(9));
    }
}
