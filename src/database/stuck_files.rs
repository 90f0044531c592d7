use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use sqlx::{Pool, Sqlite};
use tokio::sync::Mutex;

use crate::errors::AppError;
use crate::models::StuckFile;

/// A path enrolled more than this many times without appearing in the
/// server's index is suppressed from further refreshes.
pub const MAX_RETRIES: i64 = 3;

/// Persistent per-path retry counters. Every mutation runs inside a
/// single-writer transaction.
#[derive(Clone)]
pub struct StuckFileRepository {
    pool: Pool<Sqlite>,
    write_lock: Arc<Mutex<()>>,
}

impl StuckFileRepository {
    pub fn new(pool: Pool<Sqlite>, write_lock: Arc<Mutex<()>>) -> Self {
        Self { pool, write_lock }
    }

    /// Increment the retry counter for a path. Returns `true` once the
    /// counter has passed `MAX_RETRIES` and the path should be given up on.
    pub async fn record_attempt(&self, path: &Path) -> Result<bool, AppError> {
        let key = path.to_string_lossy();
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT attempts FROM stuck_files WHERE path = ?")
                .bind(key.as_ref())
                .fetch_optional(&mut *tx)
                .await?;

        let attempts = existing.unwrap_or(0) + 1;
        if existing.is_some() {
            sqlx::query("UPDATE stuck_files SET attempts = ?, last_seen = ? WHERE path = ?")
                .bind(attempts)
                .bind(Utc::now())
                .bind(key.as_ref())
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("INSERT INTO stuck_files (path, attempts, last_seen) VALUES (?, ?, ?)")
                .bind(key.as_ref())
                .bind(attempts)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(attempts > MAX_RETRIES)
    }

    /// Forget a path, typically because it was observed inside the library.
    pub async fn clear(&self, path: &Path) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM stuck_files WHERE path = ?")
            .bind(path.to_string_lossy().as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn attempts(&self, path: &Path) -> Result<Option<i64>, AppError> {
        let attempts = sqlx::query_scalar("SELECT attempts FROM stuck_files WHERE path = ?")
            .bind(path.to_string_lossy().as_ref())
            .fetch_optional(&self.pool)
            .await?;
        Ok(attempts)
    }

    pub async fn all(&self) -> Result<Vec<StuckFile>, AppError> {
        let rows = sqlx::query_as::<_, StuckFile>(
            "SELECT path, attempts, last_seen FROM stuck_files ORDER BY last_seen DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn clear_all(&self) -> Result<u64, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM stuck_files")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_database;

    #[tokio::test]
    async fn attempts_grow_until_give_up() {
        let (_dir, database) = test_database().await;
        let repo = database.stuck_files();
        let path = Path::new("/m/a.mkv");

        for _ in 0..MAX_RETRIES {
            assert!(!repo.record_attempt(path).await.unwrap());
        }
        // Fourth attempt crosses the threshold.
        assert!(repo.record_attempt(path).await.unwrap());
        assert_eq!(repo.attempts(path).await.unwrap(), Some(MAX_RETRIES + 1));
    }

    #[tokio::test]
    async fn clear_resets_the_counter() {
        let (_dir, database) = test_database().await;
        let repo = database.stuck_files();
        let path = Path::new("/m/b.mkv");

        repo.record_attempt(path).await.unwrap();
        repo.clear(path).await.unwrap();
        assert_eq!(repo.attempts(path).await.unwrap(), None);
        // Counting starts over after a clear.
        assert!(!repo.record_attempt(path).await.unwrap());
    }

    #[tokio::test]
    async fn clear_all_empties_the_table() {
        let (_dir, database) = test_database().await;
        let repo = database.stuck_files();

        repo.record_attempt(Path::new("/m/a.mkv")).await.unwrap();
        repo.record_attempt(Path::new("/m/b.mkv")).await.unwrap();
        assert_eq!(repo.clear_all().await.unwrap(), 2);
        assert!(repo.all().await.unwrap().is_empty());
    }
}
