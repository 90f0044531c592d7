use std::sync::Arc;

use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::AppError;
use crate::models::EventRecord;

/// The event log keeps only the newest rows; older ones are pruned on
/// every insert.
pub const EVENT_LOG_CAPACITY: i64 = 20_000;

/// Aggregated health-check outcomes, for the stats endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HealthCounts {
    pub healthy: i64,
    pub corrupt: i64,
    pub timeout: i64,
}

/// Append-only event log with capped retention.
#[derive(Clone)]
pub struct EventRepository {
    pool: Pool<Sqlite>,
    write_lock: Arc<Mutex<()>>,
}

impl EventRepository {
    pub fn new(pool: Pool<Sqlite>, write_lock: Arc<Mutex<()>>) -> Self {
        Self { pool, write_lock }
    }

    /// Insert one row, then prune everything outside the newest
    /// `EVENT_LOG_CAPACITY`. Prune failures are logged, not raised.
    pub async fn append(&self, event_type: &str, details: &str, status: &str) {
        let _guard = self.write_lock.lock().await;

        let inserted =
            sqlx::query("INSERT INTO events (timestamp, event_type, details, status) VALUES (?, ?, ?, ?)")
                .bind(Utc::now())
                .bind(event_type)
                .bind(details)
                .bind(status)
                .execute(&self.pool)
                .await;
        if let Err(e) = inserted {
            warn!("Failed to append event '{event_type}': {e}");
            return;
        }

        let pruned = sqlx::query(
            "DELETE FROM events WHERE id NOT IN (SELECT id FROM events ORDER BY id DESC LIMIT ?)",
        )
        .bind(EVENT_LOG_CAPACITY)
        .execute(&self.pool)
        .await;
        if let Err(e) = pruned {
            warn!("Failed to prune event log: {e}");
        }
    }

    /// Newest-first page of the log, optionally filtered by a search term
    /// over details and event type.
    pub async fn history(
        &self,
        limit: i64,
        offset: i64,
        search: Option<&str>,
    ) -> Result<Vec<EventRecord>, AppError> {
        let rows = match search.filter(|s| !s.trim().is_empty()) {
            Some(term) => {
                let pattern = format!("%{}%", term.trim());
                sqlx::query_as::<_, EventRecord>(
                    "SELECT id, timestamp, event_type, details, status FROM events \
                     WHERE details LIKE ? OR event_type LIKE ? \
                     ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(&pattern)
                .bind(&pattern)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, EventRecord>(
                    "SELECT id, timestamp, event_type, details, status FROM events \
                     ORDER BY id DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn clear_all(&self) -> Result<u64, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM events").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn health_counts(&self) -> Result<HealthCounts, AppError> {
        let rows = sqlx::query(
            "SELECT event_type, COUNT(*) AS n FROM events \
             WHERE event_type LIKE 'Health Check%' GROUP BY event_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HealthCounts::default();
        for row in rows {
            let event_type: String = row.get("event_type");
            let n: i64 = row.get("n");
            match event_type.as_str() {
                "Health Check Passed" => counts.healthy += n,
                "Health Check Timeout" => counts.timeout += n,
                _ => counts.corrupt += n,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_database;

    #[tokio::test]
    async fn history_is_newest_first_and_searchable() {
        let (_dir, database) = test_database().await;
        let repo = database.events();

        repo.append("Scan Triggered", "/m/Show/Season 01", "Plex").await;
        repo.append("Health Check Failed", "bad.mkv", "Incomplete").await;
        repo.append("Scan Triggered", "/m/Movie (2020)", "Plex").await;

        let all = repo.history(50, 0, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].details, "/m/Movie (2020)");

        let filtered = repo.history(50, 0, Some("Season")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].event_type, "Scan Triggered");

        let paged = repo.history(1, 1, None).await.unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].details, "bad.mkv");
    }

    #[tokio::test]
    async fn health_counts_group_by_outcome() {
        let (_dir, database) = test_database().await;
        let repo = database.events();

        repo.append("Health Check Passed", "a.mkv", "Healthy").await;
        repo.append("Health Check Passed", "b.mkv", "Healthy").await;
        repo.append("Health Check Failed", "c.mkv", "0 Bytes").await;
        repo.append("Health Check Timeout", "d.mkv", "Timeout").await;
        repo.append("Scan Triggered", "/m", "Plex").await;

        let counts = repo.health_counts().await.unwrap();
        assert_eq!(counts.healthy, 2);
        assert_eq!(counts.corrupt, 1);
        assert_eq!(counts.timeout, 1);
    }
}
