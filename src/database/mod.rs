use std::sync::Arc;

use sqlx::migrate::MigrateDatabase;
use sqlx::{Pool, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::AppError;

pub mod events;
pub mod stuck_files;

pub use events::EventRepository;
pub use stuck_files::StuckFileRepository;

/// SQLite-backed persistent store for the stuck-file tracker and the
/// append-only event log. All writers serialize on one lock.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    write_lock: Arc<Mutex<()>>,
}

impl Database {
    pub async fn new(url: &str) -> Result<Self, AppError> {
        if !Sqlite::database_exists(url).await.unwrap_or(false) {
            Sqlite::create_database(url).await?;
        }

        let pool = SqlitePool::connect(url).await?;

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Idempotent schema setup; safe to run on every start.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stuck_files (
                path TEXT PRIMARY KEY,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                details TEXT NOT NULL,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type)")
            .execute(&self.pool)
            .await?;

        info!("Database schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn stuck_files(&self) -> StuckFileRepository {
        StuckFileRepository::new(self.pool.clone(), self.write_lock.clone())
    }

    pub fn events(&self) -> EventRepository {
        EventRepository::new(self.pool.clone(), self.write_lock.clone())
    }
}

#[cfg(test)]
pub(crate) async fn test_database() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("test.db").display());
    let database = Database::new(&url).await.unwrap();
    database.migrate().await.unwrap();
    (dir, database)
}
