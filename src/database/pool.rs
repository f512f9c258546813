use crate::config::StoreConfig;
use crate::error::{Result, SwivelError};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the catalog file
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(path = %config.path.display(), "Opening proxy catalog");

        let opts = SqliteConnectOptions::from_str(&config.database_url())
            .map_err(|e| SwivelError::DatabaseConnection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.busy_timeout));

        Self::connect(opts).await
    }

    /// Open an in-memory catalog (used by tests)
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SwivelError::DatabaseConnection(e.to_string()))?;
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> Result<Self> {
        // SQLite permits limited write concurrency; a single connection keeps
        // row updates serialized and avoids "database is locked" churn.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| SwivelError::DatabaseConnection(e.to_string()))?;

        Ok(Database { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if the catalog is healthy
    pub async fn health_check(&self) -> Result<Duration> {
        let start = std::time::Instant::now();

        sqlx::query("SELECT 1").execute(&self.pool).await?;

        Ok(start.elapsed())
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        super::migrations::run_migrations(&self.pool).await
    }

    /// Close the connection pool
    pub async fn close(&self) {
        info!("Closing proxy catalog");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_open_and_health() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        assert!(db.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_file_backed_catalog_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("catalog.db"),
            busy_timeout: 5,
        };

        {
            let db = Database::new(&config).await.unwrap();
            db.run_migrations().await.unwrap();
            sqlx::query(
                "INSERT INTO proxies (kind, credential, api_key, change_url, min_time, fingerprint, is_unique, last_changed, created_at, updated_at)
                 VALUES ('static', '1.2.3.4:8080', '', '', 0, 'fp-persist', 1, 100, 100, 100)",
            )
            .execute(db.pool())
            .await
            .unwrap();
            db.close().await;
        }

        let db = Database::new(&config).await.unwrap();
        db.run_migrations().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxies")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
