//! Persistence collaborator for the market shell: a preferences singleton
//! and the per-scope drawings table. Never touched by pipeline tasks.

pub mod drawings;
pub mod preferences;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// SQLite-backed repository handle. Cheap to clone; all methods are async
/// and run off the market data hot path.
#[derive(Clone)]
pub struct MarketStore {
    pool: SqlitePool,
}

impl MarketStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// In-memory store, used by tests and ephemeral shells.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = MarketStore::open_in_memory()
            .await
            .expect("store opens in memory");

        sqlx::migrate!("./migrations")
            .run(store.pool())
            .await
            .expect("re-running migrations is a no-op");

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('market_preferences', 'market_drawings')",
        )
        .fetch_one(store.pool())
        .await
        .expect("schema query works");

        assert_eq!(tables, 2);
    }
}
