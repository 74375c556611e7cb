use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};


pub mod models;
pub mod queries;

pub use models::*;
pub use queries::{IndexFileQueries, MessageQueries, SegmentQueries, VectorIndexEntryQueries};

pub type DbPool = Pool<Sqlite>;

/// How long a connection waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_url: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_url)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    #[inline]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    #[inline]
    pub async fn initialize_from_config_dir(config_dir: &Path) -> Result<Self> {
        let db_path = config_dir.join("metadata.db");

        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        Self::new(&db_path).await
    }

    /// Cheap reachability probe for the health check
    #[inline]
    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Metadata store is unreachable")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn get_segment(&self, id: i64) -> Result<Option<ConversationSegment>> {
        SegmentQueries::get_by_id(&self.pool, id).await
    }

    #[inline]
    pub async fn insert_segment(
        &self,
        segment: &NewConversationSegment,
    ) -> Result<ConversationSegment> {
        SegmentQueries::create(&self.pool, segment).await
    }

    #[cfg(test)]
    pub(crate) async fn get_valid_index_file(
        &self,
        group_id: i64,
        index_type: VectorType,
    ) -> Result<Option<IndexFile>> {
        IndexFileQueries::get_valid(&self.pool, group_id, index_type).await
    }

    /// Optimize database performance by running VACUUM and ANALYZE
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing database performance");

        // Run VACUUM to reclaim space and defragment
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("Failed to vacuum database")?;

        // Run ANALYZE to update table statistics for better query planning
        sqlx::query("ANALYZE")
            .execute(&self.pool)
            .await
            .context("Failed to analyze database")?;

        debug!("Database optimization completed");
        Ok(())
    }
}

/// Whether an error chain bottoms out in SQLite reporting a locked or busy
/// database.
#[inline]
pub fn is_lock_contention(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        let Some(sqlx::Error::Database(db_error)) = cause.downcast_ref::<sqlx::Error>() else {
            return false;
        };
        // SQLITE_BUSY = 5, SQLITE_LOCKED = 6, extended codes keep the low byte
        let busy_code = db_error
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6));
        let message = db_error.message().to_ascii_lowercase();
        busy_code || message.contains("database is locked") || message.contains("busy")
    })
}
