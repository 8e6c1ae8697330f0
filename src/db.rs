//! SQLite storage backing [`SqliteSink`](crate::SqliteSink).
//!
//! Every pooled connection is opened with the same options: WAL journal,
//! `NORMAL` sync and a busy timeout, so concurrent sink writes queue on the
//! file lock instead of failing with `SQLITE_BUSY`. The schema in
//! `migrations/` is applied on open.
//!
//! # Example
//!
//! ```no_run
//! use doifetch_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("doifetch.db")).await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tracing::{debug, instrument};

/// Result rows are written one transaction at a time; a few readers suffice.
const FILE_POOL_SIZE: u32 = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors opening or querying the results database.
#[derive(Error, Debug)]
pub enum DbError {
    /// Connecting or running a statement failed.
    #[error("database error: {0}")]
    Connection(#[from] sqlx::Error),

    /// The embedded schema could not be applied.
    #[error("failed to apply schema: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pool over the results database, schema applied.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the results database at `db_path`, creating the file if missing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the file cannot be opened or the schema cannot
    /// be applied.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);
        let db = Self::open(options, FILE_POOL_SIZE).await?;
        debug!("results database ready");
        Ok(db)
    }

    /// Opens a private in-memory database.
    ///
    /// Limited to one connection: each SQLite connection to `:memory:` would
    /// otherwise see its own empty database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the schema cannot be applied.
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        Self::open(options, 1).await
    }

    async fn open(options: SqliteConnectOptions, pool_size: u32) -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns the pool, for queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reports the journal mode of a pooled connection, lowercased.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the pragma query fails.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_ascii_lowercase())
    }

    /// Waits for queued writes, then closes every connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
