//! Terminal result persistence.
//!
//! The scheduler hands each [`ResolutionResult`] to a [`ResultSink`] exactly
//! once. Writes for different DOIs may arrive in any order and must not
//! interfere with each other.
//!
//! - [`MemorySink`] keeps results in memory (tests, library callers)
//! - [`SqliteSink`] stores them in the SQLite schema from `migrations/`

mod memory;
mod sqlite;

pub use memory::MemorySink;
pub use sqlite::SqliteSink;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::DbError;
use crate::workflow::ResolutionResult;

/// Errors raised while recording results.
#[derive(Debug, Error)]
pub enum SinkError {
    /// A database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The database could not be opened.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The sink cannot accept writes.
    #[error("result sink unavailable: {0}")]
    Unavailable(String),
}

/// Receives terminal results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Stores one result.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when the result could not be stored. The
    /// scheduler treats this as fatal for the run.
    async fn record(&self, result: &ResolutionResult) -> Result<(), SinkError>;
}
