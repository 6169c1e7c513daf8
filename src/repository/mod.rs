//! SQLite persistence for download state.
//!
//! One file on disk holds the document, page, and collection-progress tables.
//! SQLite serializes writers internally, so workers update independent rows
//! without any application-level coordination; WAL keeps readers unblocked
//! while writes are in flight.

mod store;

pub use store::{retry_delay, DocumentStore};

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

/// Failure raised by any store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O or SQLite failure.
    #[error("database error: {0}")]
    Io(String),
    /// A uniqueness or other constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// The database was locked by another writer.
    #[error("database busy: {0}")]
    Busy(String),
}

impl StoreError {
    /// Whether a single immediate retry of the same operation is sensible.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_) | StoreError::Io(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    StoreError::Busy(err.to_string())
                }
                rusqlite::ErrorCode::ConstraintViolation => StoreError::Constraint(err.to_string()),
                _ => StoreError::Io(err.to_string()),
            },
            _ => StoreError::Io(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Open a connection with the pragmas the pipeline relies on.
pub(crate) fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", 10_000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(conn)
}

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}
