//! Document records and their download state machine.
//!
//! Every document known to the pipeline has exactly one record, keyed by
//! (collection, document identifier). Records are created PENDING by the
//! discovery producers and walked to a terminal state by the scheduler;
//! only explicit reset operations move a record backwards.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Download state of a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Queued, not yet attempted.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Downloaded and size-verified.
    Completed,
    /// Attempt failed; eligible for retry once its backoff window elapses.
    Failed,
    /// The origin answered 404 (or an empty body) for this document.
    NotFound,
    /// A nonzero-length file already existed locally.
    Skipped,
}

impl DownloadStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "PENDING",
            DownloadStatus::InProgress => "IN_PROGRESS",
            DownloadStatus::Completed => "COMPLETED",
            DownloadStatus::Failed => "FAILED",
            DownloadStatus::NotFound => "NOT_FOUND",
            DownloadStatus::Skipped => "SKIPPED",
        }
    }

    /// Parse the database representation; unknown strings read as PENDING.
    pub fn parse(s: &str) -> Self {
        match s {
            "IN_PROGRESS" => DownloadStatus::InProgress,
            "COMPLETED" => DownloadStatus::Completed,
            "FAILED" => DownloadStatus::Failed,
            "NOT_FOUND" => DownloadStatus::NotFound,
            "SKIPPED" => DownloadStatus::Skipped,
            _ => DownloadStatus::Pending,
        }
    }

    /// Whether this state is never rewritten except by an explicit reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::NotFound | DownloadStatus::Skipped
        )
    }
}

/// One document's durable download state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Stable row handle.
    pub id: i64,
    /// Collection (data set) number.
    pub collection: u32,
    /// Canonical identifier, e.g. `EFTA02205655`.
    pub document_id: String,
    /// Absolute download URL.
    pub url: String,
    /// Target path under the download root.
    pub local_path: PathBuf,
    pub status: DownloadStatus,
    /// Bytes written on success, 0 otherwise.
    pub file_size: i64,
    /// Failed attempts so far; never decremented.
    pub retry_count: i32,
    /// Diagnostic from the last failure, empty on success.
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Fresh PENDING record, ready for insertion.
    pub fn pending(
        collection: u32,
        document_id: impl Into<String>,
        url: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            collection,
            document_id: document_id.into(),
            url: url.into(),
            local_path: local_path.into(),
            status: DownloadStatus::Pending,
            file_size: 0,
            retry_count: 0,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_text() {
        for status in [
            DownloadStatus::Pending,
            DownloadStatus::InProgress,
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::NotFound,
            DownloadStatus::Skipped,
        ] {
            assert_eq!(DownloadStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_reads_as_pending() {
        assert_eq!(DownloadStatus::parse("GARBAGE"), DownloadStatus::Pending);
    }

    #[test]
    fn terminal_states() {
        assert!(DownloadStatus::Completed.is_terminal());
        assert!(DownloadStatus::NotFound.is_terminal());
        assert!(DownloadStatus::Skipped.is_terminal());
        assert!(!DownloadStatus::Failed.is_terminal());
        assert!(!DownloadStatus::Pending.is_terminal());
        assert!(!DownloadStatus::InProgress.is_terminal());
    }
}
