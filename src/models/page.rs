//! Index page bookkeeping and aggregate counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scrape state of one index page, keyed by (collection, page index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub collection: u32,
    pub page_index: u32,
    pub scraped: bool,
    /// Documents discovered on this page.
    pub pdf_count: i64,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Aggregate per-collection counts derived from the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total_pages: i64,
    pub pages_scraped: i64,
    pub files_found: i64,

    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub not_found: i64,
    pub skipped: i64,

    /// Highest numeric identifier the brute-force producer has staged.
    pub brute_force_cursor: u64,
}

impl CollectionStats {
    /// Total number of known document records.
    pub fn total_documents(&self) -> i64 {
        self.pending + self.in_progress + self.completed + self.failed + self.not_found
            + self.skipped
    }
}
