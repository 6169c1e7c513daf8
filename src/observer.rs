//! Progress fan-out to front-ends.
//!
//! The download manager holds exactly one observer; anything wanting
//! per-event detail (a CLI status line, a GUI, a test harness) implements the
//! subset of callbacks it cares about and leaves the rest as no-ops.

use crate::models::DownloadStatus;
use crate::services::download::DownloadStats;

/// Callbacks fired by the pipeline. Every method has a no-op default.
///
/// Callbacks run on pipeline tasks; implementations must return quickly and
/// never block on the manager's own API.
pub trait DownloadObserver: Send + Sync {
    /// Aggregate snapshot, published roughly once per second.
    fn on_stats(&self, stats: &DownloadStats) {
        let _ = stats;
    }

    /// A document row reached a new terminal or retryable state.
    fn on_status_change(&self, document_id: &str, status: DownloadStatus) {
        let _ = (document_id, status);
    }

    /// An index page was scraped, listing `pdf_count` documents.
    fn on_page_scraped(&self, page: u32, pdf_count: usize) {
        let _ = (page, pdf_count);
    }

    /// The pipeline drained its queue and shut down.
    fn on_complete(&self) {}

    /// An operator-visible error (storage failure, bot challenge, ...).
    fn on_error(&self, error: &str) {
        let _ = error;
    }
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl DownloadObserver for NoopObserver {}
