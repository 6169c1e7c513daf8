//! Download manager types: modes, options, counters, and stats snapshots.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_CONCURRENT_DOWNLOADS, MAX_RETRY_ATTEMPTS};
use crate::models::CollectionStats;

/// How documents are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Parse paginated index listings.
    Scraper,
    /// Enumerate the numeric identifier range.
    BruteForce,
    /// Both producers concurrently.
    Hybrid,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scraper" | "s" => Ok(Mode::Scraper),
            "brute" | "b" => Ok(Mode::BruteForce),
            "hybrid" | "h" => Ok(Mode::Hybrid),
            other => Err(format!(
                "invalid mode '{other}', expected scraper, brute, or hybrid"
            )),
        }
    }
}

/// Tunables fixed at manager construction (the concurrency cap and overwrite
/// flag stay live-tunable afterwards).
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Root of the download tree.
    pub download_root: PathBuf,
    /// Initial cap on concurrent downloads.
    pub max_concurrent: usize,
    /// Retry budget per document.
    pub max_retries: i32,
    /// Refetch documents whose file already exists locally.
    pub overwrite_existing: bool,
}

impl ManagerOptions {
    pub fn new(download_root: impl Into<PathBuf>) -> Self {
        Self {
            download_root: download_root.into(),
            max_concurrent: DEFAULT_CONCURRENT_DOWNLOADS,
            max_retries: MAX_RETRY_ATTEMPTS,
            overwrite_existing: false,
        }
    }
}

/// Session-scoped transfer counters shared between workers, dispatcher, and
/// the stats publisher. All plain atomics; no locks anywhere near I/O.
pub struct SessionCounters {
    /// Workers currently holding a claimed row.
    pub in_flight: AtomicUsize,
    /// Bytes landed on disk this session.
    pub bytes_this_session: AtomicU64,
    /// Summed per-transfer wire time.
    pub wire_time_ms: AtomicU64,
    started: Instant,
    /// Milliseconds since session start of the first transfer start (-1 until
    /// any transfer ran).
    first_active_ms: AtomicI64,
    /// Milliseconds since session start of the latest transfer end.
    last_active_ms: AtomicI64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            bytes_this_session: AtomicU64::new(0),
            wire_time_ms: AtomicU64::new(0),
            started: Instant::now(),
            first_active_ms: AtomicI64::new(-1),
            last_active_ms: AtomicI64::new(-1),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record that a transfer is starting now.
    pub fn mark_transfer_started(&self) {
        let now = self.started.elapsed().as_millis() as i64;
        let _ = self
            .first_active_ms
            .compare_exchange(-1, now, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Record that a transfer just ended.
    pub fn mark_transfer_finished(&self) {
        let now = self.started.elapsed().as_millis() as i64;
        self.last_active_ms.store(now, Ordering::SeqCst);
    }

    /// Account a completed download.
    pub fn record_completed(&self, bytes: u64, wire_time: Duration) {
        self.bytes_this_session.fetch_add(bytes, Ordering::Relaxed);
        self.wire_time_ms
            .fetch_add(wire_time.as_millis() as u64, Ordering::Relaxed);
    }

    /// Wall-clock span during which at least one transfer was active
    /// (first transfer start to latest transfer end), excluding idle gaps
    /// before the session's first burst.
    pub fn active_wall_ms(&self) -> u64 {
        let first = self.first_active_ms.load(Ordering::SeqCst);
        let last = self.last_active_ms.load(Ordering::SeqCst);
        if first < 0 || last <= first {
            0
        } else {
            (last - first) as u64
        }
    }
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate snapshot published to observers roughly once per second.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DownloadStats {
    pub collection: u32,

    pub total_pages: i64,
    pub pages_scraped: i64,
    pub files_found: i64,

    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
    pub not_found: i64,
    pub skipped: i64,

    /// Workers currently downloading.
    pub in_flight: usize,
    pub bytes_this_session: u64,
    /// Bytes per second over session wall time.
    pub current_speed_bps: f64,
    /// Bytes per second over the span downloads were actually active.
    pub wire_speed_bps: f64,
    #[serde(skip)]
    pub elapsed: Duration,

    pub brute_force_start: u64,
    pub brute_force_current: u64,
    pub brute_force_end: u64,
}

impl DownloadStats {
    /// Combine store-derived counts with session counters.
    pub fn assemble(
        collection: u32,
        store_stats: &CollectionStats,
        counters: &SessionCounters,
        brute_force_start: u64,
        brute_force_end: u64,
    ) -> Self {
        let elapsed = counters.elapsed();
        let bytes = counters.bytes_this_session.load(Ordering::Relaxed);
        let current_speed_bps = if elapsed.as_secs_f64() > 0.0 {
            bytes as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let active_ms = counters.active_wall_ms();
        let wire_speed_bps = if active_ms > 0 {
            bytes as f64 * 1000.0 / active_ms as f64
        } else {
            0.0
        };

        Self {
            collection,
            total_pages: store_stats.total_pages,
            pages_scraped: store_stats.pages_scraped,
            files_found: store_stats.files_found,
            pending: store_stats.pending,
            completed: store_stats.completed,
            failed: store_stats.failed,
            not_found: store_stats.not_found,
            skipped: store_stats.skipped,
            in_flight: counters.in_flight.load(Ordering::SeqCst),
            bytes_this_session: bytes,
            current_speed_bps,
            wire_speed_bps,
            elapsed,
            brute_force_start,
            brute_force_current: store_stats.brute_force_cursor,
            brute_force_end,
        }
    }
}

/// Pause gate shared by the dispatcher and every producer: one watch channel,
/// no per-component stop booleans.
#[derive(Clone)]
pub struct PauseGate {
    rx: watch::Receiver<bool>,
}

impl PauseGate {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Returns immediately while unpaused; otherwise resolves on resume or
    /// cancellation.
    pub async fn wait(&self, cancel: &CancellationToken) {
        if !*self.rx.borrow() {
            return;
        }
        let mut rx = self.rx.clone();
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = rx.wait_for(|paused| !*paused) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("scraper".parse::<Mode>().unwrap(), Mode::Scraper);
        assert_eq!("b".parse::<Mode>().unwrap(), Mode::BruteForce);
        assert_eq!("hybrid".parse::<Mode>().unwrap(), Mode::Hybrid);
        assert!("turbo".parse::<Mode>().is_err());
    }

    #[test]
    fn wire_speed_excludes_leading_idle() {
        let counters = SessionCounters::new();
        assert_eq!(counters.active_wall_ms(), 0);

        counters.mark_transfer_started();
        std::thread::sleep(Duration::from_millis(15));
        counters.mark_transfer_finished();
        counters.record_completed(1500, Duration::from_millis(10));

        assert!(counters.active_wall_ms() >= 10);
        let stats = DownloadStats::assemble(
            11,
            &CollectionStats::default(),
            &counters,
            0,
            0,
        );
        assert_eq!(stats.bytes_this_session, 1500);
        assert!(stats.wire_speed_bps > 0.0);
    }

    #[tokio::test]
    async fn pause_gate_passes_when_unpaused() {
        let (_tx, rx) = watch::channel(false);
        let gate = PauseGate::new(rx);
        // Must not hang.
        gate.wait(&CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resume() {
        let (tx, rx) = watch::channel(true);
        let gate = PauseGate::new(rx);
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn(async move {
            gate.wait(&cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.send(false).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("gate released after resume")
            .unwrap();
    }

    #[tokio::test]
    async fn pause_gate_releases_on_cancellation() {
        let (_tx, rx) = watch::channel(true);
        let gate = PauseGate::new(rx);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), gate.wait(&cancel))
            .await
            .expect("cancelled gate must not block");
    }
}
