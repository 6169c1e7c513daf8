//! Download scheduling: one dispatcher loop feeding a bounded worker pool.
//!
//! The dispatcher is the only place rows move from PENDING to IN_PROGRESS, so
//! each row has a single writer for its whole lifecycle. Workers are plain
//! spawned tasks; capacity is enforced by comparing the live in-flight count
//! against the tunable cap on every dispatch iteration.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::types::{PauseGate, SessionCounters};
use crate::fetcher::{CookieJar, FetchError, FetchedFile, Fetcher};
use crate::models::{DocumentRecord, DownloadStatus};
use crate::observer::DownloadObserver;
use crate::repository::{DocumentStore, StoreError};

/// Sleep while waiting for capacity or in-flight work.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Sleep while waiting for a producer or external scraper to feed rows.
const PRODUCER_WAIT: Duration = Duration::from_millis(200);
/// How many failed candidates to examine per refill.
const FAILED_REFILL_WINDOW: usize = 100;

/// Everything a dispatcher and its workers share.
pub(crate) struct SchedulerCtx {
    pub store: Arc<DocumentStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub observer: Arc<dyn DownloadObserver>,
    /// Jar to fold captured Set-Cookie headers into, when one is wired up.
    pub cookie_jar: Option<Arc<CookieJar>>,
    pub collection: u32,
    pub counters: Arc<SessionCounters>,
    pub max_concurrent: Arc<AtomicUsize>,
    pub max_retries: Arc<AtomicI32>,
    pub overwrite_existing: Arc<AtomicBool>,
    pub external_scraping: Arc<AtomicBool>,
    pub producers_active: Arc<AtomicUsize>,
    pub cancel: CancellationToken,
    pub pause: PauseGate,
}

/// Run the dispatch loop until the queue drains or cancellation fires.
/// Returns whether the pipeline drained naturally.
pub(crate) async fn run_dispatcher(ctx: Arc<SchedulerCtx>) -> bool {
    let mut workers: JoinSet<()> = JoinSet::new();

    let drained = loop {
        if ctx.cancel.is_cancelled() {
            break false;
        }
        ctx.pause.wait(&ctx.cancel).await;
        while workers.try_join_next().is_some() {}

        // Re-read the cap every iteration so live tuning takes effect.
        let max_concurrent = ctx.max_concurrent.load(Ordering::SeqCst);
        let in_flight = ctx.counters.in_flight.load(Ordering::SeqCst);
        if in_flight >= max_concurrent {
            if !idle_sleep(&ctx.cancel, IDLE_SLEEP).await {
                break false;
            }
            continue;
        }
        let free = max_concurrent - in_flight;

        let batch = match next_batch(&ctx, free).await {
            Ok(batch) => batch,
            Err(e) => {
                report_store_failure(&ctx, &e);
                break false;
            }
        };

        if batch.is_empty() {
            if in_flight > 0 {
                idle_sleep(&ctx.cancel, IDLE_SLEEP).await;
                continue;
            }
            if ctx.external_scraping.load(Ordering::SeqCst) {
                idle_sleep(&ctx.cancel, PRODUCER_WAIT).await;
                continue;
            }
            if ctx.producers_active.load(Ordering::SeqCst) > 0 {
                idle_sleep(&ctx.cancel, PRODUCER_WAIT).await;
                continue;
            }
            // Nothing in flight and nobody feeding: confirm against the store
            // before declaring the pipeline done.
            match with_retry(|| ctx.store.get_stats(ctx.collection)).await {
                Ok(stats) if stats.pending == 0 && stats.in_progress == 0 => {
                    info!(collection = ctx.collection, "download queue drained");
                    break true;
                }
                Ok(_) => {
                    idle_sleep(&ctx.cancel, IDLE_SLEEP).await;
                    continue;
                }
                Err(e) => {
                    report_store_failure(&ctx, &e);
                    break false;
                }
            }
        }

        for record in batch {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let marked = with_retry(|| {
                ctx.store
                    .update_status(record.id, DownloadStatus::InProgress, "", 0)
            })
            .await;
            if let Err(e) = marked {
                report_store_failure(&ctx, &e);
                break;
            }
            ctx.counters.in_flight.fetch_add(1, Ordering::SeqCst);
            let worker_ctx = ctx.clone();
            workers.spawn(async move {
                download_one(worker_ctx, record).await;
            });
        }
    };

    // Stop-and-join discipline: currently running transfers either finish or
    // observe cancellation before the dispatcher returns.
    while workers.join_next().await.is_some() {}
    drained
}

/// Pending rows first; otherwise failed rows whose backoff window elapsed.
async fn next_batch(
    ctx: &SchedulerCtx,
    free: usize,
) -> Result<Vec<DocumentRecord>, StoreError> {
    let pending = with_retry(|| ctx.store.claim_pending(ctx.collection, free)).await?;
    if !pending.is_empty() {
        return Ok(pending);
    }
    let max_retries = ctx.max_retries.load(Ordering::SeqCst);
    let mut retryable = with_retry(|| {
        ctx.store
            .list_failed_ready(ctx.collection, max_retries, FAILED_REFILL_WINDOW)
    })
    .await?;
    retryable.truncate(free);
    Ok(retryable)
}

async fn download_one(ctx: Arc<SchedulerCtx>, record: DocumentRecord) {
    if let Err(e) = run_worker(&ctx, &record).await {
        report_store_failure(&ctx, &e);
    }
    ctx.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
}

async fn run_worker(ctx: &SchedulerCtx, record: &DocumentRecord) -> Result<(), StoreError> {
    // Claimed but not started: leave the row IN_PROGRESS for the explicit
    // recovery reset.
    if ctx.cancel.is_cancelled() {
        return Ok(());
    }

    if !ctx.overwrite_existing.load(Ordering::SeqCst) && file_has_content(&record.local_path).await
    {
        with_retry(|| {
            ctx.store
                .update_status(record.id, DownloadStatus::Skipped, "", 0)
        })
        .await?;
        ctx.observer
            .on_status_change(&record.document_id, DownloadStatus::Skipped);
        return Ok(());
    }

    if let Some(parent) = record.local_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            let message = format!("create directory: {e}");
            warn!(document_id = %record.document_id, "{message}");
            with_retry(|| ctx.store.increment_retry(record.id)).await?;
            with_retry(|| {
                ctx.store
                    .update_status(record.id, DownloadStatus::Failed, &message, 0)
            })
            .await?;
            ctx.observer
                .on_status_change(&record.document_id, DownloadStatus::Failed);
            return Ok(());
        }
    }

    ctx.counters.mark_transfer_started();
    let result = ctx.fetcher.fetch_file(&record.url, &record.local_path).await;
    ctx.counters.mark_transfer_finished();

    if let Ok(fetched) = &result {
        fold_captured_cookies(ctx, &record.url, &fetched.set_cookies);
    }

    match classify(result) {
        Outcome::Completed { bytes, wire_time } => {
            ctx.counters.record_completed(bytes, wire_time);
            with_retry(|| {
                ctx.store
                    .update_status(record.id, DownloadStatus::Completed, "", bytes as i64)
            })
            .await?;
            ctx.observer
                .on_status_change(&record.document_id, DownloadStatus::Completed);
        }
        Outcome::NotFound(reason) => {
            remove_artifact(&record.local_path).await;
            with_retry(|| {
                ctx.store
                    .update_status(record.id, DownloadStatus::NotFound, reason, 0)
            })
            .await?;
            ctx.observer
                .on_status_change(&record.document_id, DownloadStatus::NotFound);
        }
        Outcome::Failed(message) => {
            remove_artifact(&record.local_path).await;
            with_retry(|| ctx.store.increment_retry(record.id)).await?;
            with_retry(|| {
                ctx.store
                    .update_status(record.id, DownloadStatus::Failed, &message, 0)
            })
            .await?;
            ctx.observer
                .on_status_change(&record.document_id, DownloadStatus::Failed);
        }
        Outcome::Cancelled => {
            // Not a failure; the row stays IN_PROGRESS for recovery.
            remove_artifact(&record.local_path).await;
        }
    }
    Ok(())
}

/// What a finished transfer means for the row.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed { bytes: u64, wire_time: Duration },
    NotFound(&'static str),
    Failed(String),
    Cancelled,
}

fn classify(result: Result<FetchedFile, FetchError>) -> Outcome {
    match result {
        Ok(fetched) => match fetched.http_code {
            404 => Outcome::NotFound("404 Not Found"),
            403 | 429 => Outcome::Failed(format!("Blocked: HTTP {}", fetched.http_code)),
            code if (200..300).contains(&code) => {
                if fetched.bytes_written == 0 {
                    Outcome::NotFound("Empty response")
                } else {
                    Outcome::Completed {
                        bytes: fetched.bytes_written,
                        wire_time: fetched.wall_time,
                    }
                }
            }
            code => Outcome::Failed(format!("HTTP error: {code}")),
        },
        Err(FetchError::Cancelled) => Outcome::Cancelled,
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

/// Retry a store call once when the failure looks transient.
async fn with_retry<T>(
    op: impl Fn() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    match op() {
        Err(e) if e.is_transient() => {
            tokio::time::sleep(Duration::from_millis(50)).await;
            op()
        }
        result => result,
    }
}

/// A persistent storage failure poisons the whole pipeline: surface it and
/// pull the shared cancellation signal.
fn report_store_failure(ctx: &SchedulerCtx, error: &StoreError) {
    error!(collection = ctx.collection, %error, "storage failure, aborting pipeline");
    ctx.observer.on_error(&format!("storage failure: {error}"));
    ctx.cancel.cancel();
}

fn fold_captured_cookies(ctx: &SchedulerCtx, url: &str, set_cookies: &[String]) {
    if set_cookies.is_empty() {
        return;
    }
    let Some(jar) = &ctx.cookie_jar else { return };
    let Some(host) = url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
    else {
        return;
    };
    for header in set_cookies {
        jar.add_set_cookie(header, &host);
    }
}

async fn file_has_content(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len() > 0)
        .unwrap_or(false)
}

async fn remove_artifact(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

/// Cancellable sleep; false means cancellation fired first.
async fn idle_sleep(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
