//! Download manager: lifecycle owner for one download session.
//!
//! Wires the store, fetcher, discovery producers, scheduler, and stats
//! publisher together. A manager instance drives a single session: construct,
//! `start`, then either wait for natural completion with `join` or end it
//! with `stop`. Front-ends observe progress through one
//! [`DownloadObserver`](crate::observer::DownloadObserver).

mod scheduler;
mod types;

pub use types::{DownloadStats, ManagerOptions, Mode, PauseGate, SessionCounters};

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CollectionConfig, MAX_CONCURRENT_DOWNLOADS};
use crate::fetcher::{CookieJar, Fetcher};
use crate::models::DocumentRecord;
use crate::observer::DownloadObserver;
use crate::repository::{DocumentStore, StoreError};
use crate::scrapers::{run_brute_force, run_index_producer, IndexScraper};
use scheduler::SchedulerCtx;

/// Coordinates producers, scheduler, and stats publishing for one collection.
pub struct DownloadManager {
    store: Arc<DocumentStore>,
    fetcher: Arc<dyn Fetcher>,
    observer: Arc<dyn DownloadObserver>,
    cookie_jar: Option<Arc<CookieJar>>,

    download_root: std::path::PathBuf,
    max_concurrent: Arc<AtomicUsize>,
    max_retries: Arc<AtomicI32>,
    overwrite_existing: Arc<AtomicBool>,
    external_scraping: Arc<AtomicBool>,
    producers_active: Arc<AtomicUsize>,
    counters: Arc<SessionCounters>,

    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    collection: Mutex<Option<CollectionConfig>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Build a manager for one session. The cancellation token is shared with
    /// the fetcher so `stop` aborts transfers mid-stream.
    pub fn new(
        store: Arc<DocumentStore>,
        fetcher: Arc<dyn Fetcher>,
        observer: Arc<dyn DownloadObserver>,
        cancel: CancellationToken,
        options: ManagerOptions,
    ) -> Self {
        let (pause_tx, _) = watch::channel(false);
        let (finished_tx, _) = watch::channel(false);
        Self {
            store,
            fetcher,
            observer,
            cookie_jar: None,
            download_root: options.download_root,
            max_concurrent: Arc::new(AtomicUsize::new(
                options.max_concurrent.clamp(1, MAX_CONCURRENT_DOWNLOADS),
            )),
            max_retries: Arc::new(AtomicI32::new(options.max_retries)),
            overwrite_existing: Arc::new(AtomicBool::new(options.overwrite_existing)),
            external_scraping: Arc::new(AtomicBool::new(false)),
            producers_active: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(SessionCounters::new()),
            cancel,
            pause_tx,
            finished_tx,
            running: Arc::new(AtomicBool::new(false)),
            collection: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wire up the jar that captured Set-Cookie headers get folded into.
    pub fn with_cookie_jar(mut self, jar: Arc<CookieJar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    /// Start producers and the scheduler for a collection.
    pub fn start(&self, collection: CollectionConfig, mode: Mode) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("download manager already running");
            return;
        }
        let _ = self.pause_tx.send(false);
        *self.collection.lock().unwrap() = Some(collection.clone());
        info!(
            collection = collection.id,
            name = %collection.name,
            ?mode,
            "starting download pipeline"
        );

        let mut tasks = self.tasks.lock().unwrap();
        if matches!(mode, Mode::Scraper | Mode::Hybrid) {
            tasks.push(self.spawn_index_producer(&collection));
        }
        if matches!(mode, Mode::BruteForce | Mode::Hybrid) {
            tasks.push(self.spawn_brute_force_producer(&collection));
        }
        tasks.push(self.spawn_stats_publisher(&collection));
        tasks.push(self.spawn_dispatcher(&collection));
    }

    /// Scheduler only; rows arrive from an external scraper via
    /// [`queue_documents`](Self::queue_documents) or direct store writes.
    pub fn start_download_only(&self, collection: CollectionConfig) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("download manager already running");
            return;
        }
        let _ = self.pause_tx.send(false);
        *self.collection.lock().unwrap() = Some(collection.clone());
        info!(
            collection = collection.id,
            "starting download-only pipeline"
        );

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_stats_publisher(&collection));
        tasks.push(self.spawn_dispatcher(&collection));
    }

    /// Hold dispatch and producers at their next suspension point.
    pub fn pause(&self) {
        if !self.pause_tx.send_replace(true) {
            info!("download pipeline paused");
        }
    }

    /// Release a paused pipeline.
    pub fn resume(&self) {
        if self.pause_tx.send_replace(false) {
            info!("download pipeline resumed");
        }
    }

    /// Cancel everything and join every task. When this returns no worker is
    /// still executing and no further rows transition.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let _ = self.pause_tx.send(false);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.running.store(false, Ordering::SeqCst);
        info!("download pipeline stopped");
        self.observer.on_complete();
    }

    /// Wait for the pipeline to drain on its own.
    pub async fn join(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let mut finished = self.finished_tx.subscribe();
        let _ = finished.wait_for(|done| *done).await;

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Current snapshot, assembled on demand.
    pub fn get_stats(&self) -> Result<DownloadStats, StoreError> {
        let collection = self.collection.lock().unwrap().clone();
        let (id, first, last) = match &collection {
            Some(config) => (config.id, config.first_id, config.last_id),
            None => (0, 0, 0),
        };
        let store_stats = self.store.get_stats(id)?;
        Ok(DownloadStats::assemble(
            id,
            &store_stats,
            &self.counters,
            first,
            last,
        ))
    }

    // -------------------------------------------------------------------------
    // Configuration, live-tunable
    // -------------------------------------------------------------------------

    /// While set, the scheduler never terminates on an empty queue; it waits
    /// for the external source to feed more rows.
    pub fn set_external_scraping_active(&self, active: bool) {
        self.external_scraping.store(active, Ordering::SeqCst);
    }

    /// Adjust the worker cap; takes effect on the next dispatch iteration.
    pub fn set_max_concurrent_downloads(&self, max: usize) {
        self.max_concurrent
            .store(max.clamp(1, MAX_CONCURRENT_DOWNLOADS), Ordering::SeqCst);
    }

    pub fn set_max_retries(&self, retries: i32) {
        self.max_retries.store(retries.max(0), Ordering::SeqCst);
    }

    pub fn set_overwrite_existing(&self, overwrite: bool) {
        self.overwrite_existing.store(overwrite, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Queue maintenance
    // -------------------------------------------------------------------------

    /// Stage rows on behalf of an external (e.g. browser-based) scraper.
    pub fn queue_documents(&self, records: &[DocumentRecord]) -> Result<usize, StoreError> {
        self.store.bulk_insert_or_ignore(records)
    }

    /// Recover rows a previous run left IN_PROGRESS.
    pub fn reset_interrupted(&self, collection: u32) -> Result<usize, StoreError> {
        self.store.reset_in_progress(collection)
    }

    /// Re-queue FAILED rows immediately, keeping their retry history.
    pub fn retry_failed(&self, collection: u32) -> Result<usize, StoreError> {
        self.store.reset_failed(collection)
    }

    /// Reset the whole collection to PENDING for a redownload.
    pub fn reset_all(&self, collection: u32) -> Result<usize, StoreError> {
        self.store.reset_all(collection)
    }

    /// Delete every record of a collection.
    pub fn clear_collection(&self, collection: u32) -> Result<usize, StoreError> {
        self.store.clear_collection(collection)
    }

    /// Whether the store already knows any documents for this collection.
    pub fn has_pending_work(&self, collection: u32) -> Result<bool, StoreError> {
        self.store.has_pending_work(collection)
    }

    // -------------------------------------------------------------------------
    // Task plumbing
    // -------------------------------------------------------------------------

    fn pause_gate(&self) -> PauseGate {
        PauseGate::new(self.pause_tx.subscribe())
    }

    fn spawn_index_producer(&self, collection: &CollectionConfig) -> JoinHandle<()> {
        let scraper = Arc::new(IndexScraper::new(collection));
        let store = self.store.clone();
        let fetcher = self.fetcher.clone();
        let root = self.download_root.clone();
        let pause = self.pause_gate();
        let cancel = self.cancel.clone();
        let observer = self.observer.clone();
        let producers_active = self.producers_active.clone();

        producers_active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result =
                run_index_producer(scraper, store, fetcher, root, pause, cancel, observer).await;
            if let Err(e) = result {
                error!(error = %e, "index producer stopped early");
            }
            producers_active.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn spawn_brute_force_producer(&self, collection: &CollectionConfig) -> JoinHandle<()> {
        let config = collection.clone();
        let store = self.store.clone();
        let root = self.download_root.clone();
        let pause = self.pause_gate();
        let cancel = self.cancel.clone();
        let observer = self.observer.clone();
        let producers_active = self.producers_active.clone();

        producers_active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = run_brute_force(config, store, root, pause, cancel).await;
            if let Err(e) = result {
                error!(error = %e, "brute force producer stopped early");
                observer.on_error(&format!("brute force enumeration failed: {e}"));
            }
            producers_active.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn spawn_stats_publisher(&self, collection: &CollectionConfig) -> JoinHandle<()> {
        let store = self.store.clone();
        let observer = self.observer.clone();
        let counters = self.counters.clone();
        let cookie_jar = self.cookie_jar.clone();
        let cancel = self.cancel.clone();
        let mut finished = self.finished_tx.subscribe();
        let collection_id = collection.id;
        let brute_start = collection.first_id;
        let brute_end = collection.last_id;

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = finished.wait_for(|done| *done) => break,
                    _ = tick.tick() => {}
                }
                if let Some(jar) = &cookie_jar {
                    jar.sweep_expired();
                }
                match store.get_stats(collection_id) {
                    Ok(store_stats) => {
                        let stats = DownloadStats::assemble(
                            collection_id,
                            &store_stats,
                            &counters,
                            brute_start,
                            brute_end,
                        );
                        observer.on_stats(&stats);
                    }
                    Err(e) => warn!(error = %e, "stats snapshot failed"),
                }
            }
        })
    }

    fn spawn_dispatcher(&self, collection: &CollectionConfig) -> JoinHandle<()> {
        let ctx = Arc::new(SchedulerCtx {
            store: self.store.clone(),
            fetcher: self.fetcher.clone(),
            observer: self.observer.clone(),
            cookie_jar: self.cookie_jar.clone(),
            collection: collection.id,
            counters: self.counters.clone(),
            max_concurrent: self.max_concurrent.clone(),
            max_retries: self.max_retries.clone(),
            overwrite_existing: self.overwrite_existing.clone(),
            external_scraping: self.external_scraping.clone(),
            producers_active: self.producers_active.clone(),
            cancel: self.cancel.clone(),
            pause: self.pause_gate(),
        });
        let observer = self.observer.clone();
        let running = self.running.clone();
        let finished_tx = self.finished_tx.clone();

        tokio::spawn(async move {
            let drained = scheduler::run_dispatcher(ctx).await;
            running.store(false, Ordering::SeqCst);
            let _ = finished_tx.send(true);
            if drained {
                observer.on_complete();
            }
        })
    }
}
