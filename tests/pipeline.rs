//! End-to-end pipeline tests against a scripted fetcher.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use massfetch::config::CollectionConfig;
use massfetch::fetcher::{FetchError, FetchedFile, FetchedPage, Fetcher};
use massfetch::models::{DocumentRecord, DownloadStatus};
use massfetch::observer::DownloadObserver;
use massfetch::repository::{retry_delay, DocumentStore};
use massfetch::services::download::{DownloadManager, ManagerOptions, Mode};

/// One scripted answer for a document URL.
#[derive(Clone)]
enum Scripted {
    Http {
        code: u16,
        body: Vec<u8>,
        declared: Option<u64>,
    },
    NetError(String),
}

impl Scripted {
    fn ok_pdf(size: usize) -> Self {
        Scripted::Http {
            code: 200,
            body: vec![0x25; size],
            declared: Some(size as u64),
        }
    }

    fn status(code: u16) -> Self {
        Scripted::Http {
            code,
            body: Vec::new(),
            declared: None,
        }
    }
}

/// Fetcher double: scripted per-URL responses, invocation counting, and an
/// in-flight high-water mark.
struct StubFetcher {
    file_scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    file_default: Scripted,
    page_scripts: Mutex<HashMap<String, Scripted>>,
    file_calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    transfer_delay: Duration,
}

impl StubFetcher {
    fn new(file_default: Scripted) -> Self {
        Self {
            file_scripts: Mutex::new(HashMap::new()),
            file_default,
            page_scripts: Mutex::new(HashMap::new()),
            file_calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            transfer_delay: Duration::ZERO,
        }
    }

    fn with_transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = delay;
        self
    }

    /// Queue scripted responses for one URL; once drained, the default
    /// applies again.
    fn script_file(&self, url: &str, responses: impl IntoIterator<Item = Scripted>) {
        self.file_scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(responses);
    }

    fn script_page(&self, url: &str, response: Scripted) {
        self.page_scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    fn calls_for(&self, url: &str) -> usize {
        self.file_calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn all_calls(&self) -> HashMap<String, usize> {
        self.file_calls.lock().unwrap().clone()
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_file_script(&self, url: &str) -> Scripted {
        let mut scripts = self.file_scripts.lock().unwrap();
        scripts
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.file_default.clone())
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let script = self
            .page_scripts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Scripted::status(404));
        match script {
            Scripted::Http { code, body, declared } => Ok(FetchedPage {
                http_code: code,
                declared_length: declared,
                content_type: Some("text/html".into()),
                set_cookies: Vec::new(),
                wall_time: Duration::from_millis(5),
                body,
            }),
            Scripted::NetError(message) => Err(FetchError::Network(message)),
        }
    }

    async fn fetch_file(&self, url: &str, dest: &Path) -> Result<FetchedFile, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.transfer_delay.is_zero() {
            tokio::time::sleep(self.transfer_delay).await;
        }
        *self
            .file_calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        let script = self.next_file_script(url);
        let result = match script {
            Scripted::Http { code, body, declared } => {
                let mut bytes_written = 0u64;
                if (200..300).contains(&code) {
                    tokio::fs::write(dest, &body).await?;
                    bytes_written = body.len() as u64;
                    if let Some(expected) = declared {
                        if expected > 0 && bytes_written != expected {
                            let _ = tokio::fs::remove_file(dest).await;
                            self.in_flight.fetch_sub(1, Ordering::SeqCst);
                            return Err(FetchError::SizeMismatch {
                                expected,
                                got: bytes_written,
                            });
                        }
                    }
                }
                Ok(FetchedFile {
                    http_code: code,
                    bytes_written,
                    declared_length: declared,
                    content_type: Some("application/pdf".into()),
                    set_cookies: Vec::new(),
                    wall_time: Duration::from_millis(10),
                })
            }
            Scripted::NetError(message) => Err(FetchError::Network(message)),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn probe(&self, _url: &str) -> Result<u16, FetchError> {
        Ok(200)
    }
}

/// Observer double recording status transitions and errors.
#[derive(Default)]
struct TestObserver {
    events: Mutex<Vec<(String, DownloadStatus)>>,
    errors: Mutex<Vec<String>>,
}

impl DownloadObserver for TestObserver {
    fn on_status_change(&self, document_id: &str, status: DownloadStatus) {
        self.events
            .lock()
            .unwrap()
            .push((document_id.to_string(), status));
    }

    fn on_error(&self, error: &str) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

impl TestObserver {
    fn ids_with_status(&self, status: DownloadStatus) -> HashSet<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

struct TestWorld {
    _dir: TempDir,
    root: PathBuf,
    db_path: PathBuf,
    store: Arc<DocumentStore>,
    fetcher: Arc<StubFetcher>,
    observer: Arc<TestObserver>,
}

impl TestWorld {
    fn new(fetcher: StubFetcher) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("downloads");
        std::fs::create_dir_all(&root).unwrap();
        let db_path = dir.path().join("state.db");
        let store = Arc::new(DocumentStore::new(&db_path).unwrap());
        Self {
            root,
            db_path,
            store,
            fetcher: Arc::new(fetcher),
            observer: Arc::new(TestObserver::default()),
            _dir: dir,
        }
    }

    fn manager(&self, max_concurrent: usize) -> (DownloadManager, CancellationToken) {
        let cancel = CancellationToken::new();
        let options = ManagerOptions {
            download_root: self.root.clone(),
            max_concurrent,
            max_retries: 3,
            overwrite_existing: false,
        };
        let manager = DownloadManager::new(
            self.store.clone(),
            self.fetcher.clone(),
            self.observer.clone(),
            cancel.clone(),
            options,
        );
        (manager, cancel)
    }

    /// Backdate a row's last update so its backoff window has elapsed.
    fn backdate(&self, collection: u32, document_id: &str, seconds: i64) {
        let conn = rusqlite::Connection::open(&self.db_path).unwrap();
        let past = (chrono::Utc::now() - chrono::Duration::seconds(seconds)).to_rfc3339();
        conn.execute(
            "UPDATE documents SET updated_at = ?1 WHERE collection = ?2 AND document_id = ?3",
            rusqlite::params![past, collection, document_id],
        )
        .unwrap();
    }
}

fn range_collection(first: u64, last: u64) -> CollectionConfig {
    let mut config = CollectionConfig::for_data_set(11);
    config.first_id = first;
    config.last_id = last;
    config
}

async fn run_to_completion(manager: &DownloadManager) {
    tokio::time::timeout(Duration::from_secs(60), manager.join())
        .await
        .expect("pipeline did not drain in time");
}

// -----------------------------------------------------------------------------
// Brute-force end to end
// -----------------------------------------------------------------------------

#[tokio::test]
async fn brute_force_downloads_the_whole_range() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(1024)));
    let collection = range_collection(2_205_655, 2_205_660);
    let (manager, _) = world.manager(8);

    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;

    let stats = world.store.get_stats(11).unwrap();
    assert_eq!(stats.completed, 6);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.failed, 0);

    for n in 2_205_655..=2_205_660u64 {
        let doc_id = collection.document_id(n);
        let record = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Completed);
        assert_eq!(record.file_size, 1024);

        let path = world.root.join(format!("DataSet11/022/{doc_id}.pdf"));
        assert_eq!(record.local_path, path);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
    }
}

#[tokio::test]
async fn missing_documents_mark_not_found_and_leave_no_file() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(1024)));
    let collection = range_collection(2_205_655, 2_205_660);
    let missing = collection.document_id(2_205_657);
    world
        .fetcher
        .script_file(&collection.file_url(&missing), [Scripted::status(404)]);

    let (manager, _) = world.manager(8);
    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;

    let stats = world.store.get_stats(11).unwrap();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.not_found, 1);

    let record = world.store.get_by_document_id(11, &missing).unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::NotFound);
    assert_eq!(record.last_error, "404 Not Found");
    assert!(!record.local_path.exists());
}

#[tokio::test]
async fn server_error_retries_after_backoff_and_succeeds() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(1024)));
    let collection = range_collection(2_205_655, 2_205_655);
    let doc_id = collection.document_id(2_205_655);
    let url = collection.file_url(&doc_id);
    world.fetcher.script_file(&url, [Scripted::status(500)]);

    // First run: the only row fails and the queue drains.
    let (manager, _) = world.manager(4);
    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;

    let record = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.last_error, "HTTP error: 500");
    assert!(world
        .observer
        .ids_with_status(DownloadStatus::Failed)
        .contains(&doc_id));

    // Freshly failed, the row is still inside its backoff window.
    assert!(world.store.list_failed_ready(11, 3, 10).unwrap().is_empty());

    // Once the window elapses, a restarted pipeline picks it up and the
    // scripted stub now answers 200.
    world.backdate(11, &doc_id, 30);
    let (manager, _) = world.manager(4);
    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;

    let record = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert!(record.retry_count >= 1);
    assert_eq!(world.fetcher.calls_for(&url), 2);
    assert_eq!(std::fs::metadata(&record.local_path).unwrap().len(), 1024);
}

#[tokio::test]
async fn declared_length_mismatch_fails_without_a_partial_file() {
    let world = TestWorld::new(StubFetcher::new(Scripted::Http {
        code: 200,
        body: vec![0x25; 1024],
        declared: Some(2048),
    }));
    let collection = range_collection(2_205_655, 2_205_655);
    let doc_id = collection.document_id(2_205_655);

    let (manager, _) = world.manager(4);
    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;

    let record = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert!(record.last_error.contains("size mismatch"));
    assert_eq!(record.retry_count, 1);
    assert!(!record.local_path.exists());
}

#[tokio::test]
async fn blocked_answers_fail_with_a_blocked_diagnostic() {
    let world = TestWorld::new(StubFetcher::new(Scripted::status(403)));
    let collection = range_collection(2_205_655, 2_205_655);
    let doc_id = collection.document_id(2_205_655);

    let (manager, _) = world.manager(4);
    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;

    let record = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert_eq!(record.last_error, "Blocked: HTTP 403");
    assert_eq!(record.retry_count, 1);
}

// -----------------------------------------------------------------------------
// Resume
// -----------------------------------------------------------------------------

#[tokio::test]
async fn interrupted_run_resumes_without_refetching() {
    let fetcher =
        StubFetcher::new(Scripted::ok_pdf(256)).with_transfer_delay(Duration::from_millis(10));
    let world = TestWorld::new(fetcher);
    let collection = range_collection(1, 100);

    // Stage all 100 rows up front so the interruption happens mid-download.
    let records: Vec<DocumentRecord> = (1..=100u64)
        .map(|n| {
            let doc_id = collection.document_id(n);
            DocumentRecord::pending(
                11,
                &doc_id,
                collection.file_url(&doc_id),
                collection.local_path(&world.root, &doc_id),
            )
        })
        .collect();
    world.store.bulk_insert_or_ignore(&records).unwrap();

    let (manager, _) = world.manager(8);
    manager.start_download_only(collection.clone());

    // Interrupt once a good chunk has finished.
    loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let completed = world.store.get_stats(11).unwrap().completed;
        if completed >= 40 {
            break;
        }
    }
    let completed_before_stop = world.observer.ids_with_status(DownloadStatus::Completed);
    manager.stop().await;

    // Explicit recovery, then a fresh session drains the rest.
    world.store.reset_in_progress(11).unwrap();
    let stats = world.store.get_stats(11).unwrap();
    assert_eq!(stats.in_progress, 0);
    assert!(stats.completed >= 40);
    assert_eq!(stats.pending + stats.completed, 100);

    let (manager, _) = world.manager(8);
    manager.start_download_only(collection.clone());
    run_to_completion(&manager).await;

    let stats = world.store.get_stats(11).unwrap();
    assert_eq!(stats.completed, 100);

    // No document was ever transferred twice, and in particular nothing that
    // finished before the interruption was refetched.
    for (url, calls) in world.fetcher.all_calls() {
        assert_eq!(calls, 1, "{url} fetched more than once");
    }
    for doc_id in completed_before_stop {
        let record = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
        assert_eq!(world.fetcher.calls_for(&record.url), 1);
    }
}

// -----------------------------------------------------------------------------
// Backoff
// -----------------------------------------------------------------------------

#[tokio::test]
async fn backoff_windows_grow_between_attempts() {
    let world = TestWorld::new(StubFetcher::new(Scripted::status(403)));
    let collection = range_collection(2_205_655, 2_205_655);
    let doc_id = collection.document_id(2_205_655);

    // Attempt 1.
    let (manager, _) = world.manager(2);
    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;
    let after_first = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
    assert_eq!(after_first.retry_count, 1);

    // Inside the first window: not eligible.
    assert!(world.store.list_failed_ready(11, 3, 10).unwrap().is_empty());
    let first_window = retry_delay(1);

    // Just past the first window: eligible again.
    world.backdate(11, &doc_id, first_window.as_secs() as i64 + 2);
    assert_eq!(world.store.list_failed_ready(11, 3, 10).unwrap().len(), 1);

    // Attempt 2 fails too; the next window must be at least as long.
    let (manager, _) = world.manager(2);
    manager.start_download_only(collection.clone());
    run_to_completion(&manager).await;
    let after_second = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
    assert_eq!(after_second.retry_count, 2);

    let second_window = retry_delay(2);
    assert!(second_window >= first_window);

    // The spacing that elapsed the first window is not enough for the second.
    world.backdate(11, &doc_id, first_window.as_secs() as i64 + 2);
    assert!(world.store.list_failed_ready(11, 3, 10).unwrap().is_empty());
    world.backdate(11, &doc_id, second_window.as_secs() as i64 + 2);
    assert_eq!(world.store.list_failed_ready(11, 3, 10).unwrap().len(), 1);

    // And the retry budget caps eligibility outright.
    assert!(world.store.list_failed_ready(11, 2, 10).unwrap().is_empty());
}

// -----------------------------------------------------------------------------
// Concurrency and skip behavior
// -----------------------------------------------------------------------------

#[tokio::test]
async fn worker_pool_respects_the_concurrency_cap() {
    let fetcher =
        StubFetcher::new(Scripted::ok_pdf(64)).with_transfer_delay(Duration::from_millis(15));
    let world = TestWorld::new(fetcher);
    let collection = range_collection(1, 30);

    let (manager, _) = world.manager(3);
    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;

    assert_eq!(world.store.get_stats(11).unwrap().completed, 30);
    assert!(
        world.fetcher.max_in_flight() <= 3,
        "saw {} concurrent transfers",
        world.fetcher.max_in_flight()
    );
}

#[tokio::test]
async fn existing_files_are_skipped_without_a_fetch() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(1024)));
    let collection = range_collection(2_205_655, 2_205_656);
    let kept = collection.document_id(2_205_655);

    let kept_path = collection.local_path(&world.root, &kept);
    std::fs::create_dir_all(kept_path.parent().unwrap()).unwrap();
    std::fs::write(&kept_path, b"already here").unwrap();

    let (manager, _) = world.manager(4);
    manager.start(collection.clone(), Mode::BruteForce);
    run_to_completion(&manager).await;

    let record = world.store.get_by_document_id(11, &kept).unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Skipped);
    assert_eq!(world.fetcher.calls_for(&collection.file_url(&kept)), 0);
    // The pre-existing file is untouched.
    assert_eq!(std::fs::read(&kept_path).unwrap(), b"already here");

    let other = collection.document_id(2_205_656);
    let record = world.store.get_by_document_id(11, &other).unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn pause_holds_dispatch_until_resume() {
    let fetcher =
        StubFetcher::new(Scripted::ok_pdf(64)).with_transfer_delay(Duration::from_millis(5));
    let world = TestWorld::new(fetcher);
    let collection = range_collection(1, 40);

    let (manager, _) = world.manager(2);
    manager.start(collection.clone(), Mode::BruteForce);
    tokio::time::sleep(Duration::from_millis(30)).await;

    manager.pause();
    assert!(manager.is_paused());
    // Let in-flight transfers land, then confirm dispatch has stopped.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let during_pause = world.store.get_stats(11).unwrap().completed;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(world.store.get_stats(11).unwrap().completed, during_pause);
    assert!(manager.is_running());

    manager.resume();
    run_to_completion(&manager).await;
    assert_eq!(world.store.get_stats(11).unwrap().completed, 40);
}

// -----------------------------------------------------------------------------
// External scraping flag
// -----------------------------------------------------------------------------

#[tokio::test]
async fn external_scraping_keeps_the_scheduler_alive() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(128)));
    let collection = range_collection(0, 0);
    let (manager, _) = world.manager(4);

    manager.set_external_scraping_active(true);
    manager.start_download_only(collection.clone());

    // Empty queue, but the external flag holds the scheduler open.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(manager.is_running());

    // The external source feeds rows, then signals it is done.
    let doc_id = collection.document_id(42);
    manager
        .queue_documents(&[DocumentRecord::pending(
            11,
            &doc_id,
            collection.file_url(&doc_id),
            collection.local_path(&world.root, &doc_id),
        )])
        .unwrap();
    manager.set_external_scraping_active(false);

    run_to_completion(&manager).await;
    let record = world.store.get_by_document_id(11, &doc_id).unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
}

// -----------------------------------------------------------------------------
// Index scraping end to end
// -----------------------------------------------------------------------------

fn pager_html(links: &[(u32, u64)], current: Option<u32>, has_next: bool) -> String {
    let padding = "<!-- padding -->".repeat(100);
    let mut html = format!("<html><body>{padding}<ul>");
    for (set, n) in links {
        html.push_str(&format!(
            r#"<li><a href="/epstein/files/DataSet%20{set}/EFTA{n:08}.pdf">EFTA{n:08}</a></li>"#
        ));
    }
    html.push_str("</ul><nav class=\"pager\">");
    if let Some(page) = current {
        // Drupal-style pager: zero-indexed page= param, one-indexed label.
        html.push_str(&format!(
            r#"<li class="pager__item is-active"><a href="?page={page}">Page {label}</a></li>"#,
            label = page + 1
        ));
    }
    if has_next {
        html.push_str(r#"<li class="pager__item--next"><a href="?page=next">Next</a></li>"#);
    }
    html.push_str("</nav></body></html>");
    html
}

fn page_response(html: String) -> Scripted {
    Scripted::Http {
        code: 200,
        declared: Some(html.len() as u64),
        body: html.into_bytes(),
    }
}

#[tokio::test]
async fn index_scrape_discovers_and_downloads_documents() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(512)));
    let collection = CollectionConfig::for_data_set(11);

    // The absurd-page probe answers with the pager marking page 2 current,
    // so pages 0..=2 exist.
    world.fetcher.script_page(
        &collection.page_url(99_999),
        page_response(pager_html(&[], Some(2), false)),
    );
    for page in 0..=2u32 {
        let base = 2_205_655 + (page as u64) * 2;
        world.fetcher.script_page(
            &collection.page_url(page),
            page_response(pager_html(
                &[(11, base), (11, base + 1)],
                Some(page),
                page < 2,
            )),
        );
    }

    let (manager, _) = world.manager(8);
    manager.start(collection.clone(), Mode::Scraper);
    run_to_completion(&manager).await;

    let stats = world.store.get_stats(11).unwrap();
    assert_eq!(stats.total_pages, 3);
    assert_eq!(stats.pages_scraped, 3);
    assert_eq!(stats.files_found, 6);
    assert_eq!(stats.completed, 6);
    assert!(world.store.list_unscraped_pages(11, 10).unwrap().is_empty());

    let record = world
        .store
        .get_by_document_id(11, "EFTA02205659")
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn scraped_pages_are_not_rescraped_on_restart() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(512)));
    let collection = CollectionConfig::for_data_set(11);

    world.fetcher.script_page(
        &collection.page_url(99_999),
        page_response(pager_html(&[], Some(1), false)),
    );
    for page in 0..=1u32 {
        world.fetcher.script_page(
            &collection.page_url(page),
            page_response(pager_html(&[(11, 2_205_655 + page as u64)], Some(page), page < 1)),
        );
    }

    // Mark page 0 as already scraped by a previous run.
    world.store.insert_pages(11, 0, 1).unwrap();
    world.store.mark_page_scraped(11, 0, 1).unwrap();

    let (manager, _) = world.manager(4);
    manager.start(collection.clone(), Mode::Scraper);
    run_to_completion(&manager).await;

    // Page 0's document was never staged (its page was skipped); page 1's is
    // complete.
    assert!(world
        .store
        .get_by_document_id(11, "EFTA02205655")
        .unwrap()
        .is_none());
    let record = world
        .store
        .get_by_document_id(11, "EFTA02205656")
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn bot_challenge_on_every_page_is_surfaced() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(512)));
    let collection = CollectionConfig::for_data_set(11);

    // Both the probe and page 0 answer with a short interstitial.
    let challenge = Scripted::Http {
        code: 200,
        body: b"<html>Access Denied</html>".to_vec(),
        declared: None,
    };
    world
        .fetcher
        .script_page(&collection.page_url(99_999), challenge.clone());
    world
        .fetcher
        .script_page(&collection.page_url(0), challenge);

    let (manager, _) = world.manager(4);
    manager.start(collection.clone(), Mode::Scraper);
    run_to_completion(&manager).await;

    let errors = world.observer.errors();
    assert!(
        errors.iter().any(|e| e.contains("bot challenge")),
        "expected an operator-visible challenge error, got {errors:?}"
    );
}

// -----------------------------------------------------------------------------
// Store idempotence via the manager surface
// -----------------------------------------------------------------------------

#[tokio::test]
async fn queueing_the_same_documents_twice_changes_nothing() {
    let world = TestWorld::new(StubFetcher::new(Scripted::ok_pdf(64)));
    let collection = range_collection(1, 3);
    let (manager, _) = world.manager(2);

    let records: Vec<DocumentRecord> = (1..=3u64)
        .map(|n| {
            let doc_id = collection.document_id(n);
            DocumentRecord::pending(
                11,
                &doc_id,
                collection.file_url(&doc_id),
                collection.local_path(&world.root, &doc_id),
            )
        })
        .collect();

    assert_eq!(manager.queue_documents(&records).unwrap(), 3);
    assert_eq!(manager.queue_documents(&records).unwrap(), 0);
    assert_eq!(world.store.get_stats(11).unwrap().pending, 3);
}
