//! Index page scraping.
//!
//! The site lists each collection across paginated index pages. The true page
//! count is unknown up front, but requesting an absurdly high page index makes
//! the pagination widget reveal the real last page. When the bot-mitigation
//! layer serves a challenge instead, scraping falls back to walking pages
//! sequentially until the pagination runs out of "next" links.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use scraper::{Html, Selector};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::{CollectionConfig, MAX_CONCURRENT_PAGE_SCRAPES, SITE_ORIGIN};
use crate::fetcher::{FetchError, Fetcher};
use crate::models::DocumentRecord;
use crate::observer::DownloadObserver;
use crate::repository::DocumentStore;
use crate::services::download::PauseGate;

/// Page index used to provoke the pagination widget into revealing the last
/// page.
const MAX_PAGE_PROBE: u32 = 99_999;

/// Consecutive fruitless sweeps tolerated before the producer gives up and
/// reports instead of spinning.
const MAX_STALLED_SWEEPS: u32 = 5;

/// A document link found on an index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfLink {
    pub document_id: String,
    pub url: String,
}

/// Result of probing for the collection's page count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxPageOutcome {
    /// Last page index read from the pagination widget.
    Known(u32),
    /// Page 0 loads normally but the probe gave no count; scrape sequentially.
    Unknown,
    /// Even page 0 trips the challenge heuristics.
    Blocked,
}

/// Heuristics for an interstitial served by the bot-mitigation layer instead
/// of the real page. A suspiciously short body is only ever a challenge
/// signal, never an empty result.
pub fn looks_like_bot_challenge(body: &[u8]) -> bool {
    if body.len() < 1000 {
        return true;
    }
    let text = String::from_utf8_lossy(body).to_lowercase();
    ["just a moment", "access denied", "challenge-platform", "request unsuccessful"]
        .iter()
        .any(|marker| text.contains(marker))
}

/// Extracts document links from one collection's index pages.
pub struct IndexScraper {
    config: CollectionConfig,
    href_re: Regex,
    id_re: Regex,
}

impl IndexScraper {
    pub fn new(config: &CollectionConfig) -> Self {
        // Anchors pointing at a file inside this collection's directory, in
        // either the percent-encoded or literal-space spelling. The trailing
        // slash keeps "DataSet 1" from matching "DataSet 11".
        let href_re = Regex::new(&format!(
            r"(?i)DataSet(?:%20|\s|\+){}/[^\s]*\.pdf$",
            config.id
        ))
        .unwrap();
        let id_re = Regex::new(&format!(
            r"(?i){}(\d{{8}})",
            regex::escape(&config.id_prefix)
        ))
        .unwrap();
        Self {
            config: config.clone(),
            href_re,
            id_re,
        }
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Pull this collection's document links out of an index page, resolved
    /// to absolute URLs and de-duplicated by document identifier.
    pub fn extract_pdf_links(&self, html: &str) -> Vec<PdfLink> {
        let document = Html::parse_document(html);
        let selector = Selector::parse("a[href]").unwrap();

        let mut by_id: BTreeMap<String, PdfLink> = BTreeMap::new();
        for anchor in document.select(&selector) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            if !self.href_re.is_match(href) {
                continue;
            }
            let Some(document_id) = self.extract_document_id(href) else {
                continue;
            };
            let Some(url) = resolve_href(href) else {
                continue;
            };
            by_id
                .entry(document_id.clone())
                .or_insert(PdfLink { document_id, url });
        }
        by_id.into_values().collect()
    }

    /// Canonical document identifier from a URL or filename, if present.
    pub fn extract_document_id(&self, text: &str) -> Option<String> {
        self.id_re
            .captures(text)
            .map(|captures| format!("{}{}", self.config.id_prefix, &captures[1]))
    }

    /// Page index the pagination widget marks as current.
    ///
    /// Read from the active item's `href` `page=` parameter, the same
    /// zero-based index space `page_url` requests in. The human-readable
    /// label is one-indexed and must not be trusted.
    pub fn parse_current_page(&self, html: &str) -> Option<u32> {
        let document = Html::parse_document(html);
        for selector_str in [
            ".pager__item.is-active a",
            ".pager__item--active a",
            "a[aria-current]",
        ] {
            let Ok(selector) = Selector::parse(selector_str) else {
                continue;
            };
            if let Some(anchor) = document.select(&selector).next() {
                let Some(href) = anchor.value().attr("href") else {
                    continue;
                };
                if let Some(page) = page_query_param(href) {
                    return Some(page);
                }
                // An active link without a page parameter is page 0.
                return Some(0);
            }
        }
        None
    }

    /// Whether the pagination offers a page after this one.
    pub fn has_next_page(&self, html: &str) -> bool {
        let document = Html::parse_document(html);
        for selector_str in [".pager__item--next a", "a[rel=\"next\"]"] {
            let Ok(selector) = Selector::parse(selector_str) else {
                continue;
            };
            if document.select(&selector).next().is_some() {
                return true;
            }
        }
        false
    }

    /// Probe for the collection's last page index.
    pub async fn detect_max_page(
        &self,
        fetcher: &dyn Fetcher,
    ) -> Result<MaxPageOutcome, FetchError> {
        let probe = fetcher
            .fetch_page(&self.config.page_url(MAX_PAGE_PROBE))
            .await?;
        if probe.is_success() && !looks_like_bot_challenge(&probe.body) {
            if let Some(last_page) = self.parse_current_page(&probe.text()) {
                return Ok(MaxPageOutcome::Known(last_page));
            }
        }

        // The probe tripped the challenge heuristics or had no readable
        // pagination. Verify the first page loads at all before concluding
        // anything.
        let first = fetcher.fetch_page(&self.config.page_url(0)).await?;
        if first.is_success() && !looks_like_bot_challenge(&first.body) {
            Ok(MaxPageOutcome::Unknown)
        } else {
            Ok(MaxPageOutcome::Blocked)
        }
    }
}

fn resolve_href(href: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    let base = Url::parse(SITE_ORIGIN).ok()?;
    base.join(href).ok().map(String::from)
}

fn page_query_param(href: &str) -> Option<u32> {
    let (_, query) = href.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "page" {
            value.parse().ok()
        } else {
            None
        }
    })
}

/// Index-scraping producer: detect the page count, then keep a bounded pool
/// of page fetches in flight until every page is marked scraped.
#[allow(clippy::too_many_arguments)]
pub async fn run_index_producer(
    scraper: Arc<IndexScraper>,
    store: Arc<DocumentStore>,
    fetcher: Arc<dyn Fetcher>,
    download_root: PathBuf,
    pause: PauseGate,
    cancel: CancellationToken,
    observer: Arc<dyn DownloadObserver>,
) -> anyhow::Result<()> {
    let collection = scraper.config().id;

    let outcome = match scraper.detect_max_page(fetcher.as_ref()).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => return Ok(()),
        Err(e) => {
            observer.on_error(&format!("index probe failed: {e}"));
            return Err(e.into());
        }
    };

    match outcome {
        MaxPageOutcome::Known(last_page) => {
            info!(collection, pages = last_page + 1, "detected index page count");
            store.insert_pages(collection, 0, last_page)?;
            scrape_known_pages(
                &scraper,
                &store,
                &fetcher,
                &download_root,
                &pause,
                &cancel,
                &observer,
            )
            .await
        }
        MaxPageOutcome::Unknown => {
            warn!(collection, "page count unavailable, scraping sequentially");
            scrape_sequentially(
                &scraper,
                &store,
                &fetcher,
                &download_root,
                &pause,
                &cancel,
                &observer,
            )
            .await
        }
        MaxPageOutcome::Blocked => {
            let message = format!(
                "collection {collection}: index pages are behind a bot challenge; \
                 supply fresh cookies from an interactive session"
            );
            observer.on_error(&message);
            anyhow::bail!(message);
        }
    }
}

async fn scrape_known_pages(
    scraper: &Arc<IndexScraper>,
    store: &Arc<DocumentStore>,
    fetcher: &Arc<dyn Fetcher>,
    download_root: &Path,
    pause: &PauseGate,
    cancel: &CancellationToken,
    observer: &Arc<dyn DownloadObserver>,
) -> anyhow::Result<()> {
    let collection = scraper.config().id;
    let mut stalled_sweeps = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        pause.wait(cancel).await;

        let pages = store.list_unscraped_pages(collection, MAX_CONCURRENT_PAGE_SCRAPES)?;
        if pages.is_empty() {
            info!(collection, "all index pages scraped");
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for page in pages {
            let scraper = scraper.clone();
            let store = store.clone();
            let fetcher = fetcher.clone();
            let root = download_root.to_path_buf();
            let cancel = cancel.clone();
            let observer = observer.clone();
            tasks.spawn(async move {
                scrape_one_page(&scraper, &store, fetcher.as_ref(), &root, &cancel, &observer, page)
                    .await
            });
        }
        let mut scraped_any = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(scraped) => scraped_any |= scraped,
                Err(e) => warn!(error = %e, "page scrape task panicked"),
            }
        }

        if scraped_any {
            stalled_sweeps = 0;
        } else {
            stalled_sweeps += 1;
            if stalled_sweeps >= MAX_STALLED_SWEEPS {
                let remaining = store.list_unscraped_pages(collection, i64::MAX as usize)?;
                let message = format!(
                    "collection {collection}: {} index pages keep failing to scrape",
                    remaining.len()
                );
                observer.on_error(&message);
                anyhow::bail!(message);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Fallback when the page count is unknown: walk pages in order until one has
/// no "next" link.
async fn scrape_sequentially(
    scraper: &Arc<IndexScraper>,
    store: &Arc<DocumentStore>,
    fetcher: &Arc<dyn Fetcher>,
    download_root: &Path,
    pause: &PauseGate,
    cancel: &CancellationToken,
    observer: &Arc<dyn DownloadObserver>,
) -> anyhow::Result<()> {
    let collection = scraper.config().id;
    let mut page = 0u32;
    let mut failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        pause.wait(cancel).await;

        store.page_upsert(collection, page)?;
        if let Some(record) = store.page(collection, page)? {
            if record.scraped {
                page += 1;
                continue;
            }
        }

        let url = scraper.config().page_url(page);
        let fetched = match fetcher.fetch_page(&url).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => {
                failures += 1;
                warn!(collection, page, error = %e, "index page fetch failed");
                if failures >= MAX_STALLED_SWEEPS {
                    observer.on_error(&format!(
                        "collection {collection}: page {page} keeps failing: {e}"
                    ));
                    anyhow::bail!(e);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if !fetched.is_success() || looks_like_bot_challenge(&fetched.body) {
            let message = format!(
                "collection {collection}: page {page} answered HTTP {} mid-scrape",
                fetched.http_code
            );
            observer.on_error(&message);
            anyhow::bail!(message);
        }
        failures = 0;

        let html = fetched.text();
        stage_page_links(scraper, store, download_root, observer, page, &html)?;

        if !scraper.has_next_page(&html) {
            info!(collection, pages = page + 1, "reached the last index page");
            return Ok(());
        }
        page += 1;
    }
}

/// Scrape one index page; true when the page got marked scraped.
async fn scrape_one_page(
    scraper: &IndexScraper,
    store: &DocumentStore,
    fetcher: &dyn Fetcher,
    download_root: &Path,
    cancel: &CancellationToken,
    observer: &Arc<dyn DownloadObserver>,
    page: u32,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    let collection = scraper.config().id;
    let url = scraper.config().page_url(page);

    let fetched = match fetcher.fetch_page(&url).await {
        Ok(fetched) => fetched,
        Err(e) if e.is_cancelled() => return false,
        Err(e) => {
            warn!(collection, page, error = %e, "index page fetch failed");
            return false;
        }
    };

    if !fetched.is_success() {
        warn!(collection, page, code = fetched.http_code, "index page not served");
        return false;
    }
    if looks_like_bot_challenge(&fetched.body) {
        warn!(collection, page, "index page answered with a bot challenge");
        return false;
    }

    match stage_page_links(scraper, store, download_root, observer, page, &fetched.text()) {
        Ok(()) => true,
        Err(e) => {
            warn!(collection, page, error = %e, "failed to record scraped page");
            false
        }
    }
}

/// Stage a page's links as PENDING rows and mark the page scraped.
fn stage_page_links(
    scraper: &IndexScraper,
    store: &DocumentStore,
    download_root: &Path,
    observer: &Arc<dyn DownloadObserver>,
    page: u32,
    html: &str,
) -> anyhow::Result<()> {
    let config = scraper.config();
    let links = scraper.extract_pdf_links(html);
    let records: Vec<DocumentRecord> = links
        .iter()
        .map(|link| {
            DocumentRecord::pending(
                config.id,
                &link.document_id,
                &link.url,
                config.local_path(download_root, &link.document_id),
            )
        })
        .collect();

    store.bulk_insert_or_ignore(&records)?;
    store.mark_page_scraped(config.id, page, links.len() as i64)?;
    observer.on_page_scraped(page, links.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectionConfig;

    fn scraper_for(id: u32) -> IndexScraper {
        IndexScraper::new(&CollectionConfig::for_data_set(id))
    }

    #[test]
    fn absolute_urls_pass_through() {
        let html = r#"<a href="https://www.justice.gov/epstein/files/DataSet%2011/EFTA02205655.pdf">Link</a>"#;
        let links = scraper_for(11).extract_pdf_links(html);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].document_id, "EFTA02205655");
        assert_eq!(
            links[0].url,
            "https://www.justice.gov/epstein/files/DataSet%2011/EFTA02205655.pdf"
        );
    }

    #[test]
    fn root_relative_urls_resolve_against_the_origin() {
        let html = r#"<a href="/epstein/files/DataSet%2011/EFTA02205655.pdf">Link</a>"#;
        let links = scraper_for(11).extract_pdf_links(html);
        assert_eq!(links.len(), 1);
        assert_eq!(
            links[0].url,
            "https://www.justice.gov/epstein/files/DataSet%2011/EFTA02205655.pdf"
        );
    }

    #[test]
    fn path_relative_urls_resolve_against_the_origin() {
        let html = r#"<a href="epstein/files/DataSet%2011/EFTA02205655.pdf">Link</a>"#;
        let links = scraper_for(11).extract_pdf_links(html);
        assert_eq!(links.len(), 1);
        assert_eq!(
            links[0].url,
            "https://www.justice.gov/epstein/files/DataSet%2011/EFTA02205655.pdf"
        );
    }

    #[test]
    fn literal_space_variant_is_accepted_and_encoded() {
        let html = r#"<a href="/epstein/files/DataSet 11/EFTA02205655.pdf">Link</a>"#;
        let links = scraper_for(11).extract_pdf_links(html);
        assert_eq!(links.len(), 1);
        assert_eq!(
            links[0].url,
            "https://www.justice.gov/epstein/files/DataSet%2011/EFTA02205655.pdf"
        );
    }

    #[test]
    fn other_collections_are_filtered_out() {
        let html = r#"
            <a href="/epstein/files/DataSet%2011/EFTA02205655.pdf">mine</a>
            <a href="/epstein/files/DataSet%2012/EFTA02730265.pdf">theirs</a>
        "#;
        let links = scraper_for(11).extract_pdf_links(html);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].document_id, "EFTA02205655");
    }

    #[test]
    fn collection_one_does_not_swallow_eleven() {
        let html = r#"<a href="/epstein/files/DataSet%2011/EFTA02205655.pdf">Link</a>"#;
        assert!(scraper_for(1).extract_pdf_links(html).is_empty());
    }

    #[test]
    fn duplicates_collapse_by_document_id() {
        let html = r#"
            <a href="/epstein/files/DataSet%2011/EFTA02205655.pdf">one</a>
            <a href="https://www.justice.gov/epstein/files/DataSet%2011/EFTA02205655.pdf">again</a>
        "#;
        let links = scraper_for(11).extract_pdf_links(html);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn short_bodies_read_as_bot_challenge() {
        assert!(looks_like_bot_challenge(b"<html>blocked</html>"));
    }

    #[test]
    fn challenge_markers_read_as_bot_challenge() {
        let padding = "x".repeat(2000);
        let body = format!("<html>{padding}<h1>Access Denied</h1></html>");
        assert!(looks_like_bot_challenge(body.as_bytes()));
    }

    #[test]
    fn ordinary_long_pages_are_not_challenges() {
        let padding = "x".repeat(2000);
        let body = format!("<html>{padding}<a href='x.pdf'>doc</a></html>");
        assert!(!looks_like_bot_challenge(body.as_bytes()));
    }

    #[test]
    fn current_page_comes_from_the_active_href_not_its_label() {
        // The pager renders one-indexed labels over zero-indexed page= query
        // params; only the href is in the index space we request in.
        let html = r#"
            <ul class="pager">
                <li class="pager__item"><a href="?page=410">411</a></li>
                <li class="pager__item is-active"><a href="?page=411">Page 412</a></li>
            </ul>
        "#;
        assert_eq!(scraper_for(11).parse_current_page(html), Some(411));
    }

    #[test]
    fn current_page_handles_extra_query_params() {
        let html = r#"
            <li class="pager__item is-active">
                <a href="/epstein/doj-disclosures/data-set-11-files?order=asc&page=37">Page 38</a>
            </li>
        "#;
        assert_eq!(scraper_for(11).parse_current_page(html), Some(37));
    }

    #[test]
    fn active_link_without_page_param_is_page_zero() {
        let html = r#"
            <li class="pager__item is-active">
                <a href="/epstein/doj-disclosures/data-set-11-files">Page 1</a>
            </li>
        "#;
        assert_eq!(scraper_for(11).parse_current_page(html), Some(0));
    }

    #[test]
    fn page_without_a_pager_yields_no_current_page() {
        assert_eq!(scraper_for(11).parse_current_page("<html><body/></html>"), None);
    }

    #[test]
    fn next_link_detection() {
        let with_next = r#"<li class="pager__item--next"><a href="?page=1">Next</a></li>"#;
        let without = r#"<li class="pager__item">1</li>"#;
        let scraper = scraper_for(11);
        assert!(scraper.has_next_page(with_next));
        assert!(!scraper.has_next_page(without));
    }
}
