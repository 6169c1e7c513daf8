//! Collection configuration and shared pipeline constants.
//!
//! Each published data set is a numbered collection of PDF documents with its
//! own index listing and file directory on the disclosure site. Identifier
//! ranges for brute-force enumeration are seeded from the known publication
//! state and can be overridden from the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Origin serving both index pages and document files.
pub const SITE_ORIGIN: &str = "https://www.justice.gov";

/// Lowest published data set number.
pub const MIN_DATA_SET: u32 = 1;
/// Highest published data set number.
pub const MAX_DATA_SET: u32 = 12;

/// Default cap on concurrently running downloads.
pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 50;
/// Hard ceiling for the user-tunable download concurrency.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 500;
/// Cap on concurrently in-flight index page fetches.
pub const MAX_CONCURRENT_PAGE_SCRAPES: usize = 30;
/// Retry budget for failed downloads before they need operator attention.
pub const MAX_RETRY_ATTEMPTS: i32 = 3;

/// Total transfer budget for a document download.
pub const FILE_TIMEOUT: Duration = Duration::from_secs(300);
/// Total transfer budget for an index page fetch.
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for a HEAD existence probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// TCP connect budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The origin refuses to serve documents without this cookie.
pub const AGE_GATE_COOKIE: &str = "justiceGovAgeVerified=true";

/// Browser-like User-Agent; the bot-mitigation layer rejects obvious clients.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One document collection: URL layout plus enumeration range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Data set number.
    pub id: u32,
    /// Human-readable name.
    pub name: String,
    /// Index listing URL (page 0); later pages append `?page=N`.
    pub index_url: String,
    /// Directory URL under which document files live, with trailing slash.
    pub file_url_base: String,
    /// Prefix of every document identifier in this collection.
    pub id_prefix: String,
    /// First numeric identifier for brute-force enumeration (0 = unknown).
    pub first_id: u64,
    /// Last numeric identifier for brute-force enumeration (0 = unknown).
    pub last_id: u64,
}

impl CollectionConfig {
    /// Build the configuration for a published data set.
    ///
    /// Identifier ranges are only pre-seeded where the publication bounds are
    /// known; other sets rely on index scraping or explicit range overrides.
    pub fn for_data_set(id: u32) -> Self {
        let mut config = Self {
            id,
            name: format!("Data Set {id}"),
            index_url: format!("{SITE_ORIGIN}/epstein/doj-disclosures/data-set-{id}-files"),
            file_url_base: format!("{SITE_ORIGIN}/epstein/files/DataSet%20{id}/"),
            id_prefix: "EFTA".to_string(),
            first_id: 0,
            last_id: 0,
        };
        if id == 11 {
            config.first_id = 2_205_655;
            config.last_id = 2_730_262;
        }
        config
    }

    /// Canonical document identifier for a numeric suffix.
    pub fn document_id(&self, number: u64) -> String {
        format!("{}{:08}", self.id_prefix, number)
    }

    /// Absolute URL of a document file.
    pub fn file_url(&self, document_id: &str) -> String {
        format!("{}{}.pdf", self.file_url_base, document_id)
    }

    /// Absolute URL of an index page.
    pub fn page_url(&self, page: u32) -> String {
        if page == 0 {
            self.index_url.clone()
        } else {
            format!("{}?page={page}", self.index_url)
        }
    }

    /// Target path for a document under the download root.
    ///
    /// Files are partitioned into subdirectories keyed by the first three
    /// digits of the numeric suffix so no directory collects more than a few
    /// thousand entries.
    pub fn local_path(&self, root: &Path, document_id: &str) -> PathBuf {
        let prefix_len = self.id_prefix.len();
        let shard = if document_id.len() >= prefix_len + 3 {
            &document_id[prefix_len..prefix_len + 3]
        } else {
            "misc"
        };
        root.join(format!("DataSet{}", self.id))
            .join(shard)
            .join(format!("{document_id}.pdf"))
    }
}
