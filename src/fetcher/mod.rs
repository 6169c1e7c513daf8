//! Single-transfer HTTP fetching.
//!
//! A [`Fetcher`] performs one logical transfer: an index page into memory, a
//! document onto disk, or a bare existence probe. The production
//! [`HttpFetcher`] speaks to the origin through reqwest; tests substitute a
//! scripted implementation behind the same trait.

pub mod cookies;
mod http;

pub use cookies::{Cookie, CookieJar, CookieProvider};
pub use http::HttpFetcher;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single transfer.
///
/// HTTP status codes are not errors at this layer; any response, including
/// 404s and bot-mitigation refusals, comes back as a result carrying the code
/// for the caller to classify.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connect, TLS, protocol, or timeout failure.
    #[error("{0}")]
    Network(String),
    /// Throughput stayed below 1 KiB/s for over 10 s.
    #[error("transfer stalled (below 1 KiB/s for 10s)")]
    Stalled,
    /// The body length did not match the declared Content-Length.
    #[error("size mismatch (expected {expected}, got {got})")]
    SizeMismatch { expected: u64, got: u64 },
    /// The shared cancellation signal fired mid-transfer.
    #[error("cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

/// An index page fetched into memory.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub http_code: u16,
    pub body: Vec<u8>,
    pub declared_length: Option<u64>,
    pub content_type: Option<String>,
    /// Set-Cookie headers captured from the response, for jar folding.
    pub set_cookies: Vec<String>,
    /// Wire time of the transfer.
    pub wall_time: Duration,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_code)
    }

    /// Body as text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A document transferred onto disk.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub http_code: u16,
    /// Bytes written to the destination; 0 when the response was not 2xx.
    pub bytes_written: u64,
    pub declared_length: Option<u64>,
    pub content_type: Option<String>,
    pub set_cookies: Vec<String>,
    pub wall_time: Duration,
}

impl FetchedFile {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_code)
    }
}

/// One logical HTTP transfer with timeout, cancellation, and size checking.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch an index page into memory.
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;

    /// Stream a document to `dest`. The destination's parent directory must
    /// exist. No partial file of nonzero length survives any failure path.
    async fn fetch_file(&self, url: &str, dest: &Path) -> Result<FetchedFile, FetchError>;

    /// HEAD-equivalent existence check; returns the status code.
    async fn probe(&self, url: &str) -> Result<u16, FetchError>;
}
