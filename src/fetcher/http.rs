//! Production fetcher over reqwest.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{redirect, Client, Method, RequestBuilder};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::cookies::CookieProvider;
use super::{FetchError, FetchedFile, FetchedPage, Fetcher};
use crate::config::{CONNECT_TIMEOUT, FILE_TIMEOUT, PAGE_TIMEOUT, PROBE_TIMEOUT, USER_AGENT};

/// Window over which throughput is judged.
const STALL_WINDOW: Duration = Duration::from_secs(10);
/// Minimum bytes per window: 1 KiB/s sustained.
const STALL_MIN_BYTES: u64 = 10 * 1024;

/// Dead-connection guard: a transfer must move at least 1 KiB/s, measured
/// over 10-second windows, or it is aborted.
struct StallGuard {
    window_start: Instant,
    window_bytes: u64,
}

impl StallGuard {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    fn record(&mut self, bytes: usize) -> Result<(), FetchError> {
        self.window_bytes += bytes as u64;
        if self.window_start.elapsed() >= STALL_WINDOW {
            if self.window_bytes < STALL_MIN_BYTES {
                return Err(FetchError::Stalled);
            }
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
        Ok(())
    }
}

/// Fetcher speaking real HTTP, with browser-like headers and caller-supplied
/// cookies.
pub struct HttpFetcher {
    client: Client,
    cookies: CookieProvider,
    cancel: CancellationToken,
}

impl HttpFetcher {
    /// Build the fetcher. TLS peer and hostname verification stay on; up to
    /// ten redirects are followed; TCP keepalive probes at 120 s idle / 60 s
    /// interval hold connections open across slow origin responses.
    pub fn new(cookies: CookieProvider, cancel: CancellationToken) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(redirect::Policy::limited(10))
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(Some(Duration::from_secs(120)))
            .tcp_keepalive_interval(Some(Duration::from_secs(60)))
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            client,
            cookies,
            cancel,
        })
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(header) = self.cookies.header_for(url) {
            request = request.header(COOKIE, header);
        }
        request
    }

    /// Await the next body chunk, enforcing cancellation and the stall guard.
    async fn next_chunk(
        &self,
        stream: &mut (impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
    ) -> Result<Option<bytes::Bytes>, FetchError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            next = tokio::time::timeout(STALL_WINDOW, stream.next()) => match next {
                Err(_) => Err(FetchError::Stalled),
                Ok(None) => Ok(None),
                Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
                Ok(Some(Err(e))) => Err(FetchError::Network(e.to_string())),
            },
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let started = Instant::now();
        let response = self
            .request(Method::GET, url)
            .timeout(PAGE_TIMEOUT)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let http_code = response.status().as_u16();
        let set_cookies = capture_set_cookies(response.headers());
        let declared_length = declared_length(response.headers());
        let content_type = content_type(response.headers());

        let mut body = Vec::new();
        let mut guard = StallGuard::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = self.next_chunk(&mut stream).await? {
            guard.record(chunk.len())?;
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            http_code,
            body,
            declared_length,
            content_type,
            set_cookies,
            wall_time: started.elapsed(),
        })
    }

    async fn fetch_file(&self, url: &str, dest: &Path) -> Result<FetchedFile, FetchError> {
        let started = Instant::now();
        let response = self
            .request(Method::GET, url)
            .timeout(FILE_TIMEOUT)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let http_code = response.status().as_u16();
        let set_cookies = capture_set_cookies(response.headers());
        let declared_length = declared_length(response.headers());
        let content_type = content_type(response.headers());

        // Nothing worth writing on a non-2xx answer; the caller classifies
        // the code.
        if !(200..300).contains(&http_code) {
            return Ok(FetchedFile {
                http_code,
                bytes_written: 0,
                declared_length,
                content_type,
                set_cookies,
                wall_time: started.elapsed(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut guard = StallGuard::new();
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        let copy_result: Result<(), FetchError> = loop {
            match self.next_chunk(&mut stream).await {
                Ok(Some(chunk)) => {
                    if let Err(e) = guard.record(chunk.len()) {
                        break Err(e);
                    }
                    if let Err(e) = file.write_all(&chunk).await {
                        break Err(e.into());
                    }
                    written += chunk.len() as u64;
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = copy_result {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e);
        }

        if let Err(e) = file.flush().await {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e.into());
        }
        drop(file);

        if let Some(expected) = declared_length {
            if expected > 0 && written != expected {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(FetchError::SizeMismatch {
                    expected,
                    got: written,
                });
            }
        }

        Ok(FetchedFile {
            http_code,
            bytes_written: written,
            declared_length,
            content_type,
            set_cookies,
            wall_time: started.elapsed(),
        })
    }

    async fn probe(&self, url: &str) -> Result<u16, FetchError> {
        let response = self
            .request(Method::HEAD, url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

fn capture_set_cookies(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(String::from))
        .collect()
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_guard_passes_healthy_throughput() {
        let mut guard = StallGuard::new();
        // Well above the floor inside the first window.
        assert!(guard.record(64 * 1024).is_ok());
        assert!(guard.record(64 * 1024).is_ok());
    }

    #[test]
    fn stall_guard_aborts_a_trickle() {
        let mut guard = StallGuard::new();
        // Simulate an elapsed window with almost no data.
        guard.window_start = Instant::now() - Duration::from_secs(11);
        guard.window_bytes = 100;
        assert!(matches!(guard.record(1), Err(FetchError::Stalled)));
    }
}
