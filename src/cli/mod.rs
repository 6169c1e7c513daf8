//! Command-line front-end.
//!
//! A thin collaborator around the download manager: parse flags, open the
//! store, wire cookies, recover interrupted rows, then print a status line
//! until the pipeline drains or the operator interrupts.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use console::style;
use tokio_util::sync::CancellationToken;

use crate::config::{
    AGE_GATE_COOKIE, CollectionConfig, DEFAULT_CONCURRENT_DOWNLOADS, MAX_DATA_SET,
    MAX_RETRY_ATTEMPTS, MIN_DATA_SET,
};
use crate::fetcher::{CookieJar, CookieProvider, HttpFetcher};
use crate::models::DownloadStatus;
use crate::observer::DownloadObserver;
use crate::repository::DocumentStore;
use crate::services::download::{
    DownloadManager, DownloadStats, ManagerOptions, Mode,
};

#[derive(Parser)]
#[command(name = "massfetch")]
#[command(about = "Resumable mass-fetcher for disclosure-site document collections")]
#[command(version)]
pub struct Cli {
    /// Data set number to download (1-12)
    #[arg(short = 'd', long, default_value_t = 11)]
    data_set: u32,

    /// Discovery mode: scraper, brute, or hybrid
    #[arg(short, long, default_value = "scraper")]
    mode: String,

    /// Output directory for the download tree
    #[arg(short, long, default_value = "downloads")]
    output: PathBuf,

    /// Netscape-format cookie file
    #[arg(short = 'k', long)]
    cookies: Option<PathBuf>,

    /// Literal Cookie header value
    #[arg(long)]
    cookie_string: Option<String>,

    /// Max concurrent downloads (1-500)
    #[arg(short, long, default_value_t = DEFAULT_CONCURRENT_DOWNLOADS)]
    concurrent: usize,

    /// Max retry attempts per document
    #[arg(short, long, default_value_t = MAX_RETRY_ATTEMPTS)]
    retries: i32,

    /// Brute force start identifier (overrides the known range)
    #[arg(short, long)]
    start: Option<u64>,

    /// Brute force end identifier (overrides the known range)
    #[arg(short, long)]
    end: Option<u64>,

    /// State database path
    #[arg(long, default_value = "massfetch.db")]
    db: PathBuf,

    /// Refetch documents whose file already exists locally
    #[arg(long)]
    overwrite: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

/// Observer backing the console front-end: keeps the latest snapshot for the
/// status line and surfaces errors immediately.
#[derive(Default)]
struct ConsoleObserver {
    last_stats: Mutex<Option<DownloadStats>>,
}

impl DownloadObserver for ConsoleObserver {
    fn on_stats(&self, stats: &DownloadStats) {
        *self.last_stats.lock().unwrap() = Some(*stats);
    }

    fn on_status_change(&self, document_id: &str, status: DownloadStatus) {
        if status == DownloadStatus::Failed {
            tracing::debug!(document_id, "download failed");
        }
    }

    fn on_complete(&self) {
        println!("\n{} download complete", style("[+]").green().bold());
    }

    fn on_error(&self, error: &str) {
        eprintln!("\n{} {error}", style("[!]").red().bold());
    }
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if !(MIN_DATA_SET..=MAX_DATA_SET).contains(&cli.data_set) {
        anyhow::bail!(
            "data set must be between {MIN_DATA_SET} and {MAX_DATA_SET}, got {}",
            cli.data_set
        );
    }
    let mode: Mode = cli
        .mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let mut collection = CollectionConfig::for_data_set(cli.data_set);
    if let Some(start) = cli.start {
        collection.first_id = start;
    }
    if let Some(end) = cli.end {
        collection.last_id = end;
    }

    std::fs::create_dir_all(&cli.output)?;
    let store = Arc::new(DocumentStore::new(&cli.db)?);

    // Cookie supply: jar (captured Set-Cookie headers land here), then
    // literal string, then cookie file. The age-gate cookie is the default
    // when the operator supplies nothing.
    let jar = Arc::new(CookieJar::new());
    let literal = cli.cookie_string.clone().or_else(|| {
        cli.cookies
            .is_none()
            .then(|| AGE_GATE_COOKIE.to_string())
    });
    let mut cookie_provider = CookieProvider::new(jar.clone(), literal);
    if let Some(path) = &cli.cookies {
        cookie_provider = cookie_provider.with_cookie_file(path)?;
        println!("Using cookies from {}", path.display());
    }

    let cancel = CancellationToken::new();
    let fetcher = Arc::new(HttpFetcher::new(cookie_provider, cancel.clone())?);
    let observer = Arc::new(ConsoleObserver::default());

    let options = ManagerOptions {
        download_root: cli.output.clone(),
        max_concurrent: cli.concurrent,
        max_retries: cli.retries,
        overwrite_existing: cli.overwrite,
    };
    let manager = DownloadManager::new(
        store,
        fetcher,
        observer.clone(),
        cancel.clone(),
        options,
    )
    .with_cookie_jar(jar);

    // Rows left IN_PROGRESS by a killed run are re-queued up front.
    let recovered = manager.reset_interrupted(collection.id)?;
    if recovered > 0 {
        println!("Recovered {recovered} interrupted downloads");
    }

    println!("{}", style("=== massfetch ===").bold());
    println!("Data set:   {}", collection.name);
    println!("Mode:       {}", cli.mode);
    println!("Output:     {}", cli.output.display());
    println!("Concurrent: {}", cli.concurrent);
    if mode != Mode::Scraper && collection.first_id > 0 && collection.last_id > 0 {
        println!(
            "Range:      {} - {}",
            collection.document_id(collection.first_id),
            collection.document_id(collection.last_id)
        );
    }
    println!();

    manager.start(collection.clone(), mode);

    let mut status_tick = tokio::time::interval(Duration::from_secs(5));
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    status_tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                println!("\n{} interrupt received, stopping gracefully...", style("[!]").yellow());
                manager.stop().await;
                break;
            }
            _ = manager.join() => break,
            _ = status_tick.tick() => {
                if let Ok(stats) = manager.get_stats() {
                    print_status_line(&stats);
                }
            }
        }
    }

    if let Ok(stats) = manager.get_stats() {
        print_summary(&stats);
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let ctrl_c = tokio::signal::ctrl_c();
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_status_line(stats: &DownloadStats) {
    let total = stats.completed + stats.failed + stats.pending + stats.not_found
        + stats.skipped
        + stats.in_flight as i64;
    let progress = if total > 0 {
        100.0 * stats.completed as f64 / total as f64
    } else {
        0.0
    };
    print!(
        "\r[{:5.1}%] done {} | failed {} | 404 {} | pending {} | active {} | {}/s   ",
        progress,
        stats.completed,
        stats.failed,
        stats.not_found,
        stats.pending,
        stats.in_flight,
        format_bytes(stats.current_speed_bps as u64),
    );
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

fn print_summary(stats: &DownloadStats) {
    println!("\n{}", style("=== Final statistics ===").bold());
    println!("Completed:       {}", stats.completed);
    println!("Failed:          {}", stats.failed);
    println!("Not found (404): {}", stats.not_found);
    println!("Skipped:         {}", stats.skipped);
    println!(
        "Pages scraped:   {}/{}",
        stats.pages_scraped, stats.total_pages
    );
    println!(
        "Downloaded:      {}",
        format_bytes(stats.bytes_this_session)
    );
    if stats.wire_speed_bps > 0.0 {
        println!(
            "Wire speed:      {}/s",
            format_bytes(stats.wire_speed_bps as u64)
        );
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
