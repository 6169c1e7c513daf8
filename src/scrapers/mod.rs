//! Document discovery: index-page scraping and identifier-range enumeration.
//!
//! Producers only populate PENDING rows in the store; whether a staged
//! document actually exists is discovered later by the download workers
//! through the origin's response codes.

mod brute;
mod index;

pub use brute::run_brute_force;
pub use index::{
    looks_like_bot_challenge, run_index_producer, IndexScraper, MaxPageOutcome, PdfLink,
};
