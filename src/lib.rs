//! massfetch - resumable mass-fetcher for disclosure-site document
//! collections.
//!
//! Given a data set number, the pipeline enumerates every document in the
//! collection (by scraping paginated index listings, by walking a numeric
//! identifier range, or both), downloads each one into a structured local
//! tree, and keeps durable progress in SQLite so an interrupted run resumes
//! without refetching completed work.

pub mod cli;
pub mod config;
pub mod fetcher;
pub mod models;
pub mod observer;
pub mod repository;
pub mod scrapers;
pub mod services;
