//! Document store: the durable work queue behind the download pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, Row, TransactionBehavior};

use super::{connect, parse_datetime, parse_datetime_opt, Result};
use crate::models::{CollectionStats, DocumentRecord, DownloadStatus, PageRecord};

/// Backoff gate for a failed row: how long after its last update it stays
/// ineligible for re-dispatch.
///
/// Sigmoid ramp from ~5 s for the first failures through ~300 s at the fifth,
/// flattening toward 600 s. Keeps transient blips cheap while a persistently
/// blocked origin is not hammered.
pub fn retry_delay(retry_count: i32) -> Duration {
    if retry_count <= 0 {
        return Duration::ZERO;
    }
    let min_delay = 5.0;
    let max_delay = 600.0;
    let midpoint = 5.0;
    let steepness = 1.0;
    let delay = min_delay
        + (max_delay - min_delay)
            / (1.0 + (-steepness * (retry_count as f64 - midpoint)).exp());
    Duration::from_secs_f64(delay)
}

/// SQLite-backed store for document, page, and progress records.
///
/// Holds only the database path; every operation opens its own connection so
/// the store can be shared freely across tasks.
pub struct DocumentStore {
    db_path: PathBuf,
}

impl DocumentStore {
    /// Open (creating if necessary) the store at `db_path`.
    pub fn new(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection INTEGER NOT NULL,
                document_id TEXT NOT NULL,
                url TEXT NOT NULL,
                local_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                file_size INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(collection, document_id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_collection_status
                ON documents(collection, status);

            -- Index page bookkeeping for idempotent scrape resume
            CREATE TABLE IF NOT EXISTS pages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection INTEGER NOT NULL,
                page_index INTEGER NOT NULL,
                scraped INTEGER NOT NULL DEFAULT 0,
                pdf_count INTEGER NOT NULL DEFAULT 0,
                scraped_at TEXT,
                UNIQUE(collection, page_index)
            );

            CREATE INDEX IF NOT EXISTS idx_pages_collection_scraped
                ON pages(collection, scraped);

            -- Brute-force enumeration cursor per collection
            CREATE TABLE IF NOT EXISTS collection_progress (
                collection INTEGER PRIMARY KEY,
                brute_force_cursor INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Document records
    // -------------------------------------------------------------------------

    /// Insert a record unless its (collection, document_id) already exists.
    /// Returns whether a row was actually written.
    pub fn insert_or_ignore(&self, record: &DocumentRecord) -> Result<bool> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO documents (
                collection, document_id, url, local_path, status,
                file_size, retry_count, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.collection,
                record.document_id,
                record.url,
                record.local_path.to_string_lossy(),
                record.status.as_str(),
                record.file_size,
                record.retry_count,
                record.last_error,
                now,
                now,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Insert a batch of records in one transaction, ignoring duplicates.
    /// Returns the number of rows actually written.
    pub fn bulk_insert_or_ignore(&self, records: &[DocumentRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO documents (
                    collection, document_id, url, local_path, status,
                    file_size, retry_count, last_error, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    record.collection,
                    record.document_id,
                    record.url,
                    record.local_path.to_string_lossy(),
                    record.status.as_str(),
                    record.file_size,
                    record.retry_count,
                    record.last_error,
                    now,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Look up a record by row id.
    pub fn get(&self, row_id: i64) -> Result<Option<DocumentRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
        ))?;
        match stmt.query_row(params![row_id], row_to_document) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a record by its unique (collection, document_id) key.
    pub fn get_by_document_id(
        &self,
        collection: u32,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE collection = ? AND document_id = ?"
        ))?;
        match stmt.query_row(params![collection, document_id], row_to_document) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a record exists for this document.
    pub fn exists(&self, collection: u32, document_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ? AND document_id = ?",
            params![collection, document_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Set a row's status, diagnostic, and byte size, refreshing `updated_at`.
    pub fn update_status(
        &self,
        row_id: i64,
        status: DownloadStatus,
        error: &str,
        file_size: i64,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            UPDATE documents SET status = ?1, last_error = ?2, file_size = ?3,
                                 updated_at = ?4
            WHERE id = ?5
            "#,
            params![
                status.as_str(),
                error,
                file_size,
                Utc::now().to_rfc3339(),
                row_id,
            ],
        )?;
        Ok(())
    }

    /// Same as [`update_status`](Self::update_status), keyed by document id.
    pub fn update_status_by_document_id(
        &self,
        collection: u32,
        document_id: &str,
        status: DownloadStatus,
        error: &str,
        file_size: i64,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            UPDATE documents SET status = ?1, last_error = ?2, file_size = ?3,
                                 updated_at = ?4
            WHERE collection = ?5 AND document_id = ?6
            "#,
            params![
                status.as_str(),
                error,
                file_size,
                Utc::now().to_rfc3339(),
                collection,
                document_id,
            ],
        )?;
        Ok(())
    }

    /// Bump a row's retry counter. The counter never decreases.
    pub fn increment_retry(&self, row_id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE documents SET retry_count = retry_count + 1 WHERE id = ?",
            params![row_id],
        )?;
        Ok(())
    }

    /// List up to `limit` PENDING rows, oldest first.
    ///
    /// Rows are not transitioned here; the scheduler marks each IN_PROGRESS
    /// before dispatching it.
    pub fn claim_pending(&self, collection: u32, limit: usize) -> Result<Vec<DocumentRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {DOCUMENT_COLUMNS} FROM documents
            WHERE collection = ? AND status = 'PENDING'
            ORDER BY id ASC
            LIMIT ?
            "#
        ))?;
        let records = stmt
            .query_map(params![collection, limit as i64], row_to_document)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// List FAILED rows under the retry budget whose backoff window elapsed.
    pub fn list_failed_ready(
        &self,
        collection: u32,
        max_retries: i32,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {DOCUMENT_COLUMNS} FROM documents
            WHERE collection = ? AND status = 'FAILED' AND retry_count < ?
            ORDER BY updated_at ASC
            LIMIT ?
            "#
        ))?;
        let candidates = stmt
            .query_map(
                params![collection, max_retries, limit as i64],
                row_to_document,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let now = Utc::now();
        Ok(candidates
            .into_iter()
            .filter(|record| {
                let ready_at = record.updated_at
                    + chrono::Duration::from_std(retry_delay(record.retry_count))
                        .unwrap_or_else(|_| chrono::Duration::seconds(600));
                now >= ready_at
            })
            .collect())
    }

    /// Recover rows a previous run left IN_PROGRESS. Returns the count reset.
    pub fn reset_in_progress(&self, collection: u32) -> Result<usize> {
        self.reset_where(collection, "status = 'IN_PROGRESS'")
    }

    /// Make FAILED rows eligible again, keeping their retry history.
    pub fn reset_failed(&self, collection: u32) -> Result<usize> {
        self.reset_where(collection, "status = 'FAILED'")
    }

    /// Reset every row of a collection to PENDING for a full redownload.
    pub fn reset_all(&self, collection: u32) -> Result<usize> {
        self.reset_where(collection, "status != 'PENDING'")
    }

    fn reset_where(&self, collection: u32, predicate: &str) -> Result<usize> {
        let conn = self.connect()?;
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE documents SET status = 'PENDING', last_error = '',
                                     file_size = 0, updated_at = ?1
                WHERE collection = ?2 AND {predicate}
                "#
            ),
            params![Utc::now().to_rfc3339(), collection],
        )?;
        Ok(changed)
    }

    /// Drop every record belonging to a collection. Returns documents removed.
    pub fn clear_collection(&self, collection: u32) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM documents WHERE collection = ?",
            params![collection],
        )?;
        tx.execute("DELETE FROM pages WHERE collection = ?", params![collection])?;
        tx.execute(
            "DELETE FROM collection_progress WHERE collection = ?",
            params![collection],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Whether any records exist for this collection.
    pub fn has_pending_work(&self, collection: u32) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?",
            params![collection],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Aggregate counts for a collection.
    pub fn get_stats(&self, collection: u32) -> Result<CollectionStats> {
        let conn = self.connect()?;
        let mut stats = CollectionStats::default();

        let (total_pages, pages_scraped, files_found) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN scraped = 1 THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(pdf_count), 0)
            FROM pages WHERE collection = ?
            "#,
            params![collection],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;
        stats.total_pages = total_pages;
        stats.pages_scraped = pages_scraped;
        stats.files_found = files_found;

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM documents WHERE collection = ? GROUP BY status",
        )?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match DownloadStatus::parse(&status) {
                DownloadStatus::Pending => stats.pending = count,
                DownloadStatus::InProgress => stats.in_progress = count,
                DownloadStatus::Completed => stats.completed = count,
                DownloadStatus::Failed => stats.failed = count,
                DownloadStatus::NotFound => stats.not_found = count,
                DownloadStatus::Skipped => stats.skipped = count,
            }
        }

        stats.brute_force_cursor = self.get_brute_force_cursor(collection)?;
        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // Index pages
    // -------------------------------------------------------------------------

    /// Register a page if it is not already known.
    pub fn page_upsert(&self, collection: u32, page_index: u32) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO pages (collection, page_index) VALUES (?, ?)",
            params![collection, page_index],
        )?;
        Ok(())
    }

    /// Register a contiguous page range in one transaction.
    pub fn insert_pages(&self, collection: u32, first: u32, last: u32) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx
                .prepare("INSERT OR IGNORE INTO pages (collection, page_index) VALUES (?, ?)")?;
            for page in first..=last {
                stmt.execute(params![collection, page])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Mark a page as scraped with the number of documents it listed.
    pub fn mark_page_scraped(&self, collection: u32, page_index: u32, pdf_count: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            UPDATE pages SET scraped = 1, pdf_count = ?1, scraped_at = ?2
            WHERE collection = ?3 AND page_index = ?4
            "#,
            params![
                pdf_count,
                Utc::now().to_rfc3339(),
                collection,
                page_index,
            ],
        )?;
        Ok(())
    }

    /// Pages still awaiting a scrape, lowest index first.
    pub fn list_unscraped_pages(&self, collection: u32, limit: usize) -> Result<Vec<u32>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT page_index FROM pages
            WHERE collection = ? AND scraped = 0
            ORDER BY page_index ASC
            LIMIT ?
            "#,
        )?;
        let pages = stmt
            .query_map(params![collection, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    /// Look up one page's scrape state.
    pub fn page(&self, collection: u32, page_index: u32) -> Result<Option<PageRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT collection, page_index, scraped, pdf_count, scraped_at
            FROM pages WHERE collection = ? AND page_index = ?
            "#,
        )?;
        let page = stmt.query_row(params![collection, page_index], |row| {
            Ok(PageRecord {
                collection: row.get(0)?,
                page_index: row.get(1)?,
                scraped: row.get::<_, i64>(2)? != 0,
                pdf_count: row.get(3)?,
                scraped_at: parse_datetime_opt(row.get(4)?),
            })
        });
        match page {
            Ok(page) => Ok(Some(page)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // -------------------------------------------------------------------------
    // Brute-force cursor
    // -------------------------------------------------------------------------

    /// Persist the highest numeric id already staged for a collection.
    pub fn set_brute_force_cursor(&self, collection: u32, id: u64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO collection_progress (collection, brute_force_cursor, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(collection) DO UPDATE SET
                brute_force_cursor = excluded.brute_force_cursor,
                updated_at = excluded.updated_at
            "#,
            params![collection, id as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Read the brute-force cursor; 0 when no enumeration has run.
    pub fn get_brute_force_cursor(&self, collection: u32) -> Result<u64> {
        let conn = self.connect()?;
        let cursor: std::result::Result<i64, _> = conn.query_row(
            "SELECT brute_force_cursor FROM collection_progress WHERE collection = ?",
            params![collection],
            |row| row.get(0),
        );
        match cursor {
            Ok(id) => Ok(id as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

const DOCUMENT_COLUMNS: &str = "id, collection, document_id, url, local_path, status, \
     file_size, retry_count, last_error, created_at, updated_at";

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: row.get(0)?,
        collection: row.get(1)?,
        document_id: row.get(2)?,
        url: row.get(3)?,
        local_path: PathBuf::from(row.get::<_, String>(4)?),
        status: DownloadStatus::parse(&row.get::<_, String>(5)?),
        file_size: row.get(6)?,
        retry_count: row.get(7)?,
        last_error: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}
