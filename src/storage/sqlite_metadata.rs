//! SQLite metadata store

use crate::request::{Request, Response};
use crate::storage::schema::{initialize_schema, open_connection};
use crate::storage::traits::{Lifecycle, Metadata, ScheduleEntry, StorageResult};
use crate::storage::RetryPolicy;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;

const INSERT_IGNORE: &str = "
    INSERT INTO metadata (fingerprint, url, depth, created_at, score)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT(fingerprint) DO NOTHING";

/// Document metadata kept in the `metadata` table
pub struct SqliteMetadata {
    conn: Connection,
    retry: RetryPolicy,
    span: tracing::Span,
}

/// One stored metadata row
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    pub fingerprint: String,
    pub url: String,
    pub depth: u32,
    pub created_at: String,
    pub fetched_at: Option<String>,
    pub status_code: Option<u16>,
    pub score: f64,
    pub error: Option<String>,
}

impl SqliteMetadata {
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = open_connection(path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            retry: RetryPolicy::default(),
            span: tracing::info_span!("metadata"),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Looks up one document
    pub fn get(&self, fingerprint: &str) -> StorageResult<Option<MetadataRecord>> {
        use rusqlite::OptionalExtension;

        let record = self
            .conn
            .query_row(
                "SELECT fingerprint, url, depth, created_at, fetched_at, status_code, score, error
                 FROM metadata WHERE fingerprint = ?1",
                params![fingerprint],
                |row| {
                    Ok(MetadataRecord {
                        fingerprint: row.get(0)?,
                        url: row.get(1)?,
                        depth: row.get(2)?,
                        created_at: row.get(3)?,
                        fetched_at: row.get(4)?,
                        status_code: row.get(5)?,
                        score: row.get(6)?,
                        error: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn insert_new(&mut self, requests: &[&Request]) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_IGNORE)?;
            for request in requests {
                stmt.execute(params![
                    request.fingerprint,
                    request.url,
                    request.meta.depth,
                    now,
                    request.score
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl Lifecycle for SqliteMetadata {}

impl Metadata for SqliteMetadata {
    fn add_seeds(&mut self, seeds: &[Request]) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let seeds: Vec<&Request> = seeds.iter().collect();
        let retry = self.retry;
        retry.run("add seeds", || self.insert_new(&seeds))
    }

    fn page_crawled(&mut self, response: &Response) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let request = &response.request;
        let retry = self.retry;
        retry.run("page crawled", || {
            let now = Utc::now().to_rfc3339();
            let tx = self.conn.transaction()?;
            tx.execute(
                INSERT_IGNORE,
                params![
                    request.fingerprint,
                    request.url,
                    request.meta.depth,
                    now,
                    request.score
                ],
            )?;
            tx.execute(
                "UPDATE metadata SET fetched_at = ?1, status_code = ?2, error = NULL
                 WHERE fingerprint = ?3",
                params![now, response.status_code, request.fingerprint],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn links_extracted(&mut self, _request: &Request, links: &[Request]) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let links: Vec<&Request> = links.iter().collect();
        let retry = self.retry;
        retry.run("links extracted", || self.insert_new(&links))
    }

    fn request_error(&mut self, request: &Request, error: &str) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let retry = self.retry;
        retry.run("request error", || {
            let now = Utc::now().to_rfc3339();
            let tx = self.conn.transaction()?;
            tx.execute(
                INSERT_IGNORE,
                params![
                    request.fingerprint,
                    request.url,
                    request.meta.depth,
                    now,
                    request.score
                ],
            )?;
            tx.execute(
                "UPDATE metadata SET fetched_at = ?1, error = ?2 WHERE fingerprint = ?3",
                params![now, error, request.fingerprint],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn update_score(&mut self, batch: &[ScheduleEntry<'_>]) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let retry = self.retry;
        retry.run("update score", || {
            let now = Utc::now().to_rfc3339();
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO metadata (fingerprint, url, depth, created_at, score)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(fingerprint) DO UPDATE SET score = excluded.score",
                )?;
                for entry in batch {
                    stmt.execute(params![
                        entry.fingerprint,
                        entry.request.url,
                        entry.request.meta.depth,
                        now,
                        entry.score
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}
