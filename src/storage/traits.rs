//! Storage traits and error types
//!
//! This module defines the capability traits every storage backend implements
//! (queue, crawl states, document metadata) and the associated error types.

use crate::request::{Request, Response};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// One entry of a schedule batch produced by upstream scoring
///
/// When `schedule` is false the entry only carries a score update for the
/// metadata store and the queue leaves it alone.
#[derive(Debug)]
pub struct ScheduleEntry<'a> {
    pub fingerprint: String,
    pub score: f64,
    pub request: &'a mut Request,
    pub schedule: bool,
}

impl<'a> ScheduleEntry<'a> {
    pub fn new(request: &'a mut Request, score: f64, schedule: bool) -> Self {
        Self {
            fingerprint: request.fingerprint.clone(),
            score,
            request,
            schedule,
        }
    }
}

/// Start/stop hooks shared by all frontier components
pub trait Lifecycle {
    /// Called once before the component is used
    fn frontier_start(&mut self) -> StorageResult<()> {
        Ok(())
    }

    /// Called once when the frontier shuts down
    fn frontier_stop(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

/// Priority queue with partitions and time-gated eligibility
pub trait Queue: Lifecycle {
    /// Dequeues up to `max_n` eligible requests from `partition_id`
    ///
    /// Returned records stay in storage but become ineligible for the
    /// dequeue-hold delay. On any failure the whole selection is rolled back
    /// and an empty batch is returned; the caller retries on its own schedule.
    fn get_next_requests(&mut self, max_n: usize, partition_id: u32) -> Vec<Request>;

    /// Upserts every entry with `schedule = true` as one unit of work
    ///
    /// On success each scheduled request's `meta.state` is `Queued`. On
    /// failure no write is visible and request states are left untouched.
    fn schedule(&mut self, batch: &mut [ScheduleEntry<'_>]) -> StorageResult<()>;

    /// Total number of records in the backing store
    fn count(&self) -> StorageResult<u64>;
}

/// Write-back cache of crawl states backed by persistent storage
///
/// The cache is owned by one process and must not be mutated concurrently.
pub trait States: Lifecycle {
    /// Loads persisted states for `fingerprints` into the cache
    ///
    /// Fingerprints unknown to storage are cached as `NotCrawled`.
    fn fetch(&mut self, fingerprints: &[String]) -> StorageResult<()>;

    /// Writes the cached state of each request into its metadata
    fn set_states(&self, requests: &mut [Request]);

    /// Stores each request's metadata state in the cache (no I/O)
    fn update_cache(&mut self, requests: &[Request]);

    /// Persists the whole cache in one batched write
    ///
    /// With `force_clear` the cache is emptied afterwards.
    fn flush(&mut self, force_clear: bool) -> StorageResult<()>;

    /// Number of cached fingerprints
    fn cache_len(&self) -> usize;
}

/// Per-document metadata, optimised for a write-mostly flow
pub trait Metadata: Lifecycle {
    fn add_seeds(&mut self, seeds: &[Request]) -> StorageResult<()>;

    fn page_crawled(&mut self, response: &Response) -> StorageResult<()>;

    fn links_extracted(&mut self, request: &Request, links: &[Request]) -> StorageResult<()>;

    fn request_error(&mut self, request: &Request, error: &str) -> StorageResult<()>;

    /// Persists the scores carried by a schedule batch
    fn update_score(&mut self, batch: &[ScheduleEntry<'_>]) -> StorageResult<()>;
}
