//! Storage module for the frontier's persistent state
//!
//! This module handles every write the frontier makes to durable storage:
//! - The revisiting queue (priority + time-gated dequeue, idempotent upserts)
//! - The crawl-state store (write-back cache with batched flushes)
//! - Per-document metadata and scores
//! - The bounded retry policy wrapping each unit of work
//!
//! Each capability is a trait with an SQLite backend and an in-memory backend.

mod memory;
mod retry;
mod schema;
mod sqlite_metadata;
mod sqlite_queue;
mod sqlite_states;
mod traits;

pub use memory::{MemoryMetadata, MemoryQueue, MemoryStates};
pub use retry::{RetryPolicy, DEFAULT_BACKOFF, DEFAULT_TRIES};
pub use schema::{initialize_schema, open_connection, open_in_memory};
pub use sqlite_metadata::{MetadataRecord, SqliteMetadata};
pub use sqlite_queue::SqliteQueue;
pub use sqlite_states::SqliteStates;
pub use traits::{
    Lifecycle, Metadata, Queue, ScheduleEntry, States, StorageError, StorageResult,
};

use crate::partition::{host_bucket, Partitioner};
use crate::request::{Request, RequestMeta, DEFAULT_METHOD};
use crate::state::CrawlState;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;

/// Persisted counterpart of a scheduled request
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    /// Storage-assigned id, 0 until storage assigns one
    pub id: i64,
    pub fingerprint: String,
    pub score: f64,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub meta: RequestMeta,
    pub partition_id: u32,
    pub host_bucket: u32,
    /// Microseconds since epoch
    pub created_at: i64,
    /// Seconds since epoch
    pub crawl_at: i64,
}

impl QueueRecord {
    /// Builds the row for one schedule entry
    ///
    /// The partition comes from the hostname key; when no key can be derived
    /// the first partition is used and the degradation is logged. `crawl_at`
    /// is the request's scheduled time, or `now` when none was set.
    pub fn for_entry(partitioner: &Partitioner, entry: &ScheduleEntry<'_>) -> Self {
        let request = &*entry.request;
        let now = Utc::now();

        let partition_id = match partitioner.get_key(request) {
            Some(key) => partitioner.partition(Some(&key)),
            None => {
                tracing::error!(
                    "Can't get partition key for URL {}, fingerprint {}",
                    request.url,
                    entry.fingerprint
                );
                partitioner.default_partition()
            }
        };

        let mut meta = request.meta.clone();
        meta.state = Some(CrawlState::Queued);
        meta.queue_record_id = None;

        Self {
            id: request.meta.queue_record_id.unwrap_or(0),
            fingerprint: entry.fingerprint.clone(),
            score: entry.score,
            url: request.url.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            cookies: request.cookies.clone(),
            meta,
            partition_id,
            host_bucket: host_bucket(&request.url),
            created_at: now.timestamp_micros(),
            crawl_at: request.crawl_at().unwrap_or_else(|| now.timestamp()),
        }
    }

    /// Converts a dequeued record back into a request
    pub fn into_request(self) -> Request {
        let method = if self.method.is_empty() {
            DEFAULT_METHOD.to_string()
        } else {
            self.method
        };
        let mut meta = self.meta;
        meta.queue_record_id = Some(self.id);

        Request {
            fingerprint: self.fingerprint,
            url: self.url,
            method,
            score: self.score,
            headers: self.headers,
            cookies: self.cookies,
            meta,
        }
    }
}

/// Marks every scheduled entry of a committed batch as queued
pub(crate) fn mark_queued(batch: &mut [ScheduleEntry<'_>]) {
    for entry in batch.iter_mut().filter(|e| e.schedule) {
        entry.request.meta.state = Some(CrawlState::Queued);
    }
}

/// Current time in whole seconds since epoch
pub(crate) fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Converts a duration into whole seconds for epoch arithmetic
pub(crate) fn duration_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}
