//! Scheduling backends
//!
//! A backend turns crawl events (seeds, crawled pages, extracted links,
//! errors) into state changes and queue writes, and hands out the next batch
//! of requests for a set of partitions.

mod revisiting;

pub use revisiting::{RevisitingBackend, SqliteRevisitingBackend};

use crate::request::{Request, Response};
use crate::storage::{Lifecycle, ScheduleEntry, StorageResult};

/// Frontier-facing scheduling operations
pub trait Backend: Lifecycle {
    /// Registers seed URLs and schedules the ones not yet queued
    fn add_seeds(&mut self, seeds: Vec<Request>) -> StorageResult<()>;

    /// Records a crawl outcome and reschedules the URL
    fn page_crawled(&mut self, response: Response) -> StorageResult<()>;

    /// Records links found on `request` and schedules the new ones
    fn links_extracted(&mut self, request: &Request, links: Vec<Request>) -> StorageResult<()>;

    /// Records a failed crawl attempt
    fn request_error(&mut self, request: Request, error: &str) -> StorageResult<()>;

    /// Applies a batch of externally computed scores
    fn update_scores(&mut self, batch: &mut [ScheduleEntry<'_>]) -> StorageResult<()>;

    /// Dequeues up to `max_n` requests from each of `partitions`
    fn get_next_requests(&mut self, max_n: usize, partitions: &[u32]) -> Vec<Request>;

    /// True when nothing is left to hand out
    fn finished(&self) -> bool;

    /// Persists the state cache and empties it
    fn flush_states(&mut self) -> StorageResult<()>;
}
