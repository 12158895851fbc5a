//! Worker loops
//!
//! The db worker is the only process writing to the frontier's storage. It
//! applies crawl-log and scoring-log events to the backend and keeps the feed
//! topped up for partitions that have room.

mod db_worker;

pub use db_worker::{CycleReport, DbWorker, WorkerSettings};
