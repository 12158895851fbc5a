//! State module for tracking crawl progress
//!
//! `CrawlState` is the per-fingerprint value held by the state store's write-back
//! cache and mirrored into each request's metadata.

mod crawl_state;

pub use crawl_state::CrawlState;
