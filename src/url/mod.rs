//! URL handling module for Sumi-Frontier
//!
//! Provides the canonical URL form used for fingerprinting and the hostname
//! extraction shared by the partitioner and the queue's host buckets.

mod canonical;
mod domain;

pub use canonical::canonicalize_url;
pub use domain::{extract_domain, hostname_of};
