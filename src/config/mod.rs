//! Configuration module for Sumi-Frontier
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use sumi_frontier::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("frontier.toml")).unwrap();
//! println!("Queue partitions: {}", config.queue.partitions);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{Config, MessageBusConfig, QueueConfig, StorageConfig, WorkerConfig};
pub use validation::{MAX_PARTITIONS, MAX_POLL_TIMEOUT_MS};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
