//! Sumi-Frontier: scheduling and distribution core of a distributed crawl frontier
//!
//! This crate decides which URL is crawled when across many crawling workers. It keeps
//! that decision consistent between a partitioned persistent store (the revisiting
//! queue and the crawl-state store) and a partitioned, log-based message bus.

pub mod backend;
pub mod config;
pub mod messagebus;
pub mod partition;
pub mod request;
pub mod state;
pub mod storage;
pub mod url;
pub mod worker;

use thiserror::Error;

/// Main error type for Sumi-Frontier operations
#[derive(Debug, Error)]
pub enum FrontierError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Message bus error: {0}")]
    Bus(#[from] messagebus::BusError),

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Missing host in URL")]
    MissingHost,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Sumi-Frontier operations
pub type Result<T> = std::result::Result<T, FrontierError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use backend::{Backend, RevisitingBackend};
pub use config::Config;
pub use partition::{PartitionKey, Partitioner};
pub use request::{Request, RequestMeta, Response};
pub use state::CrawlState;
pub use storage::{Metadata, Queue, RetryPolicy, ScheduleEntry, States};
