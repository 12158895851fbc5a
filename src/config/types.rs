use crate::partition::{PartitionKey, Partitioner};
use crate::storage::RetryPolicy;
use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for Sumi-Frontier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    #[serde(rename = "message-bus")]
    pub message_bus: MessageBusConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Attempts per storage unit of work
    #[serde(rename = "retry-tries", default = "default_retry_tries")]
    pub retry_tries: u32,

    /// Pause between attempts (seconds)
    #[serde(rename = "retry-backoff-secs", default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

/// Revisiting queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of queue partitions
    pub partitions: u32,

    /// Delay before a crawled URL becomes eligible again (seconds)
    #[serde(rename = "revisit-interval-secs", default = "default_revisit_interval_secs")]
    pub revisit_interval_secs: u64,

    /// How long a dequeued record stays ineligible (seconds)
    #[serde(rename = "dequeue-hold-secs", default = "default_dequeue_hold_secs")]
    pub dequeue_hold_secs: u64,
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBusConfig {
    #[serde(rename = "crawl-log-partitions")]
    pub crawl_log_partitions: u32,

    /// Must match the queue partition count
    #[serde(rename = "feed-partitions")]
    pub feed_partitions: u32,

    /// Lag at which a feed partition stops receiving new batches
    #[serde(rename = "max-next-requests", default = "default_max_next_requests")]
    pub max_next_requests: usize,

    #[serde(rename = "producer-batch-size", default = "default_producer_batch_size")]
    pub producer_batch_size: usize,

    #[serde(rename = "heartbeat-interval-secs", default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(rename = "poll-timeout-ms", default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(rename = "crawl-log-db-group", default = "default_crawl_log_db_group")]
    pub crawl_log_db_group: String,

    #[serde(rename = "crawl-log-sw-group", default = "default_crawl_log_sw_group")]
    pub crawl_log_sw_group: String,

    #[serde(rename = "scoring-log-group", default = "default_scoring_log_group")]
    pub scoring_log_group: String,

    #[serde(rename = "feed-group", default = "default_feed_group")]
    pub feed_group: String,
}

/// DB worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(rename = "crawl-log-batch", default = "default_log_batch")]
    pub crawl_log_batch: usize,

    #[serde(rename = "scoring-log-batch", default = "default_log_batch")]
    pub scoring_log_batch: usize,

    /// Cycles between state cache flushes
    #[serde(rename = "state-flush-interval", default = "default_state_flush_interval")]
    pub state_flush_interval: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            crawl_log_batch: default_log_batch(),
            scoring_log_batch: default_log_batch(),
            state_flush_interval: default_state_flush_interval(),
        }
    }
}

fn default_retry_tries() -> u32 {
    5
}

fn default_retry_backoff_secs() -> u64 {
    5
}

fn default_revisit_interval_secs() -> u64 {
    86_400
}

fn default_dequeue_hold_secs() -> u64 {
    300
}

fn default_max_next_requests() -> usize {
    256
}

fn default_producer_batch_size() -> usize {
    64
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_crawl_log_db_group() -> String {
    "dbw".to_string()
}

fn default_crawl_log_sw_group() -> String {
    "sw".to_string()
}

fn default_scoring_log_group() -> String {
    "dbw-scoring".to_string()
}

fn default_feed_group() -> String {
    "spiders".to_string()
}

fn default_log_batch() -> usize {
    64
}

fn default_state_flush_interval() -> u32 {
    10
}

impl Config {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.database_path)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.storage.retry_tries,
            Duration::from_secs(self.storage.retry_backoff_secs),
        )
    }

    pub fn revisit_interval(&self) -> Duration {
        Duration::from_secs(self.queue.revisit_interval_secs)
    }

    pub fn dequeue_hold(&self) -> Duration {
        Duration::from_secs(self.queue.dequeue_hold_secs)
    }

    /// Hostname partitioner over the queue partitions
    pub fn queue_partitioner(&self) -> Result<Partitioner, ConfigError> {
        Partitioner::with_count(self.queue.partitions, PartitionKey::Hostname)
    }
}

impl MessageBusConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}
