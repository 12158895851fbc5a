//! Message bus module
//!
//! This module connects the frontier to crawling and scoring workers through
//! three partitioned, offset-addressed streams:
//! - The crawl log (crawl outcomes, consumed by the db and strategy workers)
//! - The feed (requests to crawl, consumed by crawling workers)
//! - The scoring log (score updates, consumed by the db worker)
//!
//! The broker is in-process; producers and consumers only see the
//! [`StreamProducer`] and [`StreamConsumer`] traits.

mod broker;
pub mod codec;
mod consumer;
mod heartbeat;
mod producer;
mod stream;

pub use broker::Broker;
pub use codec::{CrawlLogEvent, ScoringEvent};
pub use consumer::LogConsumer;
pub use producer::LogProducer;
pub use stream::{
    ConsumerKind, CrawlLogStream, FeedStream, ScoringLogStream, CRAWL_LOG_TOPIC, FEED_TOPIC,
    SCORING_LOG_PARTITIONS, SCORING_LOG_TOPIC,
};

use crate::config::MessageBusConfig;
use crate::partition::Partitioner;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use stream::ClientSettings;
use thiserror::Error;

/// Errors that can occur on the message bus
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Broker is disconnected")]
    Disconnected,

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Partition {partition} of {topic} is not assigned")]
    PartitionNotAssigned { topic: String, partition: u32 },

    #[error("Topic {topic} has {actual} partitions, expected {expected}")]
    PartitionMismatch {
        topic: String,
        expected: u32,
        actual: u32,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("No tokio runtime available")]
    NoRuntime,

    #[error("Stream client is closed")]
    Closed,
}

/// Result type for message bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Write side of a stream
#[async_trait]
pub trait StreamProducer: Send {
    /// Buffers `messages` for the partition `key` maps to
    async fn send(&mut self, key: Option<&[u8]>, messages: Vec<Vec<u8>>) -> BusResult<()>;

    /// Appends everything buffered so far
    async fn flush(&mut self) -> BusResult<()>;

    /// Flushes, then rejects further sends
    async fn close(&mut self) -> BusResult<()>;
}

/// Read side of a stream
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Returns up to `count` messages, waiting at most `timeout` for the first
    async fn get_messages(&self, timeout: Duration, count: usize) -> BusResult<Vec<Vec<u8>>>;

    /// Current read position on an assigned partition
    async fn get_offset(&self, partition: u32) -> BusResult<u64>;

    async fn commit(&self) -> BusResult<()>;

    /// Stops the heartbeat and commits positions; a failing commit is only logged
    async fn close(&mut self);
}

/// Renders an error followed by each of its sources
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

/// The three streams over one broker
pub struct MessageBus {
    broker: Arc<Broker>,
    crawl_log: CrawlLogStream,
    feed: FeedStream,
    scoring_log: ScoringLogStream,
}

impl MessageBus {
    /// Creates the topics and the streams
    ///
    /// Existing topics must have the configured partition counts.
    pub fn new(config: &MessageBusConfig, broker: Arc<Broker>) -> crate::Result<Self> {
        ensure_topic(&broker, CRAWL_LOG_TOPIC, config.crawl_log_partitions)?;
        ensure_topic(&broker, FEED_TOPIC, config.feed_partitions)?;
        ensure_topic(&broker, SCORING_LOG_TOPIC, SCORING_LOG_PARTITIONS)?;

        let settings = ClientSettings {
            batch_size: config.producer_batch_size,
            heartbeat_interval: config.heartbeat_interval(),
        };

        let crawl_log = CrawlLogStream::new(
            Arc::clone(&broker),
            Partitioner::fingerprint(config.crawl_log_partitions)?,
            config.crawl_log_db_group.clone(),
            config.crawl_log_sw_group.clone(),
            settings,
        );
        let feed = FeedStream::new(
            Arc::clone(&broker),
            Partitioner::hostname(config.feed_partitions)?,
            config.feed_group.clone(),
            config.max_next_requests,
            settings,
        );
        let scoring_log =
            ScoringLogStream::new(Arc::clone(&broker), config.scoring_log_group.clone(), settings);

        tracing::info!(
            "Message bus ready: {} crawl-log partitions, {} feed partitions",
            config.crawl_log_partitions,
            config.feed_partitions
        );
        Ok(Self {
            broker,
            crawl_log,
            feed,
            scoring_log,
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn crawl_log(&self) -> &CrawlLogStream {
        &self.crawl_log
    }

    pub fn feed(&self) -> &FeedStream {
        &self.feed
    }

    pub fn scoring_log(&self) -> &ScoringLogStream {
        &self.scoring_log
    }
}

fn ensure_topic(broker: &Broker, topic: &str, partitions: u32) -> BusResult<()> {
    let actual = broker.create_topic(topic, partitions)?;
    if actual != partitions {
        return Err(BusError::PartitionMismatch {
            topic: topic.to_string(),
            expected: partitions,
            actual,
        });
    }
    Ok(())
}
