//! The three frontier streams
//!
//! - Crawl log: crawling workers report outcomes, keyed by fingerprint
//! - Feed: the db worker publishes batches to crawl, keyed by hostname
//! - Scoring log: the scoring worker publishes score updates, unkeyed

use crate::messagebus::broker::Broker;
use crate::messagebus::consumer::LogConsumer;
use crate::messagebus::producer::LogProducer;
use crate::messagebus::BusResult;
use crate::partition::Partitioner;
use std::sync::Arc;
use std::time::Duration;

pub const CRAWL_LOG_TOPIC: &str = "frontier-crawl-log";
pub const FEED_TOPIC: &str = "frontier-feed";
pub const SCORING_LOG_TOPIC: &str = "frontier-scoring-log";

/// Partition count of the scoring log
pub const SCORING_LOG_PARTITIONS: u32 = 1;

/// Which crawl-log consumer group to join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// The db worker, applying events to storage
    Db,
    /// The strategy worker, computing scores
    Sw,
}

/// Settings every stream hands to its producers and consumers
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientSettings {
    pub batch_size: usize,
    pub heartbeat_interval: Duration,
}

pub struct CrawlLogStream {
    broker: Arc<Broker>,
    partitioner: Partitioner,
    db_group: String,
    sw_group: String,
    settings: ClientSettings,
}

impl CrawlLogStream {
    pub(crate) fn new(
        broker: Arc<Broker>,
        partitioner: Partitioner,
        db_group: String,
        sw_group: String,
        settings: ClientSettings,
    ) -> Self {
        Self {
            broker,
            partitioner,
            db_group,
            sw_group,
            settings,
        }
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    pub fn producer(&self) -> LogProducer {
        LogProducer::keyed(
            Arc::clone(&self.broker),
            CRAWL_LOG_TOPIC,
            self.partitioner.clone(),
            self.settings.batch_size,
        )
    }

    /// Joins the db or sw group on one partition (`Some`) or all of them
    pub fn consumer(&self, partition: Option<u32>, kind: ConsumerKind) -> BusResult<LogConsumer> {
        let group = match kind {
            ConsumerKind::Db => &self.db_group,
            ConsumerKind::Sw => &self.sw_group,
        };
        LogConsumer::open(
            Arc::clone(&self.broker),
            CRAWL_LOG_TOPIC,
            group,
            partition,
            self.settings.heartbeat_interval,
        )
    }
}

pub struct FeedStream {
    broker: Arc<Broker>,
    partitioner: Partitioner,
    group: String,
    max_next_requests: usize,
    settings: ClientSettings,
}

impl FeedStream {
    pub(crate) fn new(
        broker: Arc<Broker>,
        partitioner: Partitioner,
        group: String,
        max_next_requests: usize,
        settings: ClientSettings,
    ) -> Self {
        Self {
            broker,
            partitioner,
            group,
            max_next_requests,
            settings,
        }
    }

    /// Hostname partitioner, identical to the queue's
    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    pub fn producer(&self) -> LogProducer {
        LogProducer::keyed(
            Arc::clone(&self.broker),
            FEED_TOPIC,
            self.partitioner.clone(),
            self.settings.batch_size,
        )
    }

    pub fn consumer(&self, partition: Option<u32>) -> BusResult<LogConsumer> {
        LogConsumer::open(
            Arc::clone(&self.broker),
            FEED_TOPIC,
            &self.group,
            partition,
            self.settings.heartbeat_interval,
        )
    }

    /// Published minus consumed, per partition
    pub fn lags(&self) -> BusResult<Vec<(u32, u64)>> {
        self.broker.lags(&self.group, FEED_TOPIC)
    }

    /// Partitions whose lag is below `max_next_requests`
    ///
    /// Only these should receive a new batch.
    pub fn available_partitions(&self) -> BusResult<Vec<u32>> {
        let available = self
            .lags()?
            .into_iter()
            .filter(|&(_, lag)| lag < self.max_next_requests as u64)
            .map(|(partition, _)| partition)
            .collect::<Vec<_>>();
        Ok(available)
    }
}

pub struct ScoringLogStream {
    broker: Arc<Broker>,
    group: String,
    settings: ClientSettings,
}

impl ScoringLogStream {
    pub(crate) fn new(broker: Arc<Broker>, group: String, settings: ClientSettings) -> Self {
        Self {
            broker,
            group,
            settings,
        }
    }

    pub fn producer(&self) -> LogProducer {
        LogProducer::unkeyed(
            Arc::clone(&self.broker),
            SCORING_LOG_TOPIC,
            SCORING_LOG_PARTITIONS,
            self.settings.batch_size,
        )
    }

    pub fn consumer(&self) -> BusResult<LogConsumer> {
        LogConsumer::open(
            Arc::clone(&self.broker),
            SCORING_LOG_TOPIC,
            &self.group,
            None,
            self.settings.heartbeat_interval,
        )
    }
}
