//! DB worker loop
//!
//! One cycle consumes the crawl log, then the scoring log, then publishes a
//! new batch to every feed partition with room. Failures inside a cycle are
//! logged and the next cycle runs as usual.

use crate::backend::Backend;
use crate::config::Config;
use crate::messagebus::codec::{self, CrawlLogEvent, ScoringEvent};
use crate::messagebus::{
    error_chain, ConsumerKind, LogConsumer, LogProducer, MessageBus, StreamConsumer,
    StreamProducer,
};
use crate::request::Request;
use crate::storage::{ScheduleEntry, StorageResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

/// Shortest pause between idle cycles
const MIN_IDLE_PAUSE: Duration = Duration::from_millis(10);

/// Tunables of the db worker loop
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub crawl_log_batch: usize,
    pub scoring_log_batch: usize,
    pub max_next_requests: usize,
    pub poll_timeout: Duration,
    pub state_flush_interval: u32,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            crawl_log_batch: config.worker.crawl_log_batch,
            scoring_log_batch: config.worker.scoring_log_batch,
            max_next_requests: config.message_bus.max_next_requests,
            poll_timeout: config.message_bus.poll_timeout(),
            state_flush_interval: config.worker.state_flush_interval,
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub crawl_log_events: usize,
    pub score_updates: usize,
    pub published: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.crawl_log_events == 0 && self.score_updates == 0 && self.published == 0
    }
}

pub struct DbWorker<B> {
    backend: B,
    bus: Arc<MessageBus>,
    crawl_log: LogConsumer,
    scoring_log: LogConsumer,
    feed: LogProducer,
    settings: WorkerSettings,
    cycles: u64,
    span: tracing::Span,
}

impl<B: Backend> DbWorker<B> {
    /// Starts the backend and joins the crawl-log and scoring-log groups
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(mut backend: B, bus: Arc<MessageBus>, settings: WorkerSettings) -> crate::Result<Self> {
        backend.frontier_start()?;

        let crawl_log = bus.crawl_log().consumer(None, ConsumerKind::Db)?;
        let scoring_log = bus.scoring_log().consumer()?;
        let feed = bus.feed().producer();

        Ok(Self {
            backend,
            bus,
            crawl_log,
            scoring_log,
            feed,
            settings,
            cycles: 0,
            span: tracing::info_span!("db_worker"),
        })
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Applies up to one batch of crawl-log events
    ///
    /// Undecodable messages and events the backend rejects are logged and skipped.
    pub async fn consume_crawl_log(&mut self) -> crate::Result<usize> {
        let messages = self
            .crawl_log
            .get_messages(self.settings.poll_timeout, self.settings.crawl_log_batch)
            .await?;

        let mut applied = 0;
        for message in &messages {
            let event = match codec::decode_crawl_log(message) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Skipping undecodable crawl-log message: {}", e);
                    continue;
                }
            };
            match self.apply(event) {
                Ok(()) => applied += 1,
                Err(e) => tracing::error!("Crawl-log event failed: {}", error_chain(&e)),
            }
        }

        if applied > 0 {
            tracing::debug!("Applied {} crawl-log events", applied);
        }
        Ok(applied)
    }

    fn apply(&mut self, event: CrawlLogEvent) -> StorageResult<()> {
        match event {
            CrawlLogEvent::AddSeeds { seeds } => self.backend.add_seeds(seeds),
            CrawlLogEvent::PageCrawled { response } => self.backend.page_crawled(response),
            CrawlLogEvent::LinksExtracted { request, links } => {
                self.backend.links_extracted(&request, links)
            }
            CrawlLogEvent::RequestError { request, error } => {
                self.backend.request_error(request, &error)
            }
        }
    }

    /// Applies up to one batch of score updates as one schedule batch
    ///
    /// Repeated updates of a fingerprint within the batch keep the last one.
    pub async fn consume_scoring_log(&mut self) -> crate::Result<usize> {
        let messages = self
            .scoring_log
            .get_messages(self.settings.poll_timeout, self.settings.scoring_log_batch)
            .await?;

        let mut updates: Vec<(Request, f64, bool)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for message in &messages {
            let ScoringEvent::UpdateScore {
                request,
                score,
                schedule,
            } = match codec::decode_scoring(message) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Skipping undecodable scoring-log message: {}", e);
                    continue;
                }
            };
            match index.get(&request.fingerprint) {
                Some(&i) => updates[i] = (request, score, schedule),
                None => {
                    index.insert(request.fingerprint.clone(), updates.len());
                    updates.push((request, score, schedule));
                }
            }
        }
        if updates.is_empty() {
            return Ok(0);
        }

        let mut batch: Vec<ScheduleEntry<'_>> = updates
            .iter_mut()
            .map(|(request, score, schedule)| ScheduleEntry::new(request, *score, *schedule))
            .collect();
        self.backend.update_scores(&mut batch)?;

        tracing::debug!("Applied {} score updates", batch.len());
        Ok(batch.len())
    }

    /// Publishes the next requests of every feed partition below the lag limit
    pub async fn new_batch(&mut self) -> crate::Result<usize> {
        let partitions = self.bus.feed().available_partitions()?;
        if partitions.is_empty() {
            tracing::debug!("No feed partitions available");
            return Ok(0);
        }

        let requests = self
            .backend
            .get_next_requests(self.settings.max_next_requests, &partitions);
        let partitioner = self.bus.feed().partitioner();
        for request in &requests {
            let key = partitioner.get_key(request);
            self.feed
                .send(key.as_deref(), vec![codec::encode(request)?])
                .await?;
        }
        self.feed.flush().await?;

        if !requests.is_empty() {
            tracing::info!(
                "Pushed {} requests to {} partitions",
                requests.len(),
                partitions.len()
            );
        }
        Ok(requests.len())
    }

    pub fn flush_states(&mut self) -> StorageResult<()> {
        self.backend.flush_states()
    }

    /// Runs one cycle
    pub async fn run_once(&mut self) -> CycleReport {
        let span = self.span.clone();
        self.cycle().instrument(span).await
    }

    async fn cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let mut report = CycleReport::default();

        match self.consume_crawl_log().await {
            Ok(n) => report.crawl_log_events = n,
            Err(e) => tracing::error!("Consuming the crawl log failed: {}", error_chain(&e)),
        }
        match self.consume_scoring_log().await {
            Ok(n) => report.score_updates = n,
            Err(e) => tracing::error!("Consuming the scoring log failed: {}", error_chain(&e)),
        }
        match self.new_batch().await {
            Ok(n) => report.published = n,
            Err(e) => tracing::error!("Publishing a new batch failed: {}", error_chain(&e)),
        }

        let interval = u64::from(self.settings.state_flush_interval);
        if interval > 0 && self.cycles % interval == 0 {
            if let Err(e) = self.flush_states() {
                tracing::error!("Flushing states failed: {}", error_chain(&e));
            }
        }

        report
    }

    /// Loops until `shutdown` turns true, then stops
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> crate::Result<()> {
        tracing::info!("DB worker started");
        let idle_pause = self.settings.poll_timeout.max(MIN_IDLE_PAUSE);

        while !*shutdown.borrow() {
            let report = self.run_once().await;
            if report.is_idle() {
                tokio::select! {
                    _ = tokio::time::sleep(idle_pause) => {}
                    Ok(()) = shutdown.changed() => {}
                }
            }
        }

        tracing::info!("DB worker shutting down after {} cycles", self.cycles);
        self.stop().await
    }

    /// Flushes the feed, closes consumers and stops the backend
    pub async fn stop(&mut self) -> crate::Result<()> {
        if let Err(e) = self.feed.close().await {
            tracing::error!("Closing the feed producer failed: {}", error_chain(&e));
        }
        self.crawl_log.close().await;
        self.scoring_log.close().await;
        self.backend.frontier_stop()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RevisitingBackend;
    use crate::config::parse_config;
    use crate::messagebus::Broker;
    use crate::request::Response;
    use crate::state::CrawlState;
    use crate::storage::{MemoryMetadata, MemoryQueue, MemoryStates, States};

    type MemoryBackend = RevisitingBackend<MemoryQueue, MemoryStates, MemoryMetadata>;

    fn config(max_next_requests: usize, flush_interval: u32) -> Config {
        parse_config(&format!(
            r#"
[storage]
database-path = "unused.db"

[queue]
partitions = 2
revisit-interval-secs = 3600
dequeue-hold-secs = 600

[message-bus]
crawl-log-partitions = 2
feed-partitions = 2
max-next-requests = {}
producer-batch-size = 16
poll-timeout-ms = 0

[worker]
state-flush-interval = {}
"#,
            max_next_requests, flush_interval
        ))
        .unwrap()
    }

    fn worker(config: &Config) -> DbWorker<MemoryBackend> {
        let queue = MemoryQueue::new(config.queue_partitioner().unwrap(), config.dequeue_hold());
        let backend = RevisitingBackend::new(
            queue,
            MemoryStates::new(),
            MemoryMetadata::new(),
            config.revisit_interval(),
        );
        let bus = Arc::new(MessageBus::new(&config.message_bus, Broker::new()).unwrap());
        DbWorker::new(backend, bus, WorkerSettings::from_config(config)).unwrap()
    }

    async fn publish(worker: &DbWorker<MemoryBackend>, event: &CrawlLogEvent) {
        let mut producer = worker.bus.crawl_log().producer();
        producer
            .send(
                event.key().map(str::as_bytes),
                vec![codec::encode(event).unwrap()],
            )
            .await
            .unwrap();
        producer.flush().await.unwrap();
    }

    async fn publish_score(worker: &DbWorker<MemoryBackend>, request: Request, score: f64) {
        let mut producer = worker.bus.scoring_log().producer();
        let event = ScoringEvent::UpdateScore {
            request,
            score,
            schedule: true,
        };
        producer
            .send(None, vec![codec::encode(&event).unwrap()])
            .await
            .unwrap();
        producer.flush().await.unwrap();
    }

    async fn drain_feed(worker: &DbWorker<MemoryBackend>) -> Vec<Request> {
        let mut spider = worker.bus.feed().consumer(None).unwrap();
        let messages = spider.get_messages(Duration::ZERO, 100).await.unwrap();
        spider.close().await;
        messages
            .iter()
            .map(|m| codec::decode_request(m).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_seeds_reach_the_feed() {
        let config = config(8, 0);
        let mut worker = worker(&config);
        let seed = Request::new("https://example.com/");
        publish(
            &worker,
            &CrawlLogEvent::AddSeeds {
                seeds: vec![seed.clone()],
            },
        )
        .await;

        let report = worker.run_once().await;
        assert_eq!(report.crawl_log_events, 1);
        assert_eq!(report.published, 1);

        let fed = drain_feed(&worker).await;
        assert_eq!(fed.len(), 1);
        assert_eq!(fed[0].fingerprint, seed.fingerprint);
        assert_eq!(fed[0].meta.state, Some(CrawlState::Queued));
    }

    #[tokio::test]
    async fn test_crawled_page_is_not_republished_before_revisit() {
        let config = config(8, 0);
        let mut worker = worker(&config);
        publish(
            &worker,
            &CrawlLogEvent::AddSeeds {
                seeds: vec![Request::new("https://example.com/")],
            },
        )
        .await;
        worker.run_once().await;
        let fed = drain_feed(&worker).await;

        publish(
            &worker,
            &CrawlLogEvent::PageCrawled {
                response: Response::new(fed[0].clone(), 200),
            },
        )
        .await;
        let report = worker.run_once().await;

        assert_eq!(report.crawl_log_events, 1);
        assert_eq!(report.published, 0);
        let record = worker.backend().metadata().get(&fed[0].fingerprint).unwrap();
        assert_eq!(record.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_score_update_schedules_and_publishes() {
        let config = config(8, 0);
        let mut worker = worker(&config);
        let request = Request::new("https://example.com/scored");

        publish_score(&worker, request.clone(), 0.5).await;
        publish_score(&worker, request.clone(), 7.0).await;
        let report = worker.run_once().await;

        assert_eq!(report.score_updates, 1);
        assert_eq!(report.published, 1);
        let fed = drain_feed(&worker).await;
        assert_eq!(fed[0].score, 7.0);
    }

    #[tokio::test]
    async fn test_undecodable_messages_are_skipped() {
        let config = config(8, 0);
        let mut worker = worker(&config);
        let mut producer = worker.bus.crawl_log().producer();
        producer
            .send(Some(b"junk".as_slice()), vec![b"not json".to_vec()])
            .await
            .unwrap();
        producer.flush().await.unwrap();

        let report = worker.run_once().await;
        assert!(report.is_idle());
        assert_eq!(worker.cycles(), 1);
    }

    #[tokio::test]
    async fn test_full_partition_gets_no_new_batch() {
        let config = config(1, 0);
        let mut worker = worker(&config);
        publish(
            &worker,
            &CrawlLogEvent::AddSeeds {
                seeds: vec![
                    Request::new("https://example.com/a"),
                    Request::new("https://example.com/b"),
                ],
            },
        )
        .await;

        assert_eq!(worker.run_once().await.published, 1);
        // the spider has not read the first request yet
        assert_eq!(worker.run_once().await.published, 0);

        drain_feed(&worker).await;
        assert_eq!(worker.run_once().await.published, 1);
    }

    #[tokio::test]
    async fn test_states_flushed_on_interval() {
        let config = config(8, 2);
        let mut worker = worker(&config);
        let seed = Request::new("https://example.com/");
        publish(
            &worker,
            &CrawlLogEvent::AddSeeds {
                seeds: vec![seed.clone()],
            },
        )
        .await;

        worker.run_once().await;
        assert_eq!(worker.backend().states().cache_len(), 1);

        worker.run_once().await;
        assert_eq!(worker.backend().states().cache_len(), 0);
        assert_eq!(
            worker.backend().states().persisted(&seed.fingerprint),
            Some(CrawlState::Queued)
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = config(8, 0);
        let mut worker = worker(&config);
        let (shutdown, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = shutdown.send(true);
        });

        worker.run(rx).await.unwrap();
        assert!(worker.cycles() >= 1);
        assert_eq!(worker.backend().states().cache_len(), 0);
    }
}
