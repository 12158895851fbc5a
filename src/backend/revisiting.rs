//! Revisiting scheduling backend
//!
//! Every URL is rescheduled after each crawl outcome: never-crawled URLs are
//! due immediately, crawled (or failed) URLs become due again after the
//! revisit interval. URLs that already have a live queue record are left
//! alone so a request is never queued twice.

use crate::backend::Backend;
use crate::config::Config;
use crate::request::{Request, Response};
use crate::state::CrawlState;
use crate::storage::{
    duration_secs, now_secs, Lifecycle, Metadata, Queue, ScheduleEntry, SqliteMetadata,
    SqliteQueue, SqliteStates, States, StorageResult,
};
use std::collections::HashSet;
use std::time::Duration;

/// Revisiting backend over the SQLite stores
pub type SqliteRevisitingBackend = RevisitingBackend<SqliteQueue, SqliteStates, SqliteMetadata>;

/// Backend that keeps every known URL cycling through the queue
pub struct RevisitingBackend<Q, S, M> {
    queue: Q,
    states: S,
    metadata: M,
    revisit_interval: Duration,
    queue_size: u64,
    span: tracing::Span,
}

impl<Q, S, M> RevisitingBackend<Q, S, M>
where
    Q: Queue,
    S: States,
    M: Metadata,
{
    pub fn new(queue: Q, states: S, metadata: M, revisit_interval: Duration) -> Self {
        Self {
            queue,
            states,
            metadata,
            revisit_interval,
            queue_size: 0,
            span: tracing::info_span!("backend"),
        }
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn states(&self) -> &S {
        &self.states
    }

    pub fn states_mut(&mut self) -> &mut S {
        &mut self.states
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    pub fn revisit_interval(&self) -> Duration {
        self.revisit_interval
    }

    /// Requests handed out minus requests scheduled, as tracked by this process
    pub fn queue_size(&self) -> u64 {
        self.queue_size
    }

    /// Sets `scheduled_at` by state and writes one schedule batch
    ///
    /// Queued requests are skipped. When the queue write fails nothing else
    /// is touched and the error is returned.
    fn schedule(&mut self, requests: &mut [Request]) -> StorageResult<()> {
        let now = now_secs();
        let revisit_at = now.saturating_add(duration_secs(self.revisit_interval));

        let mut batch = Vec::with_capacity(requests.len());
        for request in requests.iter_mut() {
            match request.state() {
                CrawlState::NotCrawled => request.meta.scheduled_at = Some(now),
                CrawlState::Crawled | CrawlState::Error => {
                    request.meta.scheduled_at = Some(revisit_at)
                }
                CrawlState::Queued => {
                    tracing::debug!("Skipping already queued {}", request.url);
                    continue;
                }
            }
            let score = request.score;
            batch.push(ScheduleEntry::new(request, score, true));
        }

        if batch.is_empty() {
            return Ok(());
        }

        self.queue.schedule(&mut batch)?;
        self.metadata.update_score(&batch)?;
        self.queue_size += batch.len() as u64;
        Ok(())
    }

    /// Loads the states of `requests` from storage into their metadata
    fn refresh_states(&mut self, requests: &mut [Request]) -> StorageResult<()> {
        let fingerprints: Vec<String> = requests.iter().map(|r| r.fingerprint.clone()).collect();
        self.states.fetch(&fingerprints)?;
        self.states.set_states(requests);
        Ok(())
    }
}

impl SqliteRevisitingBackend {
    /// Opens the three SQLite stores named by `config`
    pub fn open(config: &Config) -> crate::Result<Self> {
        let path = config.database_path();
        let retry = config.retry_policy();

        let queue = SqliteQueue::new(&path, config.queue_partitioner()?, config.dequeue_hold())?
            .with_retry_policy(retry);
        let states = SqliteStates::new(&path)?.with_retry_policy(retry);
        let metadata = SqliteMetadata::new(&path)?.with_retry_policy(retry);

        tracing::info!(
            "Opened revisiting backend at {} ({} partitions)",
            path.display(),
            config.queue.partitions
        );
        Ok(Self::new(queue, states, metadata, config.revisit_interval()))
    }
}

impl<Q, S, M> Lifecycle for RevisitingBackend<Q, S, M>
where
    Q: Queue,
    S: States,
    M: Metadata,
{
    fn frontier_start(&mut self) -> StorageResult<()> {
        self.metadata.frontier_start()?;
        self.queue.frontier_start()?;
        self.states.frontier_start()?;
        self.queue_size = self.queue.count()?;
        tracing::info!("Backend started with {} queued records", self.queue_size);
        Ok(())
    }

    fn frontier_stop(&mut self) -> StorageResult<()> {
        self.metadata.frontier_stop()?;
        self.queue.frontier_stop()?;
        self.states.frontier_stop()?;
        tracing::info!("Backend stopped");
        Ok(())
    }
}

impl<Q, S, M> Backend for RevisitingBackend<Q, S, M>
where
    Q: Queue,
    S: States,
    M: Metadata,
{
    fn add_seeds(&mut self, mut seeds: Vec<Request>) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        for seed in &mut seeds {
            seed.meta.depth = 0;
        }
        self.metadata.add_seeds(&seeds)?;
        self.refresh_states(&mut seeds)?;
        self.schedule(&mut seeds)?;
        self.states.update_cache(&seeds);

        tracing::info!("Added {} seeds", seeds.len());
        Ok(())
    }

    fn page_crawled(&mut self, response: Response) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let Response {
            mut request,
            status_code,
        } = response;
        if !request.state().is_terminal() {
            request.meta.state = Some(CrawlState::Crawled);
        }
        self.states.update_cache(std::slice::from_ref(&request));

        let response = Response::new(request, status_code);
        self.metadata.page_crawled(&response)?;

        let mut requests = vec![response.request];
        self.states.set_states(&mut requests);
        self.schedule(&mut requests)?;
        self.states.update_cache(&requests);
        Ok(())
    }

    fn links_extracted(&mut self, request: &Request, links: Vec<Request>) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut seen = HashSet::new();
        let mut links: Vec<Request> = links
            .into_iter()
            .filter(|link| seen.insert(link.fingerprint.clone()))
            .collect();
        if links.is_empty() {
            return Ok(());
        }

        let depth = request.meta.depth.saturating_add(1);
        for link in &mut links {
            link.meta.depth = depth;
        }

        self.refresh_states(&mut links)?;
        self.metadata.links_extracted(request, &links)?;
        self.schedule(&mut links)?;
        self.states.update_cache(&links);

        tracing::debug!("{} links extracted from {}", links.len(), request.url);
        Ok(())
    }

    fn request_error(&mut self, mut request: Request, error: &str) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        request.meta.state = Some(CrawlState::Error);
        self.metadata.request_error(&request, error)?;
        self.states.update_cache(std::slice::from_ref(&request));

        tracing::warn!("Request {} failed: {}", request.url, error);
        Ok(())
    }

    fn update_scores(&mut self, batch: &mut [ScheduleEntry<'_>]) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        self.queue.schedule(batch)?;
        self.metadata.update_score(batch)?;

        let scheduled: Vec<Request> = batch
            .iter()
            .filter(|entry| entry.schedule)
            .map(|entry| entry.request.clone())
            .collect();
        self.queue_size += scheduled.len() as u64;
        self.states.update_cache(&scheduled);
        Ok(())
    }

    fn get_next_requests(&mut self, max_n: usize, partitions: &[u32]) -> Vec<Request> {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut batch = Vec::new();
        for &partition_id in partitions {
            batch.extend(self.queue.get_next_requests(max_n, partition_id));
        }
        self.queue_size = self.queue_size.saturating_sub(batch.len() as u64);

        if !batch.is_empty() {
            tracing::debug!(
                "Got {} requests from {} partitions",
                batch.len(),
                partitions.len()
            );
        }
        batch
    }

    fn finished(&self) -> bool {
        self.queue_size == 0
    }

    fn flush_states(&mut self) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let cached = self.states.cache_len();
        self.states.flush(true)?;
        tracing::info!("Flushed {} cached states", cached);
        Ok(())
    }
}
