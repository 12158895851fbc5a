//! In-memory storage backends
//!
//! Same contracts as the SQLite backends, without persistence. Used by tests
//! and by dry runs.

use crate::partition::Partitioner;
use crate::request::{Request, Response};
use crate::state::CrawlState;
use crate::storage::sqlite_metadata::MetadataRecord;
use crate::storage::traits::{Lifecycle, Metadata, Queue, ScheduleEntry, States, StorageResult};
use crate::storage::{duration_secs, mark_queued, now_secs, QueueRecord};
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Revisiting queue held in process memory
pub struct MemoryQueue {
    records: BTreeMap<i64, QueueRecord>,
    index: HashMap<(u32, String), i64>,
    next_id: i64,
    partitioner: Partitioner,
    dequeue_hold: Duration,
}

impl MemoryQueue {
    pub fn new(partitioner: Partitioner, dequeue_hold: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 1,
            partitioner,
            dequeue_hold,
        }
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    fn store(&mut self, mut record: QueueRecord) {
        let key = (record.partition_id, record.fingerprint.clone());

        // An id that is no longer live falls back to the (partition, fingerprint) key
        let id = match self.records.get(&record.id) {
            Some(existing) if record.id > 0 => {
                let old_key = (existing.partition_id, existing.fingerprint.clone());
                self.index.remove(&old_key);
                if let Some(other) = self.index.get(&key).copied() {
                    if other != record.id {
                        self.records.remove(&other);
                    }
                }
                record.id
            }
            _ => match self.index.get(&key) {
                Some(id) => *id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    id
                }
            },
        };

        record.id = id;
        self.index.insert(key, id);
        self.records.insert(id, record);
    }
}

fn dequeue_order(a: &QueueRecord, b: &QueueRecord) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.crawl_at.cmp(&b.crawl_at))
        .then(a.id.cmp(&b.id))
}

impl Lifecycle for MemoryQueue {}

impl Queue for MemoryQueue {
    fn get_next_requests(&mut self, max_n: usize, partition_id: u32) -> Vec<Request> {
        let now = now_secs();
        let release_at = now.saturating_add(duration_secs(self.dequeue_hold));

        let mut eligible: Vec<&mut QueueRecord> = self
            .records
            .values_mut()
            .filter(|r| r.partition_id == partition_id && r.crawl_at <= now)
            .collect();
        eligible.sort_by(|a, b| dequeue_order(a, b));

        eligible
            .into_iter()
            .take(max_n)
            .map(|record| {
                record.crawl_at = release_at;
                record.clone().into_request()
            })
            .collect()
    }

    fn schedule(&mut self, batch: &mut [ScheduleEntry<'_>]) -> StorageResult<()> {
        let records: Vec<QueueRecord> = batch
            .iter()
            .filter(|entry| entry.schedule)
            .map(|entry| QueueRecord::for_entry(&self.partitioner, entry))
            .collect();
        for record in records {
            self.store(record);
        }
        mark_queued(batch);
        Ok(())
    }

    fn count(&self) -> StorageResult<u64> {
        Ok(self.records.len() as u64)
    }
}

/// State store whose "persistent" side is a second map
#[derive(Default)]
pub struct MemoryStates {
    cache: HashMap<String, CrawlState>,
    persisted: HashMap<String, CrawlState>,
}

impl MemoryStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, fingerprint: &str) -> Option<CrawlState> {
        self.cache.get(fingerprint).copied()
    }

    pub fn persisted(&self, fingerprint: &str) -> Option<CrawlState> {
        self.persisted.get(fingerprint).copied()
    }
}

impl Lifecycle for MemoryStates {
    fn frontier_stop(&mut self) -> StorageResult<()> {
        self.flush(true)
    }
}

impl States for MemoryStates {
    fn fetch(&mut self, fingerprints: &[String]) -> StorageResult<()> {
        for fingerprint in fingerprints {
            if !self.cache.contains_key(fingerprint) {
                let state = self.persisted.get(fingerprint).copied().unwrap_or_default();
                self.cache.insert(fingerprint.clone(), state);
            }
        }
        Ok(())
    }

    fn set_states(&self, requests: &mut [Request]) {
        for request in requests {
            let state = self
                .cache
                .get(&request.fingerprint)
                .copied()
                .unwrap_or_default();
            request.meta.state = Some(state);
        }
    }

    fn update_cache(&mut self, requests: &[Request]) {
        for request in requests {
            if let Some(state) = request.meta.state {
                self.cache.insert(request.fingerprint.clone(), state);
            }
        }
    }

    fn flush(&mut self, force_clear: bool) -> StorageResult<()> {
        self.persisted
            .extend(self.cache.iter().map(|(fp, state)| (fp.clone(), *state)));
        if force_clear {
            self.cache.clear();
        }
        Ok(())
    }

    fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Metadata store held in a map keyed by fingerprint
#[derive(Default)]
pub struct MemoryMetadata {
    records: HashMap<String, MetadataRecord>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &str) -> Option<&MetadataRecord> {
        self.records.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn entry(&mut self, request: &Request) -> &mut MetadataRecord {
        self.records
            .entry(request.fingerprint.clone())
            .or_insert_with(|| MetadataRecord {
                fingerprint: request.fingerprint.clone(),
                url: request.url.clone(),
                depth: request.meta.depth,
                created_at: Utc::now().to_rfc3339(),
                fetched_at: None,
                status_code: None,
                score: request.score,
                error: None,
            })
    }
}

impl Lifecycle for MemoryMetadata {}

impl Metadata for MemoryMetadata {
    fn add_seeds(&mut self, seeds: &[Request]) -> StorageResult<()> {
        for seed in seeds {
            self.entry(seed);
        }
        Ok(())
    }

    fn page_crawled(&mut self, response: &Response) -> StorageResult<()> {
        let record = self.entry(&response.request);
        record.fetched_at = Some(Utc::now().to_rfc3339());
        record.status_code = Some(response.status_code);
        record.error = None;
        Ok(())
    }

    fn links_extracted(&mut self, _request: &Request, links: &[Request]) -> StorageResult<()> {
        for link in links {
            self.entry(link);
        }
        Ok(())
    }

    fn request_error(&mut self, request: &Request, error: &str) -> StorageResult<()> {
        let record = self.entry(request);
        record.fetched_at = Some(Utc::now().to_rfc3339());
        record.error = Some(error.to_string());
        Ok(())
    }

    fn update_score(&mut self, batch: &[ScheduleEntry<'_>]) -> StorageResult<()> {
        for entry in batch {
            self.entry(&*entry.request).score = entry.score;
        }
        Ok(())
    }
}
