//! SQLite crawl-state store with a write-back cache

use crate::request::Request;
use crate::state::CrawlState;
use crate::storage::schema::{initialize_schema, open_connection};
use crate::storage::traits::{Lifecycle, States, StorageResult};
use crate::storage::RetryPolicy;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// SQLite-backed state store
///
/// The cache is authoritative while a crawl cycle runs; the `states` table is
/// authoritative across restarts.
pub struct SqliteStates {
    conn: Connection,
    cache: HashMap<String, CrawlState>,
    retry: RetryPolicy,
    span: tracing::Span,
}

impl SqliteStates {
    /// Opens (or creates) the state store in the database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = open_connection(path)?;
        Ok(Self::from_connection(conn))
    }

    /// Creates a state store on a private in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            cache: HashMap::new(),
            retry: RetryPolicy::default(),
            span: tracing::info_span!("states"),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Cached state of one fingerprint, if it is cached
    pub fn cached(&self, fingerprint: &str) -> Option<CrawlState> {
        self.cache.get(fingerprint).copied()
    }

    fn load(&self, fingerprints: &[&String]) -> StorageResult<Vec<(String, CrawlState)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT state FROM states WHERE fingerprint = ?1")?;
        let mut loaded = Vec::with_capacity(fingerprints.len());

        for fingerprint in fingerprints {
            let code: Option<i64> = stmt
                .query_row(params![fingerprint], |row| row.get(0))
                .optional()?;
            let state = match code {
                Some(code) => CrawlState::from_db_code(code).unwrap_or_else(|| {
                    tracing::warn!("Unknown state code {} for {}", code, fingerprint);
                    CrawlState::default()
                }),
                None => CrawlState::default(),
            };
            loaded.push(((*fingerprint).clone(), state));
        }

        Ok(loaded)
    }

    fn write_cache(&mut self) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO states (fingerprint, state) VALUES (?1, ?2)
                 ON CONFLICT(fingerprint) DO UPDATE SET state = excluded.state",
            )?;
            for (fingerprint, state) in &self.cache {
                stmt.execute(params![fingerprint, state.to_db_code()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl Lifecycle for SqliteStates {
    fn frontier_stop(&mut self) -> StorageResult<()> {
        self.flush(true)
    }
}

impl States for SqliteStates {
    fn fetch(&mut self, fingerprints: &[String]) -> StorageResult<()> {
        let _enter = self.span.enter();

        let missing: Vec<&String> = fingerprints
            .iter()
            .filter(|fp| !self.cache.contains_key(fp.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let loaded = self.retry.run("fetch states", || self.load(&missing))?;
        tracing::debug!("Fetched {} states into the cache", loaded.len());

        self.cache.extend(loaded);
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
        let span = self.span.clone();
        let _enter = span.enter();

        if !self.cache.is_empty() {
            let retry = self.retry;
            retry.run("flush states", || self.write_cache())?;
            tracing::debug!("Flushed {} states", self.cache.len());
        }
        if force_clear {
            tracing::debug!("Clearing states cache ({} entries)", self.cache.len());
            self.cache.clear();
        }
        Ok(())
    }

    fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_states() -> SqliteStates {
        SqliteStates::new_in_memory()
            .unwrap()
            .with_retry_policy(RetryPolicy::new(2, Duration::ZERO))
    }

    #[test]
    fn test_unknown_fingerprints_default_to_not_crawled() {
        let mut states = test_states();
        let mut requests = vec![Request::new("https://example.com/a")];

        states.fetch(&[requests[0].fingerprint.clone()]).unwrap();
        states.set_states(&mut requests);

        assert_eq!(requests[0].meta.state, Some(CrawlState::NotCrawled));
    }

    #[test]
    fn test_update_cache_is_memory_only_until_flush() {
        let mut states = test_states();
        let request = Request::new("https://example.com/a").with_state(CrawlState::Crawled);

        states.update_cache(std::slice::from_ref(&request));
        let persisted: i64 = states
            .conn
            .query_row("SELECT COUNT(*) FROM states", [], |row| row.get(0))
            .unwrap();
        assert_eq!(persisted, 0);

        states.flush(false).unwrap();
        let persisted: i64 = states
            .conn
            .query_row("SELECT COUNT(*) FROM states", [], |row| row.get(0))
            .unwrap();
        assert_eq!(persisted, 1);
        assert_eq!(states.cache_len(), 1);
    }

    #[test]
    fn test_flush_with_clear_then_fetch_restores() {
        let mut states = test_states();
        let request = Request::new("https://example.com/a").with_state(CrawlState::Error);

        states.update_cache(std::slice::from_ref(&request));
        states.flush(true).unwrap();
        assert_eq!(states.cache_len(), 0);

        states.fetch(&[request.fingerprint.clone()]).unwrap();
        assert_eq!(states.cached(&request.fingerprint), Some(CrawlState::Error));
    }

    #[test]
    fn test_fetch_does_not_overwrite_cached_state() {
        let mut states = test_states();
        let request = Request::new("https://example.com/a").with_state(CrawlState::Crawled);
        states.update_cache(std::slice::from_ref(&request));
        states.flush(false).unwrap();

        let queued = request.clone().with_state(CrawlState::Queued);
        states.update_cache(std::slice::from_ref(&queued));
        states.fetch(&[request.fingerprint.clone()]).unwrap();

        assert_eq!(states.cached(&request.fingerprint), Some(CrawlState::Queued));
    }

    #[test]
    fn test_requests_without_state_are_ignored() {
        let mut states = test_states();
        states.update_cache(&[Request::new("https://example.com/a")]);
        assert_eq!(states.cache_len(), 0);
    }

    #[test]
    fn test_flush_failure_surfaces_after_retries() {
        let mut states = test_states();
        states.conn.execute_batch("DROP TABLE states;").unwrap();
        let request = Request::new("https://example.com/a").with_state(CrawlState::Crawled);
        states.update_cache(std::slice::from_ref(&request));

        assert!(states.flush(true).is_err());
        // nothing was cleared because the flush never completed
        assert_eq!(states.cache_len(), 1);
    }
}
