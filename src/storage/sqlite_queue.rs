//! SQLite revisiting queue
//!
//! Records are never deleted on dequeue. Claiming a record pushes its
//! `crawl_at` forward by the dequeue-hold delay, which acts as a lease: the
//! record becomes eligible again if the crawl outcome never comes back.

use crate::partition::Partitioner;
use crate::request::Request;
use crate::storage::schema::{initialize_schema, open_connection};
use crate::storage::traits::{Lifecycle, Queue, ScheduleEntry, StorageResult};
use crate::storage::{duration_secs, mark_queued, now_secs, QueueRecord, RetryPolicy};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;

const SELECT_ELIGIBLE: &str = "
    SELECT id, fingerprint, score, url, method, headers, cookies, meta,
           partition_id, host_bucket, created_at, crawl_at
    FROM revisiting_queue
    WHERE partition_id = ?1 AND crawl_at <= ?2
    ORDER BY score DESC, crawl_at ASC, id ASC
    LIMIT ?3";

const UPDATE_BY_ID: &str = "
    UPDATE revisiting_queue
    SET fingerprint = ?1, score = ?2, url = ?3, method = ?4, headers = ?5, cookies = ?6,
        meta = ?7, partition_id = ?8, host_bucket = ?9, created_at = ?10, crawl_at = ?11
    WHERE id = ?12";

// Another live record under the key the id's record is moving to
const DELETE_COLLIDING: &str = "
    DELETE FROM revisiting_queue
    WHERE partition_id = ?1 AND fingerprint = ?2 AND id <> ?3
      AND EXISTS (SELECT 1 FROM revisiting_queue WHERE id = ?3)";

const UPSERT: &str = "
    INSERT INTO revisiting_queue
        (fingerprint, score, url, method, headers, cookies, meta,
         partition_id, host_bucket, created_at, crawl_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    ON CONFLICT(partition_id, fingerprint) DO UPDATE SET
        score = excluded.score, url = excluded.url, method = excluded.method,
        headers = excluded.headers, cookies = excluded.cookies, meta = excluded.meta,
        host_bucket = excluded.host_bucket, created_at = excluded.created_at,
        crawl_at = excluded.crawl_at";

/// SQLite-backed revisiting queue
pub struct SqliteQueue {
    conn: Connection,
    partitioner: Partitioner,
    dequeue_hold: Duration,
    retry: RetryPolicy,
    span: tracing::Span,
}

impl SqliteQueue {
    /// Opens (or creates) the queue in the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `partitioner` - Hostname partitioner shared with the feed stream
    /// * `dequeue_hold` - How long a dequeued record stays ineligible
    pub fn new(
        path: &Path,
        partitioner: Partitioner,
        dequeue_hold: Duration,
    ) -> StorageResult<Self> {
        let conn = open_connection(path)?;
        Ok(Self::from_parts(conn, partitioner, dequeue_hold))
    }

    /// Creates a queue on a private in-memory database
    pub fn new_in_memory(partitioner: Partitioner, dequeue_hold: Duration) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self::from_parts(conn, partitioner, dequeue_hold))
    }

    fn from_parts(conn: Connection, partitioner: Partitioner, dequeue_hold: Duration) -> Self {
        Self {
            conn,
            partitioner,
            dequeue_hold,
            retry: RetryPolicy::default(),
            span: tracing::info_span!("revisiting_queue"),
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

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Record count of every non-empty partition, in partition order
    pub fn partition_counts(&self) -> StorageResult<Vec<(u32, u64)>> {
        let _enter = self.span.enter();

        self.retry.run("partition_counts", || {
            let mut stmt = self.conn.prepare(
                "SELECT partition_id, COUNT(*) FROM revisiting_queue
                 GROUP BY partition_id ORDER BY partition_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Selects eligible records and pushes their `crawl_at` past the hold
    ///
    /// Runs in one transaction; an early return drops it, rolling back.
    fn dequeue(&mut self, max_n: usize, partition_id: u32) -> StorageResult<Vec<Request>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }

        let now = now_secs();
        let release_at = now.saturating_add(duration_secs(self.dequeue_hold));
        let limit = i64::try_from(max_n).unwrap_or(i64::MAX);

        let tx = self.conn.transaction()?;
        let records = {
            let mut stmt = tx.prepare(SELECT_ELIGIBLE)?;
            let rows = stmt.query_map(params![partition_id, now, limit], record_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        {
            let mut release =
                tx.prepare("UPDATE revisiting_queue SET crawl_at = ?1 WHERE id = ?2")?;
            for record in &records {
                release.execute(params![release_at, record.id])?;
            }
        }
        tx.commit()?;

        Ok(records.into_iter().map(QueueRecord::into_request).collect())
    }

    /// Writes one schedule batch as a single transaction
    fn write_batch(&mut self, batch: &[ScheduleEntry<'_>]) -> StorageResult<usize> {
        let records: Vec<QueueRecord> = batch
            .iter()
            .filter(|entry| entry.schedule)
            .map(|entry| QueueRecord::for_entry(&self.partitioner, entry))
            .collect();

        let tx = self.conn.transaction()?;
        {
            let mut delete_colliding = tx.prepare(DELETE_COLLIDING)?;
            let mut update = tx.prepare(UPDATE_BY_ID)?;
            let mut upsert = tx.prepare(UPSERT)?;

            for record in &records {
                let headers = serde_json::to_string(&record.headers)?;
                let cookies = serde_json::to_string(&record.cookies)?;
                let meta = serde_json::to_string(&record.meta)?;

                let updated = if record.id > 0 {
                    delete_colliding.execute(params![
                        record.partition_id,
                        record.fingerprint,
                        record.id
                    ])?;
                    update.execute(params![
                        record.fingerprint,
                        record.score,
                        record.url,
                        record.method,
                        headers,
                        cookies,
                        meta,
                        record.partition_id,
                        record.host_bucket,
                        record.created_at,
                        record.crawl_at,
                        record.id
                    ])?
                } else {
                    0
                };

                // Unknown or stale record id: fall back to an upsert keyed on
                // (partition_id, fingerprint) so no duplicate live record appears.
                if updated == 0 {
                    upsert.execute(params![
                        record.fingerprint,
                        record.score,
                        record.url,
                        record.method,
                        headers,
                        cookies,
                        meta,
                        record.partition_id,
                        record.host_bucket,
                        record.created_at,
                        record.crawl_at
                    ])?;
                }
            }
        }
        tx.commit()?;

        Ok(records.len())
    }
}

/// Decodes a JSON text column, reporting failures as a column conversion error
fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<QueueRecord> {
    Ok(QueueRecord {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        score: row.get(2)?,
        url: row.get(3)?,
        method: row.get(4)?,
        headers: json_column(row, 5)?,
        cookies: json_column(row, 6)?,
        meta: json_column(row, 7)?,
        partition_id: row.get(8)?,
        host_bucket: row.get(9)?,
        created_at: row.get(10)?,
        crawl_at: row.get(11)?,
    })
}

impl Lifecycle for SqliteQueue {}

impl Queue for SqliteQueue {
    fn get_next_requests(&mut self, max_n: usize, partition_id: u32) -> Vec<Request> {
        let span = self.span.clone();
        let _enter = span.enter();

        match self.dequeue(max_n, partition_id) {
            Ok(requests) => {
                tracing::debug!(
                    "Dequeued {} requests from partition {}",
                    requests.len(),
                    partition_id
                );
                requests
            }
            Err(e) => {
                tracing::error!(
                    "Dequeue from partition {} rolled back: {}",
                    partition_id,
                    e
                );
                Vec::new()
            }
        }
    }

    fn schedule(&mut self, batch: &mut [ScheduleEntry<'_>]) -> StorageResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let retry = self.retry;
        let written = retry.run("schedule", || self.write_batch(batch))?;
        mark_queued(batch);

        tracing::debug!("Scheduled {} of {} batch entries", written, batch.len());
        Ok(())
    }

    fn count(&self) -> StorageResult<u64> {
        let _enter = self.span.enter();

        self.retry.run("count", || {
            let count: i64 =
                self.conn
                    .query_row("SELECT COUNT(*) FROM revisiting_queue", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionKey;
    use crate::state::CrawlState;

    fn test_queue() -> SqliteQueue {
        SqliteQueue::new_in_memory(Partitioner::hostname(4).unwrap(), Duration::from_secs(300))
            .unwrap()
            .with_retry_policy(RetryPolicy::new(5, Duration::ZERO))
    }

    fn schedule_one(queue: &mut SqliteQueue, request: &mut Request, score: f64) {
        let mut batch = vec![ScheduleEntry::new(request, score, true)];
        queue.schedule(&mut batch).unwrap();
    }

    fn partition_of(queue: &SqliteQueue, url: &str) -> u32 {
        queue.partitioner().partition_for(&Request::new(url))
    }

    fn past(secs_ago: i64) -> Option<i64> {
        Some(now_secs() - secs_ago)
    }

    #[test]
    fn test_schedule_inserts_and_marks_queued() {
        let mut queue = test_queue();
        let mut request = Request::new("https://example.com/a");

        schedule_one(&mut queue, &mut request, 1.0);

        assert_eq!(queue.count().unwrap(), 1);
        assert_eq!(request.meta.state, Some(CrawlState::Queued));
    }

    #[test]
    fn test_unscheduled_entries_are_not_written() {
        let mut queue = test_queue();
        let mut request = Request::new("https://example.com/a");
        let mut batch = vec![ScheduleEntry::new(&mut request, 1.0, false)];

        queue.schedule(&mut batch).unwrap();

        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(request.meta.state, None);
    }

    #[test]
    fn test_reschedule_with_record_id_updates_in_place() {
        let mut queue = test_queue();
        let partition = partition_of(&queue, "https://example.com/a");

        let mut request = Request::new("https://example.com/a");
        request.meta.scheduled_at = past(10);
        schedule_one(&mut queue, &mut request, 1.0);

        let mut dequeued = queue.get_next_requests(10, partition);
        assert_eq!(dequeued.len(), 1);
        let mut again = dequeued.remove(0);
        assert!(again.meta.queue_record_id.is_some());

        again.meta.scheduled_at = past(5);
        again.url = "https://example.com/a?v=2".to_string();
        schedule_one(&mut queue, &mut again, 9.0);

        assert_eq!(queue.count().unwrap(), 1);
        let next = queue.get_next_requests(10, partition);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].score, 9.0);
        assert_eq!(next[0].url, "https://example.com/a?v=2");
    }

    #[test]
    fn test_reschedule_into_occupied_key_replaces_other_record() {
        let mut queue = test_queue();
        let old_partition = partition_of(&queue, "https://example.com/a");
        let mut request = Request::new("https://example.com/a");
        request.meta.scheduled_at = past(10);
        schedule_one(&mut queue, &mut request, 1.0);
        let mut again = queue.get_next_requests(10, old_partition).remove(0);

        // the partition layout changed and the URL was queued again meanwhile
        let new_partition = (old_partition + 1) % 4;
        queue.partitioner = Partitioner::new(vec![new_partition], PartitionKey::Hostname).unwrap();
        let mut fresh = Request::new("https://example.com/a");
        schedule_one(&mut queue, &mut fresh, 1.0);
        assert_eq!(queue.count().unwrap(), 2);

        again.meta.scheduled_at = past(5);
        schedule_one(&mut queue, &mut again, 9.0);

        assert_eq!(queue.count().unwrap(), 1);
        let next = queue.get_next_requests(10, new_partition);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].score, 9.0);
        assert_eq!(next[0].meta.queue_record_id, again.meta.queue_record_id);
    }

    #[test]
    fn test_reschedule_without_record_id_keeps_one_live_record() {
        let mut queue = test_queue();
        let mut first = Request::new("https://example.com/a");
        let mut second = Request::new("https://example.com/a");

        schedule_one(&mut queue, &mut first, 1.0);
        schedule_one(&mut queue, &mut second, 2.0);

        assert_eq!(queue.count().unwrap(), 1);
    }

    #[test]
    fn test_dequeue_orders_by_score_then_crawl_at() {
        let mut queue = test_queue();
        let partition = partition_of(&queue, "https://example.com/");

        // t0 < t1 < t2, all in the past
        let mut a = Request::new("https://example.com/t2");
        a.meta.scheduled_at = past(10);
        let mut b = Request::new("https://example.com/t1");
        b.meta.scheduled_at = past(20);
        let mut c = Request::new("https://example.com/t0");
        c.meta.scheduled_at = past(30);

        schedule_one(&mut queue, &mut a, 5.0);
        schedule_one(&mut queue, &mut b, 5.0);
        schedule_one(&mut queue, &mut c, 3.0);

        let urls: Vec<String> = queue
            .get_next_requests(10, partition)
            .into_iter()
            .map(|r| r.url)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/t1",
                "https://example.com/t2",
                "https://example.com/t0"
            ]
        );
    }

    #[test]
    fn test_future_records_are_not_eligible() {
        let mut queue = test_queue();
        let partition = partition_of(&queue, "https://example.com/");

        let mut future = Request::new("https://example.com/later");
        future.meta.scheduled_at = Some(now_secs() + 3_600);
        schedule_one(&mut queue, &mut future, 1_000.0);

        assert!(queue.get_next_requests(10, partition).is_empty());
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[test]
    fn test_dequeue_applies_hold_delay() {
        let mut queue = test_queue();
        let partition = partition_of(&queue, "https://example.com/");
        let mut request = Request::new("https://example.com/a");
        request.meta.scheduled_at = past(1);
        schedule_one(&mut queue, &mut request, 1.0);

        assert_eq!(queue.get_next_requests(10, partition).len(), 1);
        // leased: not handed out again until the hold expires
        assert!(queue.get_next_requests(10, partition).is_empty());
        assert_eq!(queue.count().unwrap(), 1);

        let crawl_at: i64 = queue
            .conn
            .query_row("SELECT crawl_at FROM revisiting_queue", [], |row| row.get(0))
            .unwrap();
        assert!(crawl_at >= now_secs() + 299);
    }

    #[test]
    fn test_dequeue_respects_limit_and_partition() {
        let mut queue = test_queue();
        let partition = partition_of(&queue, "https://example.com/");
        for i in 0..5 {
            let mut request = Request::new(format!("https://example.com/{}", i));
            request.meta.scheduled_at = past(1);
            schedule_one(&mut queue, &mut request, 1.0);
        }

        assert_eq!(queue.get_next_requests(3, partition).len(), 3);
        let other = (partition + 1) % 4;
        assert!(queue.get_next_requests(10, other).is_empty());
        assert_eq!(queue.get_next_requests(0, partition).len(), 0);
    }

    #[test]
    fn test_dequeue_failure_returns_empty_and_rolls_back() {
        let mut queue = test_queue();
        let partition = partition_of(&queue, "https://example.com/");
        let mut request = Request::new("https://example.com/a");
        request.meta.scheduled_at = past(1);
        schedule_one(&mut queue, &mut request, 1.0);

        queue
            .conn
            .execute_batch(
                "CREATE TRIGGER block_release BEFORE UPDATE OF crawl_at ON revisiting_queue
                 BEGIN SELECT RAISE(ABORT, 'release blocked'); END;",
            )
            .unwrap();

        assert!(queue.get_next_requests(10, partition).is_empty());

        queue.conn.execute_batch("DROP TRIGGER block_release;").unwrap();
        assert_eq!(queue.get_next_requests(10, partition).len(), 1);
    }

    #[test]
    fn test_failed_schedule_leaves_no_partial_write() {
        let mut queue = test_queue();
        queue
            .conn
            .execute_batch(
                "CREATE TRIGGER poison BEFORE INSERT ON revisiting_queue
                 WHEN NEW.url LIKE '%poison%'
                 BEGIN SELECT RAISE(ABORT, 'poisoned row'); END;",
            )
            .unwrap();

        let mut good = Request::new("https://example.com/good");
        let mut bad = Request::new("https://example.com/poison");
        let mut batch = vec![
            ScheduleEntry::new(&mut good, 1.0, true),
            ScheduleEntry::new(&mut bad, 1.0, true),
        ];

        let result = queue.schedule(&mut batch);
        drop(batch);

        assert!(matches!(
            result,
            Err(crate::storage::StorageError::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(good.meta.state, None);
    }

    #[test]
    fn test_headers_cookies_and_meta_survive_roundtrip() {
        let mut queue = test_queue();
        let partition = partition_of(&queue, "https://example.com/");
        let mut request = Request::new("https://example.com/a")
            .with_method("POST")
            .with_header("Accept", "text/html")
            .with_cookie("session", "abc");
        request.meta.depth = 3;
        request.meta.scheduled_at = past(1);
        schedule_one(&mut queue, &mut request, 1.0);

        let dequeued = queue.get_next_requests(1, partition);
        assert_eq!(dequeued[0].method, "POST");
        assert_eq!(dequeued[0].headers.get("Accept").unwrap(), "text/html");
        assert_eq!(dequeued[0].cookies.get("session").unwrap(), "abc");
        assert_eq!(dequeued[0].meta.depth, 3);
        assert_eq!(dequeued[0].meta.state, Some(CrawlState::Queued));
        assert_eq!(dequeued[0].fingerprint, request.fingerprint);
    }

    #[test]
    fn test_partition_counts() {
        let mut queue = test_queue();
        let partition = partition_of(&queue, "https://example.com/");
        for path in ["a", "b"] {
            let mut request = Request::new(format!("https://example.com/{}", path));
            schedule_one(&mut queue, &mut request, 1.0);
        }

        assert_eq!(queue.partition_counts().unwrap(), vec![(partition, 2)]);
    }
}
