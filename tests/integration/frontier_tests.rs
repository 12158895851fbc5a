use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sumi_frontier::backend::SqliteRevisitingBackend;
use sumi_frontier::config::{parse_config, Config};
use sumi_frontier::messagebus::codec::{self, CrawlLogEvent};
use sumi_frontier::messagebus::{Broker, LogConsumer, MessageBus, StreamConsumer, StreamProducer};
use sumi_frontier::storage::{Queue, States};
use sumi_frontier::worker::{DbWorker, WorkerSettings};
use sumi_frontier::{CrawlState, Request, Response};
use tempfile::TempDir;

/// Creates a test configuration storing everything under `dir`
fn create_test_config(dir: &Path, revisit_interval_secs: u64) -> Config {
    let db_path = dir.join("frontier.db");
    parse_config(&format!(
        r#"
[storage]
database-path = '{}'
retry-tries = 2
retry-backoff-secs = 0

[queue]
partitions = 4
revisit-interval-secs = {}
dequeue-hold-secs = 600

[message-bus]
crawl-log-partitions = 2
feed-partitions = 4
max-next-requests = 16
producer-batch-size = 8
poll-timeout-ms = 0

[worker]
state-flush-interval = 1
"#,
        db_path.display(),
        revisit_interval_secs
    ))
    .expect("Failed to parse test config")
}

fn start_worker(config: &Config, bus: &Arc<MessageBus>) -> DbWorker<SqliteRevisitingBackend> {
    let backend = SqliteRevisitingBackend::open(config).expect("Failed to open backend");
    DbWorker::new(backend, Arc::clone(bus), WorkerSettings::from_config(config))
        .expect("Failed to start worker")
}

async fn report(bus: &MessageBus, events: Vec<CrawlLogEvent>) {
    let mut producer = bus.crawl_log().producer();
    for event in &events {
        producer
            .send(
                event.key().map(str::as_bytes),
                vec![codec::encode(event).unwrap()],
            )
            .await
            .unwrap();
    }
    producer.close().await.unwrap();
}

async fn read_feed(consumer: &LogConsumer) -> Vec<Request> {
    consumer
        .get_messages(Duration::ZERO, 1000)
        .await
        .unwrap()
        .iter()
        .map(|m| codec::decode_request(m).unwrap())
        .collect()
}

/// Reads the feed partition by partition
async fn read_feed_by_partition(bus: &MessageBus) -> HashMap<u32, Vec<Request>> {
    let mut fed = HashMap::new();
    for &partition in bus.feed().partitioner().partitions() {
        let mut spider = bus.feed().consumer(Some(partition)).unwrap();
        fed.insert(partition, read_feed(&spider).await);
        spider.close().await;
    }
    fed
}

#[tokio::test]
async fn test_seed_crawl_and_link_discovery() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 3600);
    let bus = Arc::new(MessageBus::new(&config.message_bus, Broker::new()).unwrap());
    let mut worker = start_worker(&config, &bus);
    let mut spider = bus.feed().consumer(None).unwrap();

    let seed = Request::new("https://example.com/");
    report(
        &bus,
        vec![CrawlLogEvent::AddSeeds {
            seeds: vec![seed.clone()],
        }],
    )
    .await;
    worker.run_once().await;

    let fed = read_feed(&spider).await;
    assert_eq!(fed.len(), 1);
    assert_eq!(fed[0].url, seed.url);

    let crawled = fed[0].clone();
    report(
        &bus,
        vec![
            CrawlLogEvent::PageCrawled {
                response: Response::new(crawled.clone(), 200),
            },
            CrawlLogEvent::LinksExtracted {
                request: crawled,
                links: vec![
                    Request::new("https://example.com/about"),
                    Request::new("https://example.org/"),
                    Request::new("https://example.com/about"),
                    Request::new("https://example.com/"),
                ],
            },
        ],
    )
    .await;
    worker.run_once().await;

    let mut urls: Vec<String> = read_feed(&spider).await.into_iter().map(|r| r.url).collect();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "https://example.com/about".to_string(),
            "https://example.org/".to_string()
        ]
    );

    let states = worker.backend().states();
    assert_eq!(states.cache_len(), 0);
    assert_eq!(worker.backend().queue().count().unwrap(), 3);

    spider.close().await;
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_feed_partitions_follow_hosts() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 3600);
    let bus = Arc::new(MessageBus::new(&config.message_bus, Broker::new()).unwrap());
    let mut worker = start_worker(&config, &bus);

    let mut seeds = Vec::new();
    for host in ["a.example", "b.example", "c.example", "d.example", "e.example"] {
        for page in 0..3 {
            seeds.push(Request::new(format!("https://{}/{}", host, page)));
        }
    }
    report(&bus, vec![CrawlLogEvent::AddSeeds { seeds }]).await;
    worker.run_once().await;

    let fed = read_feed_by_partition(&bus).await;
    assert_eq!(fed.values().map(Vec::len).sum::<usize>(), 15);

    let queue_partitioner = config.queue_partitioner().unwrap();
    for (partition, requests) in &fed {
        for request in requests {
            assert_eq!(queue_partitioner.partition_for(request), *partition);
        }
    }

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_crawled_page_comes_back_after_revisit_interval() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 0);
    let bus = Arc::new(MessageBus::new(&config.message_bus, Broker::new()).unwrap());
    let mut worker = start_worker(&config, &bus);
    let mut spider = bus.feed().consumer(None).unwrap();

    report(
        &bus,
        vec![CrawlLogEvent::AddSeeds {
            seeds: vec![Request::new("https://example.com/")],
        }],
    )
    .await;
    worker.run_once().await;
    let first = read_feed(&spider).await;
    assert_eq!(first.len(), 1);

    report(
        &bus,
        vec![CrawlLogEvent::PageCrawled {
            response: Response::new(first[0].clone(), 200),
        }],
    )
    .await;
    worker.run_once().await;

    let second = read_feed(&spider).await;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].fingerprint, first[0].fingerprint);
    assert_eq!(second[0].meta.state, Some(CrawlState::Queued));
    assert_eq!(worker.backend().queue().count().unwrap(), 1);

    spider.close().await;
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_keeps_queue_and_states() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(dir.path(), 3600);
    let seed = Request::new("https://example.com/");

    {
        let bus = Arc::new(MessageBus::new(&config.message_bus, Broker::new()).unwrap());
        let mut worker = start_worker(&config, &bus);
        report(
            &bus,
            vec![CrawlLogEvent::AddSeeds {
                seeds: vec![seed.clone()],
            }],
        )
        .await;
        worker.consume_crawl_log().await.unwrap();
        worker.stop().await.unwrap();
    }

    // fresh broker: nothing in flight, only storage survives
    let bus = Arc::new(MessageBus::new(&config.message_bus, Broker::new()).unwrap());
    let mut worker = start_worker(&config, &bus);
    assert_eq!(worker.backend().queue_size(), 1);

    report(
        &bus,
        vec![CrawlLogEvent::AddSeeds {
            seeds: vec![seed.clone()],
        }],
    )
    .await;
    worker.run_once().await;

    assert_eq!(worker.backend().queue().count().unwrap(), 1);
    let fed = read_feed_by_partition(&bus).await;
    let fed: Vec<&Request> = fed.values().flatten().collect();
    assert_eq!(fed.len(), 1);
    assert_eq!(fed[0].fingerprint, seed.fingerprint);

    worker.stop().await.unwrap();
}
