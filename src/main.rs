//! Sumi-Frontier main entry point
//!
//! Runs the db worker of a crawl frontier, or inspects its storage.

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use sumi_frontier::backend::{Backend, SqliteRevisitingBackend};
use sumi_frontier::config::{load_config_with_hash, Config};
use sumi_frontier::messagebus::codec::{self, CrawlLogEvent};
use sumi_frontier::messagebus::{Broker, MessageBus, StreamProducer};
use sumi_frontier::storage::{Lifecycle, Queue};
use sumi_frontier::worker::{DbWorker, WorkerSettings};
use sumi_frontier::Request;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Sumi-Frontier: a partitioned crawl frontier
///
/// Applies crawl outcomes and score updates to the revisiting queue and keeps
/// the per-partition feed topped up for crawling workers.
///
/// Without a mode flag the db worker runs on an in-process message bus that no
/// other process can attach to. Seeds given with --seed are published to its
/// crawl log, scheduled, and pushed to the feed, and each pushed batch is logged.
#[derive(Parser, Debug)]
#[command(name = "sumi-frontier")]
#[command(version = "0.1.0")]
#[command(about = "A partitioned crawl frontier", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and print it without touching storage
    #[arg(long, conflicts_with_all = ["stats", "next"])]
    dry_run: bool,

    /// Show queue statistics and exit
    #[arg(long, conflicts_with_all = ["dry_run", "next"])]
    stats: bool,

    /// Dequeue up to N requests from one partition and print them as JSON lines
    #[arg(long, value_name = "N", requires = "partition")]
    next: Option<usize>,

    /// Partition to dequeue from with --next
    #[arg(long, value_name = "P", requires = "next")]
    partition: Option<u32>,

    /// Seed URL published to the in-process crawl log at startup (repeatable)
    #[arg(long = "seed", value_name = "URL", conflicts_with_all = ["dry_run", "stats", "next"])]
    seeds: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else if let (Some(count), Some(partition)) = (cli.next, cli.partition) {
        handle_next(&config, count, partition)?;
    } else {
        handle_run(config, cli.seeds).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_frontier=info,warn"),
            1 => EnvFilter::new("sumi_frontier=debug,info"),
            2 => EnvFilter::new("sumi_frontier=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: prints the validated configuration
fn handle_dry_run(config: &Config) {
    println!("=== Sumi-Frontier Dry Run ===\n");

    println!("Storage:");
    println!("  Database: {}", config.storage.database_path);
    println!(
        "  Retries: {} tries, {}s apart",
        config.storage.retry_tries, config.storage.retry_backoff_secs
    );

    println!("\nQueue:");
    println!("  Partitions: {}", config.queue.partitions);
    println!("  Revisit interval: {}s", config.queue.revisit_interval_secs);
    println!("  Dequeue hold: {}s", config.queue.dequeue_hold_secs);

    let bus = &config.message_bus;
    println!("\nMessage bus:");
    println!("  Crawl-log partitions: {}", bus.crawl_log_partitions);
    println!("  Feed partitions: {}", bus.feed_partitions);
    println!("  Max next requests: {}", bus.max_next_requests);
    println!("  Producer batch size: {}", bus.producer_batch_size);
    println!(
        "  Groups: db={}, sw={}, scoring={}, feed={}",
        bus.crawl_log_db_group, bus.crawl_log_sw_group, bus.scoring_log_group, bus.feed_group
    );

    println!("\nWorker:");
    println!("  Crawl-log batch: {}", config.worker.crawl_log_batch);
    println!("  Scoring-log batch: {}", config.worker.scoring_log_batch);
    println!(
        "  State flush every {} cycles",
        config.worker.state_flush_interval
    );

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows queue statistics
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    let backend = SqliteRevisitingBackend::open(config)?;

    println!("Database: {}\n", config.storage.database_path);
    println!("Queued records: {}", backend.queue().count()?);
    for (partition, count) in backend.queue().partition_counts()? {
        println!("  partition {}: {}", partition, count);
    }

    Ok(())
}

/// Handles the --next mode: dequeues from one partition and prints JSON lines
fn handle_next(config: &Config, count: usize, partition: u32) -> anyhow::Result<()> {
    if partition >= config.queue.partitions {
        anyhow::bail!(
            "Partition {} out of range (queue has {})",
            partition,
            config.queue.partitions
        );
    }

    let mut backend = SqliteRevisitingBackend::open(config)?;
    backend.frontier_start()?;
    let requests = backend.get_next_requests(count, &[partition]);
    backend.frontier_stop()?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for request in &requests {
        writeln!(out, "{}", serde_json::to_string(request)?)?;
    }
    tracing::info!("Dequeued {} requests from partition {}", requests.len(), partition);

    Ok(())
}

/// Handles the main mode: runs the db worker on an in-process bus until ctrl-c
async fn handle_run(config: Config, seeds: Vec<String>) -> anyhow::Result<()> {
    let backend = SqliteRevisitingBackend::open(&config)?;
    let bus = Arc::new(MessageBus::new(&config.message_bus, Broker::new())?);
    tracing::warn!("Message bus is in-process: only seeds given on the command line reach it");

    if !seeds.is_empty() {
        let event = CrawlLogEvent::AddSeeds {
            seeds: seeds.into_iter().map(Request::new).collect(),
        };
        let mut producer = bus.crawl_log().producer();
        producer
            .send(event.key().map(str::as_bytes), vec![codec::encode(&event)?])
            .await?;
        producer.close().await?;
        tracing::info!("Published seeds to the crawl log");
    }

    let mut worker = DbWorker::new(backend, bus, WorkerSettings::from_config(&config))?;

    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        tracing::info!("Received ctrl-c, stopping");
        let _ = shutdown.send(true);
    });

    worker.run(rx).await?;
    tracing::info!("Frontier stopped");
    Ok(())
}
