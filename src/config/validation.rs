use crate::config::types::{Config, MessageBusConfig, QueueConfig, StorageConfig, WorkerConfig};
use crate::ConfigError;

/// Upper bound for any partition count
pub const MAX_PARTITIONS: u32 = 1024;

/// Longest allowed consumer poll (milliseconds)
pub const MAX_POLL_TIMEOUT_MS: u64 = 10_000;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_storage_config(&config.storage)?;
    validate_queue_config(&config.queue)?;
    validate_message_bus_config(&config.message_bus)?;
    validate_worker_config(&config.worker)?;

    // Feed partitions map 1:1 onto queue partitions
    if config.message_bus.feed_partitions != config.queue.partitions {
        return Err(ConfigError::Validation(format!(
            "feed_partitions ({}) must equal queue partitions ({})",
            config.message_bus.feed_partitions, config.queue.partitions
        )));
    }

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.retry_tries < 1 {
        return Err(ConfigError::Validation(format!(
            "retry_tries must be >= 1, got {}",
            config.retry_tries
        )));
    }

    Ok(())
}

fn validate_queue_config(config: &QueueConfig) -> Result<(), ConfigError> {
    validate_partition_count("partitions", config.partitions)
}

fn validate_message_bus_config(config: &MessageBusConfig) -> Result<(), ConfigError> {
    validate_partition_count("crawl_log_partitions", config.crawl_log_partitions)?;
    validate_partition_count("feed_partitions", config.feed_partitions)?;

    if config.max_next_requests < 1 {
        return Err(ConfigError::Validation(format!(
            "max_next_requests must be >= 1, got {}",
            config.max_next_requests
        )));
    }

    if config.poll_timeout_ms > MAX_POLL_TIMEOUT_MS {
        return Err(ConfigError::Validation(format!(
            "poll_timeout_ms must be <= {}, got {}",
            MAX_POLL_TIMEOUT_MS, config.poll_timeout_ms
        )));
    }

    for (name, group) in [
        ("crawl_log_db_group", &config.crawl_log_db_group),
        ("crawl_log_sw_group", &config.crawl_log_sw_group),
        ("scoring_log_group", &config.scoring_log_group),
        ("feed_group", &config.feed_group),
    ] {
        if group.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }

    Ok(())
}

fn validate_worker_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.crawl_log_batch < 1 || config.scoring_log_batch < 1 {
        return Err(ConfigError::Validation(
            "log batch sizes must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_partition_count(name: &str, count: u32) -> Result<(), ConfigError> {
    if count < 1 || count > MAX_PARTITIONS {
        return Err(ConfigError::Validation(format!(
            "{} must be between 1 and {}, got {}",
            name, MAX_PARTITIONS, count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_partition_count() {
        assert!(validate_partition_count("p", 1).is_ok());
        assert!(validate_partition_count("p", 1024).is_ok());

        assert!(validate_partition_count("p", 0).is_err());
        assert!(validate_partition_count("p", 1025).is_err());
    }

    #[test]
    fn test_validate_storage_config() {
        let mut config = StorageConfig {
            database_path: "./frontier.db".to_string(),
            retry_tries: 5,
            retry_backoff_secs: 5,
        };
        assert!(validate_storage_config(&config).is_ok());

        config.retry_tries = 0;
        assert!(validate_storage_config(&config).is_err());

        config.retry_tries = 1;
        config.database_path.clear();
        assert!(validate_storage_config(&config).is_err());
    }
}
