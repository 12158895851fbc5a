//! Bounded retry for storage units of work
//!
//! Every storage-touching operation runs its unit of work through
//! [`RetryPolicy::run`]. The unit of work owns its transaction, so an error
//! drops the transaction and rolls it back before the next attempt starts.

use crate::storage::traits::{StorageError, StorageResult};
use std::time::Duration;

/// Number of attempts used when nothing is configured
pub const DEFAULT_TRIES: u32 = 5;

/// Pause between attempts used when nothing is configured
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Fixed-backoff retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_tries: u32,
    backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_TRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; `max_tries` is clamped to at least one attempt
    pub fn new(max_tries: u32, backoff: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            backoff,
        }
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Runs `op` until it succeeds or the attempts run out
    ///
    /// Between attempts the thread sleeps for the backoff interval. The last
    /// error is returned wrapped in [`StorageError::RetriesExhausted`].
    ///
    /// # Arguments
    ///
    /// * `operation` - Name used in log lines
    /// * `op` - The unit of work; it must roll back its own writes on error
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> StorageResult<T>
    where
        F: FnMut() -> StorageResult<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::error!(
                        "{} failed on attempt {}/{}: {}",
                        operation,
                        attempt,
                        self.max_tries,
                        e
                    );
                    if attempt >= self.max_tries {
                        return Err(StorageError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    std::thread::sleep(self.backoff);
                    tracing::info!("{}: tries left {}", operation, self.max_tries - attempt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_tries(), 5);
        assert_eq!(policy.backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_tries_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_tries(), 1);
    }

    #[test]
    fn test_success_on_first_attempt() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let result = policy.run("op", || {
            calls += 1;
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let result = policy.run("op", || {
            calls += 1;
            if calls < 3 {
                Err(StorageError::Database("locked".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhaustion_after_exact_attempts_with_spacing() {
        let backoff = Duration::from_millis(20);
        let policy = RetryPolicy::new(5, backoff);
        let mut calls = 0;
        let start = Instant::now();

        let result: StorageResult<()> = policy.run("op", || {
            calls += 1;
            Err(StorageError::Database("down".to_string()))
        });

        assert_eq!(calls, 5);
        // four pauses between five attempts
        assert!(start.elapsed() >= backoff * 4);
        match result {
            Err(StorageError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 5);
                assert!(matches!(*source, StorageError::Database(_)));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }
}
