/// Crawl state definitions for tracking a fingerprint through crawl cycles
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the crawl state of a single fingerprint
///
/// The numeric codes are the persisted representation shared with every
/// storage backend, so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    /// Never seen by the frontier, or seen but not yet scheduled
    #[default]
    NotCrawled,

    /// A live queue record exists; a worker may be holding it
    Queued,

    /// Last crawl completed successfully
    Crawled,

    /// Last crawl attempt failed
    Error,
}

impl CrawlState {
    /// Returns true if this is a terminal state for the current crawl cycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Crawled | Self::Error)
    }

    /// Returns true if the fingerprint is waiting in the queue
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }

    /// Checks whether moving from `self` to `next` is allowed
    ///
    /// Cycles run NOT_CRAWLED → QUEUED → {CRAWLED, ERROR} → QUEUED. Nothing
    /// ever moves back to NOT_CRAWLED. Re-entering the same state is accepted
    /// because cache updates are idempotent.
    pub fn can_transition_to(&self, next: CrawlState) -> bool {
        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Self::NotCrawled) => false,
            (Self::NotCrawled, Self::Queued) => true,
            (Self::Queued, Self::Crawled | Self::Error) => true,
            (Self::Crawled | Self::Error, Self::Queued) => true,
            // A crawl may finish for a URL the frontier never queued (seeded
            // straight into a spider) and a retry may flip the outcome.
            (Self::NotCrawled, Self::Crawled | Self::Error) => true,
            (Self::Crawled, Self::Error) | (Self::Error, Self::Crawled) => true,
            _ => false,
        }
    }

    /// Converts the crawl state to its persisted integer code
    pub fn to_db_code(&self) -> i64 {
        match self {
            Self::NotCrawled => 0,
            Self::Queued => 1,
            Self::Crawled => 2,
            Self::Error => 3,
        }
    }

    /// Parses a crawl state from its persisted integer code
    ///
    /// Returns None if the code doesn't match any known state.
    pub fn from_db_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::NotCrawled),
            1 => Some(Self::Queued),
            2 => Some(Self::Crawled),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// Short lowercase name, used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotCrawled => "not_crawled",
            Self::Queued => "queued",
            Self::Crawled => "crawled",
            Self::Error => "error",
        }
    }

    /// Returns all possible crawl states
    pub fn all_states() -> [Self; 4] {
        [Self::NotCrawled, Self::Queued, Self::Crawled, Self::Error]
    }
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
