//! Requests, responses and their frontier metadata
//!
//! A `Request` is created on seed ingestion or link extraction, mutated by the
//! scheduling backend before each (re)schedule, and superseded by the next
//! schedule of the same fingerprint.

mod fingerprint;

pub use fingerprint::fingerprint;

use crate::state::CrawlState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// HTTP method used when none is recorded
pub const DEFAULT_METHOD: &str = "GET";

/// Score used when upstream scoring never assigned one
pub const DEFAULT_SCORE: f64 = 1.0;

/// Frontier bookkeeping carried by every request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Crawl state as last read from, or written to, the state cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CrawlState>,

    /// Id of the live queue record, assigned when the request is dequeued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_record_id: Option<i64>,

    /// Earliest time (epoch seconds) the request may be dequeued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<i64>,

    /// Link distance from the seed that led here
    #[serde(default)]
    pub depth: u32,
}

/// A URL the frontier may hand to a crawling worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub fingerprint: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_score")]
    pub score: f64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub meta: RequestMeta,
}

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

fn default_score() -> f64 {
    DEFAULT_SCORE
}

impl Request {
    /// Creates a GET request for `url`, fingerprinting its canonical form
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            fingerprint: fingerprint(&url),
            url,
            method: default_method(),
            score: DEFAULT_SCORE,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            meta: RequestMeta::default(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_state(mut self, state: CrawlState) -> Self {
        self.meta.state = Some(state);
        self
    }

    /// Scheduled earliest-eligible time, if one was set
    pub fn crawl_at(&self) -> Option<i64> {
        self.meta.scheduled_at
    }

    /// Current crawl state, `NotCrawled` when nothing was recorded yet
    pub fn state(&self) -> CrawlState {
        self.meta.state.unwrap_or_default()
    }
}

/// Outcome of a crawl, reported back to the frontier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The request that produced this response; its `meta.state` carries the
    /// terminal state decided by the crawling worker
    pub request: Request,
    pub status_code: u16,
}

impl Response {
    pub fn new(request: Request, status_code: u16) -> Self {
        Self {
            request,
            status_code,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.request.fingerprint
    }
}
