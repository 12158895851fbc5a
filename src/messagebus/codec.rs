//! Wire format of the three streams
//!
//! Every message is one JSON document. Crawl-log and scoring-log events are
//! internally tagged by `type`; feed messages are plain requests.

use crate::messagebus::BusResult;
use crate::request::{Request, Response};
use serde::{Deserialize, Serialize};

/// Events crawling workers publish on the crawl log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrawlLogEvent {
    AddSeeds { seeds: Vec<Request> },
    PageCrawled { response: Response },
    LinksExtracted { request: Request, links: Vec<Request> },
    RequestError { request: Request, error: String },
}

impl CrawlLogEvent {
    /// Fingerprint used as the partition key
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::AddSeeds { seeds } => seeds.first().map(|s| s.fingerprint.as_str()),
            Self::PageCrawled { response } => Some(response.fingerprint()),
            Self::LinksExtracted { request, .. } | Self::RequestError { request, .. } => {
                Some(request.fingerprint.as_str())
            }
        }
    }
}

/// Events the scoring worker publishes on the scoring log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoringEvent {
    UpdateScore {
        request: Request,
        score: f64,
        schedule: bool,
    },
}

pub fn encode<T: Serialize>(message: &T) -> BusResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_crawl_log(bytes: &[u8]) -> BusResult<CrawlLogEvent> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn decode_scoring(bytes: &[u8]) -> BusResult<ScoringEvent> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn decode_request(bytes: &[u8]) -> BusResult<Request> {
    Ok(serde_json::from_slice(bytes)?)
}
