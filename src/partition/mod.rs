//! Deterministic key → partition mapping
//!
//! The same `Partitioner` value is handed to the revisiting queue and to the
//! feed stream producer, so a host's work lands in the same partition in
//! storage and on the bus.
//!
//! # Algorithm
//!
//! 1. Derive a key from the request (hostname or fingerprint)
//! 2. Hash it with CRC-32
//! 3. Mask to 31 bits so signed and unsigned readers agree
//! 4. Take the result modulo the number of partitions and index the list
//!
//! A missing key degrades to the first partition. Every such request collapses
//! onto that one partition, so the degradation is always logged.

use crate::request::Request;
use crate::url::hostname_of;
use crate::ConfigError;

/// Mask applied to every hash before the modulo
pub const HASH_MASK: u32 = 0x7fff_ffff;

/// How a partition key is derived from a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionKey {
    /// Lowercase hostname: same host, same partition
    #[default]
    Hostname,

    /// Full fingerprint: uniform spreading without host locality
    Fingerprint,
}

/// Maps keys onto a fixed list of partition ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitioner {
    partitions: Vec<u32>,
    key: PartitionKey,
}

impl Partitioner {
    /// Creates a partitioner over an explicit partition list
    ///
    /// # Returns
    ///
    /// * `Err(ConfigError)` - The partition list is empty
    pub fn new(partitions: Vec<u32>, key: PartitionKey) -> Result<Self, ConfigError> {
        if partitions.is_empty() {
            return Err(ConfigError::Validation(
                "partitioner needs at least one partition".to_string(),
            ));
        }
        Ok(Self { partitions, key })
    }

    /// Creates a partitioner over `0..count`
    pub fn with_count(count: u32, key: PartitionKey) -> Result<Self, ConfigError> {
        Self::new((0..count).collect(), key)
    }

    /// Hostname-keyed partitioner over `0..count`
    pub fn hostname(count: u32) -> Result<Self, ConfigError> {
        Self::with_count(count, PartitionKey::Hostname)
    }

    /// Fingerprint-keyed partitioner over `0..count`
    pub fn fingerprint(count: u32) -> Result<Self, ConfigError> {
        Self::with_count(count, PartitionKey::Fingerprint)
    }

    pub fn partitions(&self) -> &[u32] {
        &self.partitions
    }

    pub fn key_kind(&self) -> PartitionKey {
        self.key
    }

    /// The partition every underivable key falls back to
    pub fn default_partition(&self) -> u32 {
        self.partitions[0]
    }

    /// 32-bit CRC of the key bytes
    pub fn hash(key: &[u8]) -> u32 {
        crc32fast::hash(key)
    }

    /// Maps a key onto this partitioner's partition list
    pub fn partition(&self, key: Option<&[u8]>) -> u32 {
        self.partition_among(key, &self.partitions)
    }

    /// Maps a key onto an explicit partition list
    ///
    /// The id is picked by position in `partitions`, not by value. An empty
    /// list falls back to the configured one.
    pub fn partition_among(&self, key: Option<&[u8]>, partitions: &[u32]) -> u32 {
        let partitions = if partitions.is_empty() {
            self.partitions.as_slice()
        } else {
            partitions
        };

        match key {
            Some(key) => {
                let idx = (Self::hash(key) & HASH_MASK) as usize % partitions.len();
                partitions[idx]
            }
            None => {
                tracing::warn!(
                    partition = partitions[0],
                    "No partition key, falling back to the first partition"
                );
                partitions[0]
            }
        }
    }

    /// Derives this partitioner's key from a request
    ///
    /// Returns `None` when a hostname cannot be extracted from the URL.
    pub fn get_key(&self, request: &Request) -> Option<Vec<u8>> {
        match self.key {
            PartitionKey::Hostname => hostname_of(&request.url).map(String::into_bytes),
            PartitionKey::Fingerprint => {
                if request.fingerprint.is_empty() {
                    None
                } else {
                    Some(request.fingerprint.as_bytes().to_vec())
                }
            }
        }
    }

    /// Convenience for `partition(get_key(request))`
    pub fn partition_for(&self, request: &Request) -> u32 {
        let key = self.get_key(request);
        self.partition(key.as_deref())
    }
}

/// Secondary hash bucket of a URL's hostname, 0 when there is no hostname
pub fn host_bucket(url: &str) -> u32 {
    hostname_of(url)
        .map(|host| Partitioner::hash(host.as_bytes()) & HASH_MASK)
        .unwrap_or(0)
}
