//! In-process partitioned log broker
//!
//! Topics are split into partitions of append-only message logs. Consumer
//! groups keep one committed offset per partition. All operations fail with
//! [`BusError::Disconnected`] while the broker is disconnected.

use crate::messagebus::{BusError, BusResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

#[derive(Default)]
struct BrokerState {
    connected: bool,
    topics: HashMap<String, Vec<Vec<Vec<u8>>>>,
    committed: HashMap<(String, String, u32), u64>,
    heartbeats: HashMap<(String, String), DateTime<Utc>>,
}

/// Shared log broker
pub struct Broker {
    state: Mutex<BrokerState>,
    appended: Notify,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                connected: true,
                ..Default::default()
            }),
            appended: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(&self) -> BusResult<MutexGuard<'_, BrokerState>> {
        let state = self.lock();
        if state.connected {
            Ok(state)
        } else {
            Err(BusError::Disconnected)
        }
    }

    /// Creates `topic` with `partitions` partitions unless it already exists
    ///
    /// Returns the partition count the topic actually has.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> BusResult<u32> {
        let mut state = self.connected()?;
        let logs = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);
        Ok(logs.len() as u32)
    }

    pub fn partition_count(&self, topic: &str) -> BusResult<u32> {
        let state = self.connected()?;
        state
            .topics
            .get(topic)
            .map(|logs| logs.len() as u32)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))
    }

    /// Appends messages to one partition, in order
    ///
    /// Returns the partition's new end offset and wakes waiting consumers.
    pub fn append(&self, topic: &str, partition: u32, messages: &[Vec<u8>]) -> BusResult<u64> {
        let end = {
            let mut state = self.connected()?;
            let log = partition_log_mut(&mut state, topic, partition)?;
            log.extend_from_slice(messages);
            log.len() as u64
        };
        self.appended.notify_waiters();
        Ok(end)
    }

    /// Reads up to `max` messages starting at `offset`
    pub fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> BusResult<Vec<Vec<u8>>> {
        let state = self.connected()?;
        let log = partition_log(&state, topic, partition)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(log.len());
        Ok(log[start..].iter().take(max).cloned().collect())
    }

    /// Offset one past the last message of a partition
    pub fn end_offset(&self, topic: &str, partition: u32) -> BusResult<u64> {
        let state = self.connected()?;
        Ok(partition_log(&state, topic, partition)?.len() as u64)
    }

    /// Committed offset of `group` on a partition, 0 when nothing was committed
    pub fn committed(&self, group: &str, topic: &str, partition: u32) -> BusResult<u64> {
        let state = self.connected()?;
        partition_log(&state, topic, partition)?;
        Ok(state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0))
    }

    pub fn commit(&self, group: &str, topic: &str, partition: u32, offset: u64) -> BusResult<()> {
        let mut state = self.connected()?;
        partition_log(&state, topic, partition)?;
        state
            .committed
            .insert((group.to_string(), topic.to_string(), partition), offset);
        Ok(())
    }

    /// Lag of `group` on every partition of `topic`, as (partition, lag)
    pub fn lags(&self, group: &str, topic: &str) -> BusResult<Vec<(u32, u64)>> {
        let state = self.connected()?;
        let logs = state
            .topics
            .get(topic)
            .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;

        Ok(logs
            .iter()
            .enumerate()
            .map(|(partition, log)| {
                let partition = partition as u32;
                let committed = state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), partition))
                    .copied()
                    .unwrap_or(0);
                (partition, (log.len() as u64).saturating_sub(committed))
            })
            .collect())
    }

    /// Records a liveness heartbeat for a group member
    pub fn heartbeat(&self, group: &str, member: &str) -> BusResult<()> {
        let mut state = self.connected()?;
        state
            .heartbeats
            .insert((group.to_string(), member.to_string()), Utc::now());
        Ok(())
    }

    pub fn last_heartbeat(&self, group: &str, member: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .heartbeats
            .get(&(group.to_string(), member.to_string()))
            .copied()
    }

    pub fn disconnect(&self) {
        tracing::warn!("Broker disconnected");
        self.lock().connected = false;
    }

    pub fn reconnect(&self) {
        tracing::info!("Broker reconnected");
        self.lock().connected = true;
        self.appended.notify_waiters();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Future completing on the next append
    ///
    /// Appends made after this call but before the future is polled still wake it.
    pub fn appended(&self) -> Notified<'_> {
        self.appended.notified()
    }
}

fn partition_log<'a>(
    state: &'a BrokerState,
    topic: &str,
    partition: u32,
) -> BusResult<&'a Vec<Vec<u8>>> {
    let logs = state
        .topics
        .get(topic)
        .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
    logs.get(partition as usize)
        .ok_or_else(|| BusError::PartitionNotAssigned {
            topic: topic.to_string(),
            partition,
        })
}

fn partition_log_mut<'a>(
    state: &'a mut BrokerState,
    topic: &str,
    partition: u32,
) -> BusResult<&'a mut Vec<Vec<u8>>> {
    let logs = state
        .topics
        .get_mut(topic)
        .ok_or_else(|| BusError::UnknownTopic(topic.to_string()))?;
    logs.get_mut(partition as usize)
        .ok_or_else(|| BusError::PartitionNotAssigned {
            topic: topic.to_string(),
            partition,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_fetch_keep_order() {
        let broker = Broker::new();
        broker.create_topic("log", 2).unwrap();

        broker.append("log", 1, &[b"a".to_vec(), b"b".to_vec()]).unwrap();
        broker.append("log", 1, &[b"c".to_vec()]).unwrap();

        let messages = broker.fetch("log", 1, 1, 10).unwrap();
        assert_eq!(messages, vec![b"b".to_vec(), b"c".to_vec()]);
        assert!(broker.fetch("log", 0, 0, 10).unwrap().is_empty());
        assert!(broker.fetch("log", 1, 99, 10).unwrap().is_empty());
    }

    #[test]
    fn test_create_topic_keeps_existing_layout() {
        let broker = Broker::new();
        assert_eq!(broker.create_topic("log", 3).unwrap(), 3);
        assert_eq!(broker.create_topic("log", 5).unwrap(), 3);
    }

    #[test]
    fn test_lag_follows_commits() {
        let broker = Broker::new();
        broker.create_topic("feed", 2).unwrap();
        broker
            .append("feed", 0, &[vec![1], vec![2], vec![3]])
            .unwrap();

        assert_eq!(broker.lags("g", "feed").unwrap(), vec![(0, 3), (1, 0)]);
        broker.commit("g", "feed", 0, 2).unwrap();
        assert_eq!(broker.lags("g", "feed").unwrap(), vec![(0, 1), (1, 0)]);
        assert_eq!(broker.committed("other", "feed", 0).unwrap(), 0);
    }

    #[test]
    fn test_unknown_topic_and_partition() {
        let broker = Broker::new();
        broker.create_topic("log", 1).unwrap();

        assert!(matches!(
            broker.end_offset("missing", 0),
            Err(BusError::UnknownTopic(_))
        ));
        assert!(matches!(
            broker.append("log", 4, &[]),
            Err(BusError::PartitionNotAssigned { partition: 4, .. })
        ));
    }

    #[test]
    fn test_disconnect_fails_operations() {
        let broker = Broker::new();
        broker.create_topic("log", 1).unwrap();

        broker.disconnect();
        assert!(matches!(
            broker.append("log", 0, &[vec![1]]),
            Err(BusError::Disconnected)
        ));
        assert!(broker.heartbeat("g", "m").is_err());

        broker.reconnect();
        assert_eq!(broker.append("log", 0, &[vec![1]]).unwrap(), 1);
        broker.heartbeat("g", "m").unwrap();
        assert!(broker.last_heartbeat("g", "m").is_some());
    }
}
