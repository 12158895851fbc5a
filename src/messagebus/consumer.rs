//! Partition-aware stream consumer

use crate::messagebus::broker::Broker;
use crate::messagebus::heartbeat::Heartbeat;
use crate::messagebus::{error_chain, BusError, BusResult, StreamConsumer};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

static NEXT_MEMBER: AtomicU64 = AtomicU64::new(1);

/// Connection state shared by a consumer and its heartbeat task
pub(crate) struct ConsumerConnection {
    broker: Arc<Broker>,
    topic: String,
    group: String,
    member: String,
    partitions: Vec<u32>,
    positions: HashMap<u32, u64>,
    next_start: usize,
    closed: bool,
}

impl ConsumerConnection {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn heartbeat(&self) -> BusResult<()> {
        self.broker.heartbeat(&self.group, &self.member)
    }

    /// Reads up to `count` messages, rotating the starting partition
    ///
    /// Positions only move once every fetch of the poll has succeeded, so a
    /// failed poll is redelivered in full.
    fn poll(&mut self, count: usize) -> BusResult<Vec<Vec<u8>>> {
        let mut messages = Vec::new();
        let mut advanced = Vec::new();
        let total = self.partitions.len();

        for i in 0..total {
            if messages.len() >= count {
                break;
            }
            let partition = self.partitions[(self.next_start + i) % total];
            let position = self.positions.get(&partition).copied().unwrap_or(0);
            let batch = self
                .broker
                .fetch(&self.topic, partition, position, count - messages.len())?;
            if !batch.is_empty() {
                advanced.push((partition, position + batch.len() as u64));
                messages.extend(batch);
            }
        }
        self.positions.extend(advanced);
        self.next_start = (self.next_start + 1) % total.max(1);

        if !messages.is_empty() {
            self.commit()?;
        }
        Ok(messages)
    }

    fn commit(&self) -> BusResult<()> {
        for (&partition, &offset) in &self.positions {
            self.broker
                .commit(&self.group, &self.topic, partition, offset)?;
        }
        Ok(())
    }
}

/// Consumer of one stream, assigned a single partition or all of them
///
/// Positions start at the group's committed offsets and are committed after
/// every non-empty poll.
pub struct LogConsumer {
    broker: Arc<Broker>,
    connection: Arc<Mutex<ConsumerConnection>>,
    heartbeat: Heartbeat,
    member: String,
    group: String,
    partitions: Vec<u32>,
}

impl LogConsumer {
    /// Joins `group` on `topic` and starts the heartbeat
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn open(
        broker: Arc<Broker>,
        topic: &str,
        group: &str,
        partition: Option<u32>,
        heartbeat_interval: Duration,
    ) -> BusResult<Self> {
        let count = broker.partition_count(topic)?;
        let partitions: Vec<u32> = match partition {
            Some(p) if p < count => vec![p],
            Some(p) => {
                return Err(BusError::PartitionNotAssigned {
                    topic: topic.to_string(),
                    partition: p,
                })
            }
            None => (0..count).collect(),
        };

        let mut positions = HashMap::new();
        for &p in &partitions {
            positions.insert(p, broker.committed(group, topic, p)?);
        }

        let member = format!(
            "{}-{}-{}",
            topic,
            partition.map_or_else(|| "all".to_string(), |p| p.to_string()),
            NEXT_MEMBER.fetch_add(1, Ordering::Relaxed)
        );

        let connection = Arc::new(Mutex::new(ConsumerConnection {
            broker: Arc::clone(&broker),
            topic: topic.to_string(),
            group: group.to_string(),
            member: member.clone(),
            partitions: partitions.clone(),
            positions,
            next_start: 0,
            closed: false,
        }));
        let heartbeat = Heartbeat::spawn(Arc::clone(&connection), member.clone(), heartbeat_interval)?;

        tracing::debug!("Consumer {} joined group {}", member, group);
        Ok(Self {
            broker,
            connection,
            heartbeat,
            member,
            group: group.to_string(),
            partitions,
        })
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn partitions(&self) -> &[u32] {
        &self.partitions
    }
}

#[async_trait]
impl StreamConsumer for LogConsumer {
    async fn get_messages(&self, timeout: Duration, count: usize) -> BusResult<Vec<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let appended = self.broker.appended();
            {
                let mut connection = self.connection.lock().await;
                if connection.closed {
                    return Err(BusError::Closed);
                }
                let messages = connection.poll(count)?;
                if !messages.is_empty() || count == 0 {
                    return Ok(messages);
                }
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn get_offset(&self, partition: u32) -> BusResult<u64> {
        let connection = self.connection.lock().await;
        connection
            .positions
            .get(&partition)
            .copied()
            .ok_or_else(|| BusError::PartitionNotAssigned {
                topic: connection.topic.clone(),
                partition,
            })
    }

    async fn commit(&self) -> BusResult<()> {
        let connection = self.connection.lock().await;
        if connection.closed {
            return Err(BusError::Closed);
        }
        connection.commit()
    }

    async fn close(&mut self) {
        self.heartbeat.stop();

        let mut connection = self.connection.lock().await;
        if connection.closed {
            return;
        }
        if let Err(e) = connection.commit() {
            tracing::warn!(
                "Final commit of {} failed, positions may be redelivered: {}",
                self.member,
                error_chain(&e)
            );
        }
        connection.closed = true;
        tracing::debug!("Consumer {} closed", self.member);
    }
}
