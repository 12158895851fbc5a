//! Buffered stream producer

use crate::messagebus::broker::Broker;
use crate::messagebus::{BusError, BusResult, StreamProducer};
use crate::partition::Partitioner;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Producer for one stream
///
/// Keyed producers route each message with the stream's partitioner; unkeyed
/// producers spread messages round-robin. Messages are buffered locally and
/// appended in send order on flush.
pub struct LogProducer {
    broker: Arc<Broker>,
    topic: String,
    partitioner: Option<Partitioner>,
    partition_count: u32,
    next_partition: u32,
    buffer: Vec<(u32, Vec<u8>)>,
    batch_size: usize,
    closed: bool,
}

impl LogProducer {
    pub(crate) fn keyed(
        broker: Arc<Broker>,
        topic: &str,
        partitioner: Partitioner,
        batch_size: usize,
    ) -> Self {
        let partition_count = partitioner.partitions().len() as u32;
        Self::build(broker, topic, Some(partitioner), partition_count, batch_size)
    }

    pub(crate) fn unkeyed(
        broker: Arc<Broker>,
        topic: &str,
        partition_count: u32,
        batch_size: usize,
    ) -> Self {
        Self::build(broker, topic, None, partition_count, batch_size)
    }

    fn build(
        broker: Arc<Broker>,
        topic: &str,
        partitioner: Option<Partitioner>,
        partition_count: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            broker,
            topic: topic.to_string(),
            partitioner,
            partition_count: partition_count.max(1),
            next_partition: 0,
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
            closed: false,
        }
    }

    /// Partition a keyed message would go to
    pub fn partition(&self, key: Option<&[u8]>) -> Option<u32> {
        self.partitioner.as_ref().map(|p| p.partition(key))
    }

    /// Messages sent but not yet flushed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn route(&mut self, key: Option<&[u8]>) -> u32 {
        match &self.partitioner {
            Some(partitioner) => partitioner.partition(key),
            None => {
                let partition = self.next_partition;
                self.next_partition = (self.next_partition + 1) % self.partition_count;
                partition
            }
        }
    }

    /// Appends the buffer, one broker call per partition
    ///
    /// Messages of partitions that could not be written stay buffered.
    fn write_buffer(&mut self) -> BusResult<()> {
        let mut by_partition: BTreeMap<u32, Vec<Vec<u8>>> = BTreeMap::new();
        for (partition, message) in self.buffer.drain(..) {
            by_partition.entry(partition).or_default().push(message);
        }

        let mut failure = None;
        for (partition, messages) in by_partition {
            if failure.is_none() {
                match self.broker.append(&self.topic, partition, &messages) {
                    Ok(_) => continue,
                    Err(e) => failure = Some(e),
                }
            }
            self.buffer
                .extend(messages.into_iter().map(|message| (partition, message)));
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StreamProducer for LogProducer {
    async fn send(&mut self, key: Option<&[u8]>, messages: Vec<Vec<u8>>) -> BusResult<()> {
        if self.closed {
            return Err(BusError::Closed);
        }
        for message in messages {
            let partition = self.route(key);
            self.buffer.push((partition, message));
        }
        if self.buffer.len() >= self.batch_size {
            self.write_buffer()?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> BusResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.write_buffer()
    }

    async fn close(&mut self) -> BusResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.flush().await;
        self.closed = true;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_topic(partitions: u32) -> Arc<Broker> {
        let broker = Broker::new();
        broker.create_topic("log", partitions).unwrap();
        broker
    }

    fn end_offsets(broker: &Broker, partitions: u32) -> Vec<u64> {
        (0..partitions)
            .map(|p| broker.end_offset("log", p).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_keyed_messages_share_a_partition() {
        let broker = broker_with_topic(4);
        let partitioner = Partitioner::fingerprint(4).unwrap();
        let expected = partitioner.partition(Some(b"key".as_slice()));
        let mut producer = LogProducer::keyed(Arc::clone(&broker), "log", partitioner, 100);

        producer
            .send(Some(b"key".as_slice()), vec![vec![1], vec![2]])
            .await
            .unwrap();
        producer.send(Some(b"key".as_slice()), vec![vec![3]]).await.unwrap();
        producer.flush().await.unwrap();

        assert_eq!(
            broker.fetch("log", expected, 0, 10).unwrap(),
            vec![vec![1], vec![2], vec![3]]
        );
        assert_eq!(producer.partition(Some(b"key".as_slice())), Some(expected));
    }

    #[tokio::test]
    async fn test_sends_buffer_until_batch_size() {
        let broker = broker_with_topic(1);
        let mut producer = LogProducer::unkeyed(Arc::clone(&broker), "log", 1, 3);

        producer.send(None, vec![vec![1], vec![2]]).await.unwrap();
        assert_eq!(broker.end_offset("log", 0).unwrap(), 0);
        assert_eq!(producer.buffered(), 2);

        producer.send(None, vec![vec![3]]).await.unwrap();
        assert_eq!(broker.end_offset("log", 0).unwrap(), 3);
        assert_eq!(producer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_unkeyed_round_robin() {
        let broker = broker_with_topic(3);
        let mut producer = LogProducer::unkeyed(Arc::clone(&broker), "log", 3, 100);

        producer
            .send(None, vec![vec![0], vec![1], vec![2], vec![3]])
            .await
            .unwrap();
        producer.flush().await.unwrap();

        assert_eq!(end_offsets(&broker, 3), vec![2, 1, 1]);
        assert_eq!(producer.partition(None), None);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_messages() {
        let broker = broker_with_topic(1);
        let mut producer = LogProducer::unkeyed(Arc::clone(&broker), "log", 1, 100);
        producer.send(None, vec![vec![1]]).await.unwrap();

        broker.disconnect();
        assert!(matches!(
            producer.flush().await,
            Err(BusError::Disconnected)
        ));
        assert_eq!(producer.buffered(), 1);

        broker.reconnect();
        producer.close().await.unwrap();
        assert_eq!(broker.end_offset("log", 0).unwrap(), 1);
        assert!(matches!(
            producer.send(None, vec![vec![2]]).await,
            Err(BusError::Closed)
        ));
    }
}
