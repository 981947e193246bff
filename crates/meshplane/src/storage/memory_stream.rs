use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::MeshError;
use crate::hash::partition_for_key;
use crate::record::ConsumerRecord;
use crate::stream::{StreamSink, StreamSource};
use crate::types::{Topic, TopicPartition};

/// In-memory event stream broker for testing.
///
/// Topics are created on first write with `default_partitions` partitions.
/// Keys are placed with [`partition_for_key`]. Committed offsets are kept per
/// consumer group, and every commit is logged for inspection.
pub struct MemoryBroker {
    inner: Mutex<BrokerInner>,
    notify: Notify,
    default_partitions: i32,
    send_failures_remaining: AtomicU32,
}

#[derive(Default)]
struct BrokerInner {
    topics: HashMap<Topic, Vec<PartitionLog>>,
    committed: HashMap<(String, TopicPartition), i64>,
    commit_log: Vec<CommitEntry>,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<ConsumerRecord>,
    next_offset: i64,
}

impl PartitionLog {
    fn start_offset(&self) -> i64 {
        self.records
            .first()
            .map(|r| r.offset)
            .unwrap_or(self.next_offset)
    }
}

/// One logged offset commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub group_id: String,
    pub partition: TopicPartition,
    pub offset: i64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    pub fn with_partitions(default_partitions: i32) -> Self {
        assert!(
            default_partitions >= 1,
            "default_partitions must be >= 1, got {default_partitions}"
        );
        Self {
            inner: Mutex::new(BrokerInner::default()),
            notify: Notify::new(),
            default_partitions,
            send_failures_remaining: AtomicU32::new(0),
        }
    }

    /// Create a topic with an explicit partition count. No effect if the
    /// topic exists.
    pub fn create_topic(&self, topic: impl Into<String>, partitions: i32) {
        let mut inner = self.inner.lock();
        inner
            .topics
            .entry(Topic::new(topic))
            .or_insert_with(|| (0..partitions).map(|_| PartitionLog::default()).collect());
    }

    /// Move the write position of an empty partition, as if earlier offsets
    /// had been written and compacted away.
    pub fn set_next_offset(&self, partition: &TopicPartition, offset: i64) {
        let mut inner = self.inner.lock();
        let log = Self::log_mut(&mut inner, partition, self.default_partitions);
        if log.records.is_empty() {
            log.next_offset = offset;
        }
    }

    /// Append a record to the partition chosen by its key.
    pub fn produce(&self, topic: &Topic, key: &str, payload: &[u8]) -> (i32, i64) {
        let partitions = {
            let mut inner = self.inner.lock();
            Self::partitions_mut(&mut inner, topic, self.default_partitions).len() as i32
        };
        let partition = partition_for_key(key, partitions);
        let offset = self.produce_to(&TopicPartition::new(topic.as_str(), partition), key, payload);
        (partition, offset)
    }

    /// Append a record to a specific partition, returning its offset.
    pub fn produce_to(&self, partition: &TopicPartition, key: &str, payload: &[u8]) -> i64 {
        let offset = {
            let mut inner = self.inner.lock();
            let log = Self::log_mut(&mut inner, partition, self.default_partitions);
            let offset = log.next_offset;
            log.records.push(ConsumerRecord {
                key: key.to_string(),
                payload: payload.to_vec(),
                topic: partition.topic.clone(),
                partition: partition.partition,
                offset,
                timestamp: Some(Utc::now()),
            });
            log.next_offset += 1;
            offset
        };
        self.notify.notify_waiters();
        offset
    }

    /// Fail the next `count` sends with a transport error.
    pub fn fail_next_sends(&self, count: u32) {
        self.send_failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Every record written to `topic`, ordered by partition then offset.
    pub fn records(&self, topic: &Topic) -> Vec<ConsumerRecord> {
        let inner = self.inner.lock();
        inner
            .topics
            .get(topic)
            .map(|logs| logs.iter().flat_map(|l| l.records.clone()).collect())
            .unwrap_or_default()
    }

    pub fn committed(&self, group_id: &str, partition: &TopicPartition) -> Option<i64> {
        let inner = self.inner.lock();
        inner
            .committed
            .get(&(group_id.to_string(), partition.clone()))
            .copied()
    }

    /// Commits made by `group_id`, in the order they were made.
    pub fn commits(&self, group_id: &str) -> Vec<(TopicPartition, i64)> {
        let inner = self.inner.lock();
        inner
            .commit_log
            .iter()
            .filter(|c| c.group_id == group_id)
            .map(|c| (c.partition.clone(), c.offset))
            .collect()
    }

    /// Open a consumer in `group_id`.
    pub fn consumer(self: &Arc<Self>, group_id: impl Into<String>) -> MemoryStreamSource {
        MemoryStreamSource {
            broker: Arc::clone(self),
            group_id: group_id.into(),
            state: Mutex::new(SourceState::default()),
        }
    }

    fn partitions_mut<'a>(
        inner: &'a mut BrokerInner,
        topic: &Topic,
        default_partitions: i32,
    ) -> &'a mut Vec<PartitionLog> {
        inner
            .topics
            .entry(topic.clone())
            .or_insert_with(|| (0..default_partitions).map(|_| PartitionLog::default()).collect())
    }

    fn log_mut<'a>(
        inner: &'a mut BrokerInner,
        partition: &TopicPartition,
        default_partitions: i32,
    ) -> &'a mut PartitionLog {
        let logs = Self::partitions_mut(inner, &partition.topic, default_partitions);
        let index = partition.partition.max(0) as usize;
        if logs.len() <= index {
            logs.resize_with(index + 1, PartitionLog::default);
        }
        &mut logs[index]
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamSink for MemoryBroker {
    async fn send(&self, topic: &Topic, key: &str, payload: &[u8]) -> Result<(), MeshError> {
        let failing = self
            .send_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MeshError::StreamTransport {
                topic: topic.clone(),
                reason: "injected send failure".to_string(),
                source: None,
            });
        }
        self.produce(topic, key, payload);
        Ok(())
    }
}

#[derive(Default)]
struct SourceState {
    subscribed: Vec<Topic>,
    positions: HashMap<TopicPartition, i64>,
    seeks: Vec<(TopicPartition, i64)>,
    closed: bool,
}

/// Consumer handle on a [`MemoryBroker`]. Positions start at the group's
/// committed offset, or at the start of the partition when nothing is
/// committed.
pub struct MemoryStreamSource {
    broker: Arc<MemoryBroker>,
    group_id: String,
    state: Mutex<SourceState>,
}

impl MemoryStreamSource {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn subscriptions(&self) -> Vec<Topic> {
        self.state.lock().subscribed.clone()
    }

    /// Every seek requested on this source, oldest first.
    pub fn seeks(&self) -> Vec<(TopicPartition, i64)> {
        self.state.lock().seeks.clone()
    }

    fn ensure_open(state: &SourceState) -> Result<(), MeshError> {
        if state.closed {
            return Err(MeshError::ShuttingDown);
        }
        Ok(())
    }

    fn fetch(&self, max_records: usize) -> Result<Vec<ConsumerRecord>, MeshError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let inner = self.broker.inner.lock();
        let mut batch = Vec::new();
        let topics = state.subscribed.clone();
        for topic in &topics {
            let Some(logs) = inner.topics.get(topic) else {
                continue;
            };
            for (index, log) in logs.iter().enumerate() {
                if batch.len() >= max_records {
                    return Ok(batch);
                }
                let tp = TopicPartition::new(topic.as_str(), index as i32);
                let position = match state.positions.get(&tp) {
                    Some(p) => *p,
                    None => inner
                        .committed
                        .get(&(self.group_id.clone(), tp.clone()))
                        .copied()
                        .unwrap_or_else(|| log.start_offset()),
                };
                let remaining = max_records - batch.len();
                let fetched: Vec<_> = log
                    .records
                    .iter()
                    .filter(|r| r.offset >= position)
                    .take(remaining)
                    .cloned()
                    .collect();
                let next = fetched.last().map(|r| r.offset + 1).unwrap_or(position);
                state.positions.insert(tp, next);
                batch.extend(fetched);
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl StreamSource for MemoryStreamSource {
    async fn subscribe(&self, topics: &[Topic]) -> Result<(), MeshError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        for topic in topics {
            if !state.subscribed.contains(topic) {
                state.subscribed.push(topic.clone());
            }
        }
        Ok(())
    }

    async fn poll(&self, max_records: usize) -> Result<Vec<ConsumerRecord>, MeshError> {
        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.fetch(max_records)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            notified.await;
        }
    }

    async fn commit(&self, offsets: &[(TopicPartition, i64)]) -> Result<(), MeshError> {
        Self::ensure_open(&self.state.lock())?;
        let mut inner = self.broker.inner.lock();
        for (tp, offset) in offsets {
            inner
                .committed
                .insert((self.group_id.clone(), tp.clone()), *offset);
            inner.commit_log.push(CommitEntry {
                group_id: self.group_id.clone(),
                partition: tp.clone(),
                offset: *offset,
            });
        }
        Ok(())
    }

    async fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<(), MeshError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.positions.insert(partition.clone(), offset);
        state.seeks.push((partition.clone(), offset));
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), MeshError> {
        let mut state = self.state.lock();
        state.subscribed.clear();
        state.positions.clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), MeshError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn topic() -> Topic {
        Topic::new("events")
    }

    #[tokio::test]
    async fn poll_returns_records_in_offset_order() {
        let broker = Arc::new(MemoryBroker::new());
        let tp = TopicPartition::new("events", 0);
        broker.set_next_offset(&tp, 10);
        for key in ["a", "b", "c"] {
            broker.produce_to(&tp, key, key.as_bytes());
        }

        let source = broker.consumer("g");
        source.subscribe(&[topic()]).await.unwrap();
        let batch = source.poll(10).await.unwrap();
        let offsets: Vec<_> = batch.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn poll_respects_max_records_and_advances() {
        let broker = Arc::new(MemoryBroker::new());
        for i in 0..5 {
            broker.produce(&topic(), "k", format!("{i}").as_bytes());
        }
        let source = broker.consumer("g");
        source.subscribe(&[topic()]).await.unwrap();
        assert_eq!(source.poll(3).await.unwrap().len(), 3);
        let rest = source.poll(3).await.unwrap();
        assert_eq!(rest.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn poll_waits_for_new_records() {
        let broker = Arc::new(MemoryBroker::new());
        let source = Arc::new(broker.consumer("g"));
        source.subscribe(&[topic()]).await.unwrap();

        let poller = {
            let source = source.clone();
            tokio::spawn(async move { source.poll(10).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.produce(&topic(), "k", b"late");

        let batch = tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].payload, b"late");
    }

    #[tokio::test]
    async fn new_consumer_resumes_from_committed_offset() {
        let broker = Arc::new(MemoryBroker::new());
        for i in 0..4 {
            broker.produce(&topic(), "k", format!("{i}").as_bytes());
        }
        let tp = TopicPartition::new("events", 0);

        let first = broker.consumer("g");
        first.subscribe(&[topic()]).await.unwrap();
        first.poll(10).await.unwrap();
        first.commit(&[(tp.clone(), 2)]).await.unwrap();
        first.close().await.unwrap();

        let second = broker.consumer("g");
        second.subscribe(&[topic()]).await.unwrap();
        let batch = second.poll(10).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3]);

        let other_group = broker.consumer("h");
        other_group.subscribe(&[topic()]).await.unwrap();
        assert_eq!(other_group.poll(10).await.unwrap().len(), 4);

        assert_eq!(broker.committed("g", &tp), Some(2));
        assert_eq!(broker.commits("g"), vec![(tp, 2)]);
    }

    #[tokio::test]
    async fn seek_redelivers() {
        let broker = Arc::new(MemoryBroker::new());
        for i in 0..3 {
            broker.produce(&topic(), "k", format!("{i}").as_bytes());
        }
        let source = broker.consumer("g");
        source.subscribe(&[topic()]).await.unwrap();
        source.poll(10).await.unwrap();
        source
            .seek(&TopicPartition::new("events", 0), 1)
            .await
            .unwrap();
        let batch = source.poll(10).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(source.seeks(), vec![(TopicPartition::new("events", 0), 1)]);
    }

    #[tokio::test]
    async fn same_key_same_partition() {
        let broker = Arc::new(MemoryBroker::with_partitions(4));
        let (p1, _) = broker.produce(&topic(), "device-7", b"1");
        let (p2, _) = broker.produce(&topic(), "device-7", b"2");
        assert_eq!(p1, p2);
    }

    #[tokio::test]
    async fn closed_source_rejects_calls() {
        let broker = Arc::new(MemoryBroker::new());
        let source = broker.consumer("g");
        source.close().await.unwrap();
        assert!(source.is_closed());
        assert!(source.subscribe(&[topic()]).await.is_err());
        assert!(source.poll(1).await.is_err());
    }

    #[tokio::test]
    async fn injected_send_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_sends(1);
        assert!(broker.send(&topic(), "k", b"x").await.is_err());
        broker.send(&topic(), "k", b"x").await.unwrap();
        assert_eq!(broker.records(&topic()).len(), 1);
    }
}
