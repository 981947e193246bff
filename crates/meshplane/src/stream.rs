use async_trait::async_trait;

use crate::error::MeshError;
use crate::record::ConsumerRecord;
use crate::types::{Topic, TopicPartition};

/// Consuming side of the event stream transport, bound to one consumer
/// group. Offsets are only committed explicitly.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn subscribe(&self, topics: &[Topic]) -> Result<(), MeshError>;

    /// Wait for the next batch of at most `max_records` records. Records of
    /// one partition are returned in offset order.
    ///
    /// Cancel safe: dropping the future before it completes loses no records.
    async fn poll(&self, max_records: usize) -> Result<Vec<ConsumerRecord>, MeshError>;

    /// Commit the next offset to read for each partition.
    async fn commit(&self, offsets: &[(TopicPartition, i64)]) -> Result<(), MeshError>;

    /// Re-position the partition so the next poll starts at `offset`.
    async fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<(), MeshError>;

    async fn unsubscribe(&self) -> Result<(), MeshError>;

    /// Release the transport connection. The source is unusable afterwards.
    async fn close(&self) -> Result<(), MeshError>;
}

/// Producing side of the event stream transport.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Write a keyed record and wait for the transport to acknowledge it.
    async fn send(&self, topic: &Topic, key: &str, payload: &[u8]) -> Result<(), MeshError>;
}
