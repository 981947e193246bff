use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::types::{Topic, TopicPartition};

/// A record read from an event stream partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRecord {
    /// Record key. Empty when the record was written without one.
    pub key: String,
    pub payload: Vec<u8>,
    pub topic: Topic,
    pub partition: i32,
    /// Position within the partition. Strictly increasing per partition.
    pub offset: i64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: self.topic.clone(),
            partition: self.partition,
        }
    }
}

/// Inbound pipeline fed by stream consumers and queue receivers.
///
/// Delivery is at-least-once: the same record may be handed over again after
/// a failure or restart, so implementations must tolerate replays.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn received(&self, key: &str, payload: &[u8]) -> Result<(), MeshError>;
}

/// An event addressed to a derived topic, ready to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub topic: Topic,
    pub key: String,
    pub payload: Vec<u8>,
}
