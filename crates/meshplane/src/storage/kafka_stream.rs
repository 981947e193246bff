//! Kafka backend for the stream transport, built on `rdkafka`.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};

use crate::config::{ConsumerConfig, ProducerConfig};
use crate::error::MeshError;
use crate::record::ConsumerRecord;
use crate::stream::{StreamSink, StreamSource};
use crate::types::{Topic, TopicPartition};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

impl ConsumerConfig {
    /// Client settings for an rdkafka consumer. Keys are read as strings and
    /// values as raw bytes; offsets are committed explicitly.
    pub fn to_rdkafka_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group_id)
            .set("client.id", &self.client_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");
        config
    }
}

impl ProducerConfig {
    pub fn to_rdkafka_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set(
                "message.timeout.ms",
                self.delivery_timeout.as_millis().to_string(),
            );
        config
    }
}

fn transport_error(topic: &str, reason: &str, e: rdkafka::error::KafkaError) -> MeshError {
    MeshError::StreamTransport {
        topic: Topic::new(topic),
        reason: format!("{reason}: {e}"),
        source: Some(Box::new(e)),
    }
}

fn to_record(msg: &BorrowedMessage<'_>) -> ConsumerRecord {
    ConsumerRecord {
        key: msg
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default(),
        payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        topic: Topic::new(msg.topic()),
        partition: msg.partition(),
        offset: msg.offset(),
        timestamp: msg
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

/// [`StreamSource`] over an rdkafka [`StreamConsumer`] with auto-commit
/// disabled.
pub struct KafkaStreamSource {
    consumer: ArcSwapOption<StreamConsumer>,
    subscribed: Mutex<Vec<Topic>>,
}

impl KafkaStreamSource {
    pub fn new(config: &ConsumerConfig) -> Result<Self, MeshError> {
        config.validate()?;
        tracing::info!(
            brokers = %config.bootstrap_servers,
            group_id = %config.group_id,
            "creating kafka consumer"
        );
        let consumer: StreamConsumer = config.to_rdkafka_config().create().map_err(|e| {
            MeshError::ServiceUnavailable {
                reason: format!("failed to create kafka consumer: {e}"),
                source: Some(Box::new(e)),
            }
        })?;
        Ok(Self {
            consumer: ArcSwapOption::from_pointee(consumer),
            subscribed: Mutex::new(Vec::new()),
        })
    }

    fn consumer(&self) -> Result<Arc<StreamConsumer>, MeshError> {
        self.consumer.load_full().ok_or(MeshError::ShuttingDown)
    }

    fn subscription(&self) -> String {
        self.subscribed
            .lock()
            .iter()
            .map(Topic::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl StreamSource for KafkaStreamSource {
    async fn subscribe(&self, topics: &[Topic]) -> Result<(), MeshError> {
        let consumer = self.consumer()?;
        let names: Vec<&str> = topics.iter().map(Topic::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| transport_error(&names.join(","), "failed to subscribe", e))?;
        *self.subscribed.lock() = topics.to_vec();
        Ok(())
    }

    async fn poll(&self, max_records: usize) -> Result<Vec<ConsumerRecord>, MeshError> {
        let consumer = self.consumer()?;
        let first = consumer
            .recv()
            .await
            .map_err(|e| transport_error(&self.subscription(), "receive failed", e))?;
        let mut batch = vec![to_record(&first)];
        drop(first);

        // Take whatever is already buffered without waiting for more.
        while batch.len() < max_records {
            match consumer.recv().now_or_never() {
                Some(Ok(msg)) => batch.push(to_record(&msg)),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "kafka receive failed while draining batch");
                    break;
                }
                None => break,
            }
        }
        Ok(batch)
    }

    async fn commit(&self, offsets: &[(TopicPartition, i64)]) -> Result<(), MeshError> {
        let consumer = self.consumer()?;
        let mut tpl = TopicPartitionList::new();
        for (tp, offset) in offsets {
            tpl.add_partition_offset(tp.topic.as_str(), tp.partition, Offset::Offset(*offset))
                .map_err(|e| transport_error(tp.topic.as_str(), "invalid commit offset", e))?;
        }
        consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| transport_error(&self.subscription(), "offset commit failed", e))
    }

    async fn seek(&self, partition: &TopicPartition, offset: i64) -> Result<(), MeshError> {
        let consumer = self.consumer()?;
        consumer
            .seek(
                partition.topic.as_str(),
                partition.partition,
                Offset::Offset(offset),
                Timeout::After(SEEK_TIMEOUT),
            )
            .map_err(|e| transport_error(partition.topic.as_str(), "seek failed", e))
    }

    async fn unsubscribe(&self) -> Result<(), MeshError> {
        if let Some(consumer) = self.consumer.load_full() {
            consumer.unsubscribe();
        }
        self.subscribed.lock().clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), MeshError> {
        if self.consumer.swap(None).is_some() {
            tracing::info!("kafka consumer closed");
        }
        Ok(())
    }
}

/// [`StreamSink`] over an rdkafka [`FutureProducer`].
pub struct KafkaStreamSink {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaStreamSink {
    pub fn new(config: &ProducerConfig) -> Result<Self, MeshError> {
        config.validate()?;
        let producer: FutureProducer = config.to_rdkafka_config().create().map_err(|e| {
            MeshError::ServiceUnavailable {
                reason: format!("failed to create kafka producer: {e}"),
                source: Some(Box::new(e)),
            }
        })?;
        Ok(Self {
            producer,
            delivery_timeout: config.delivery_timeout,
        })
    }
}

#[async_trait]
impl StreamSink for KafkaStreamSink {
    async fn send(&self, topic: &Topic, key: &str, payload: &[u8]) -> Result<(), MeshError> {
        let record = FutureRecord::to(topic.as_str()).key(key).payload(payload);
        match self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
        {
            Ok((partition, offset)) => {
                tracing::trace!(topic = %topic, partition, offset, "kafka write acknowledged");
                Ok(())
            }
            Err((e, _)) => Err(transport_error(topic.as_str(), "kafka write failed", e)),
        }
    }
}
