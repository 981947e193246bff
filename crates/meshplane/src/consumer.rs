use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ConsumerConfig;
use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::record::{ConsumerRecord, RecordProcessor};
use crate::stream::{StreamSink, StreamSource};
use crate::tenant::{with_tenant, TenantContext};
use crate::types::{Topic, TopicPartition};

/// Split a batch into per-partition runs. Partitions appear in the order
/// they are first seen; records keep their order within a partition.
pub fn group_by_partition(
    records: Vec<ConsumerRecord>,
) -> Vec<(TopicPartition, Vec<ConsumerRecord>)> {
    let mut index: HashMap<TopicPartition, usize> = HashMap::new();
    let mut groups: Vec<(TopicPartition, Vec<ConsumerRecord>)> = Vec::new();
    for record in records {
        let tp = record.topic_partition();
        match index.get(&tp) {
            Some(&i) => groups[i].1.push(record),
            None => {
                index.insert(tp.clone(), groups.len());
                groups.push((tp, vec![record]));
            }
        }
    }
    groups
}

/// Highest committed offset per partition.
#[derive(Debug, Default)]
pub struct CommitTracker {
    committed: HashMap<TopicPartition, i64>,
}

impl CommitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether committing `offset` would move the partition forward.
    pub fn is_ahead(&self, partition: &TopicPartition, offset: i64) -> bool {
        self.committed
            .get(partition)
            .map_or(true, |&current| offset > current)
    }

    /// Record a successful commit. Offsets behind the current one are
    /// ignored.
    pub fn record(&mut self, partition: &TopicPartition, offset: i64) {
        let entry = self.committed.entry(partition.clone()).or_insert(offset);
        if offset > *entry {
            *entry = offset;
        }
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.committed.get(partition).copied()
    }
}

/// Where records go once their processing attempts are exhausted.
pub struct DeadLetter {
    pub sink: Arc<dyn StreamSink>,
    pub topic: Topic,
}

/// Subscribes to event topics and feeds every record to a
/// [`RecordProcessor`], committing each partition only past records that
/// were processed.
///
/// One background task per consumer. Auto-commit is never used: after a
/// partition's records in a batch are handled, `last processed + 1` is
/// committed for it.
///
/// Without a dead-letter sink, a record that fails every attempt on every
/// delivery holds its partition at that offset indefinitely. Configure one
/// with [`StreamConsumer::with_dead_letter`] to skip such records.
pub struct StreamConsumer {
    config: ConsumerConfig,
    source: Arc<dyn StreamSource>,
    processor: Arc<dyn RecordProcessor>,
    dead_letter: Option<DeadLetter>,
    tenant: Option<TenantContext>,
    metrics: Arc<MeshMetrics>,
    cancel: CancellationToken,
    commits: parking_lot::Mutex<CommitTracker>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StreamConsumer {
    pub fn new(
        config: ConsumerConfig,
        source: Arc<dyn StreamSource>,
        processor: Arc<dyn RecordProcessor>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            config,
            source,
            processor,
            dead_letter: None,
            tenant: None,
            metrics,
            cancel: CancellationToken::new(),
            commits: parking_lot::Mutex::new(CommitTracker::new()),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Publish records that keep failing to `topic` instead of stalling
    /// their partition.
    pub fn with_dead_letter(mut self, sink: Arc<dyn StreamSink>, topic: Topic) -> Self {
        self.dead_letter = Some(DeadLetter { sink, topic });
        self
    }

    /// Process every record with `tenant` as the ambient tenant.
    pub fn with_tenant(mut self, tenant: TenantContext) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    /// Last offset committed for a partition by this consumer.
    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.commits.lock().committed(partition)
    }

    /// Subscribe to `topics` and spawn the consume loop.
    pub async fn start(self: &Arc<Self>, topics: &[Topic]) -> Result<(), MeshError> {
        self.config.validate()?;
        if topics.is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: "at least one topic is required".to_string(),
            });
        }
        if self.cancel.is_cancelled() {
            return Err(MeshError::ShuttingDown);
        }
        if self.task.lock().is_some() {
            tracing::warn!(group_id = %self.config.group_id, "stream consumer already started");
            return Ok(());
        }

        self.source.subscribe(topics).await?;
        let names = topics
            .iter()
            .map(Topic::as_str)
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            group_id = %self.config.group_id,
            client_id = %self.config.client_id,
            topics = %names,
            "stream consumer subscribed"
        );

        let this = Arc::clone(self);
        *self.task.lock() = Some(tokio::spawn(async move { this.run().await }));
        Ok(())
    }

    /// Wake the blocked poll, let the current partition finish, then
    /// unsubscribe and release the source.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "stream consumer task panicked");
            }
        }
    }

    #[instrument(skip(self), fields(group_id = %self.config.group_id))]
    async fn run(&self) {
        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                polled = self.source.poll(self.config.max_poll_records) => polled,
            };
            match polled {
                Ok(records) => self.process_batch(records).await,
                Err(e) => {
                    tracing::warn!(error = %e, "poll failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }

        if let Err(e) = self.source.unsubscribe().await {
            tracing::warn!(error = %e, "failed to unsubscribe stream consumer");
        }
        if let Err(e) = self.source.close().await {
            tracing::warn!(error = %e, "failed to close stream source");
        }
        tracing::info!("stream consumer stopped");
    }

    async fn process_batch(&self, records: Vec<ConsumerRecord>) {
        tracing::debug!(records = records.len(), "processing batch");
        for (tp, records) in group_by_partition(records) {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    partition = %tp,
                    "shutdown requested, leaving remaining partitions for redelivery"
                );
                return;
            }
            self.process_partition(&tp, records).await;
        }
    }

    /// Process one partition's run in offset order and commit past the last
    /// record handled. A record that cannot be handled stops the run and
    /// re-positions the source on it.
    async fn process_partition(&self, tp: &TopicPartition, records: Vec<ConsumerRecord>) {
        let mut last_processed = None;
        for record in &records {
            match self.process_record(tp, record).await {
                Ok(()) => last_processed = Some(record.offset),
                Err(MeshError::ShuttingDown) => {
                    tracing::debug!(
                        partition = %tp,
                        offset = record.offset,
                        "shutdown interrupted retries, record left uncommitted"
                    );
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        partition = %tp,
                        offset = record.offset,
                        error = %e,
                        "record processing failed, partition will be redelivered from this offset"
                    );
                    if let Err(seek_err) = self.source.seek(tp, record.offset).await {
                        tracing::error!(partition = %tp, error = %seek_err, "failed to seek after processing failure");
                    }
                    break;
                }
            }
        }
        if let Some(last) = last_processed {
            self.commit(tp, last + 1).await;
        }
    }

    async fn process_record(
        &self,
        tp: &TopicPartition,
        record: &ConsumerRecord,
    ) -> Result<(), MeshError> {
        let mut attempt = 1;
        loop {
            let result = match &self.tenant {
                Some(tenant) => {
                    with_tenant(
                        tenant.clone(),
                        self.processor.received(&record.key, &record.payload),
                    )
                    .await
                }
                None => self.processor.received(&record.key, &record.payload).await,
            };
            let error = match result {
                Ok(()) => {
                    self.metrics.records_processed.inc();
                    return Ok(());
                }
                Err(e) => e,
            };

            if attempt < self.config.max_processing_attempts {
                tracing::warn!(
                    partition = %tp,
                    offset = record.offset,
                    attempt,
                    error = %error,
                    "record processing failed, retrying"
                );
                attempt += 1;
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(MeshError::ShuttingDown),
                    _ = tokio::time::sleep(self.config.retry_backoff) => {}
                }
                continue;
            }

            self.metrics.processing_failures.inc();
            let failure = MeshError::ProcessingFailure {
                partition: tp.clone(),
                offset: record.offset,
                reason: error.to_string(),
                source: Some(Box::new(error)),
            };
            return match &self.dead_letter {
                Some(dead_letter) => self.dead_letter(dead_letter, tp, record, failure).await,
                None => Err(failure),
            };
        }
    }

    async fn dead_letter(
        &self,
        dead_letter: &DeadLetter,
        tp: &TopicPartition,
        record: &ConsumerRecord,
        failure: MeshError,
    ) -> Result<(), MeshError> {
        match dead_letter
            .sink
            .send(&dead_letter.topic, &record.key, &record.payload)
            .await
        {
            Ok(()) => {
                tracing::warn!(
                    partition = %tp,
                    offset = record.offset,
                    dead_letter_topic = %dead_letter.topic,
                    error = %failure,
                    "record moved to dead-letter topic"
                );
                self.metrics.records_dead_lettered.inc();
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    partition = %tp,
                    offset = record.offset,
                    error = %e,
                    "failed to publish record to dead-letter topic"
                );
                Err(failure)
            }
        }
    }

    async fn commit(&self, tp: &TopicPartition, offset: i64) {
        if !self.commits.lock().is_ahead(tp, offset) {
            tracing::debug!(partition = %tp, offset, "skipping commit that would not advance");
            return;
        }
        match self.source.commit(&[(tp.clone(), offset)]).await {
            Ok(()) => {
                self.commits.lock().record(tp, offset);
                self.metrics.offset_commits.inc();
                tracing::debug!(partition = %tp, offset, "committed offset");
            }
            Err(e) => {
                tracing::warn!(
                    partition = %tp,
                    offset,
                    error = %e,
                    "offset commit failed, processed records may be redelivered"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_stream::{MemoryBroker, MemoryStreamSource};
    use crate::testing::{wait_until, within, RecordingProcessor};
    use crate::types::TenantId;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            group_id: "inbound".into(),
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn record(partition: i32, offset: i64) -> ConsumerRecord {
        ConsumerRecord {
            key: format!("k{offset}"),
            payload: Vec::new(),
            topic: Topic::new("events"),
            partition,
            offset,
            timestamp: None,
        }
    }

    struct Harness {
        broker: Arc<MemoryBroker>,
        source: Arc<MemoryStreamSource>,
        processor: Arc<RecordingProcessor>,
    }

    impl Harness {
        fn new() -> Self {
            let broker = Arc::new(MemoryBroker::new());
            let source = Arc::new(broker.consumer("inbound"));
            Self {
                broker,
                source,
                processor: Arc::new(RecordingProcessor::new()),
            }
        }

        fn consumer(&self, config: ConsumerConfig) -> StreamConsumer {
            StreamConsumer::new(
                config,
                self.source.clone(),
                self.processor.clone(),
                Arc::new(MeshMetrics::unregistered()),
            )
        }

        fn produce(&self, partition: i32, keys: &[&str]) {
            let tp = TopicPartition::new("events", partition);
            for key in keys {
                self.broker.produce_to(&tp, key, key.as_bytes());
            }
        }

        fn commits(&self) -> Vec<(TopicPartition, i64)> {
            self.broker.commits("inbound")
        }
    }

    /// Blocks on `gated_key` until released.
    struct GatedProcessor {
        gated_key: String,
        entered: Notify,
        release: Notify,
        seen: parking_lot::Mutex<Vec<String>>,
    }

    impl GatedProcessor {
        fn new(gated_key: &str) -> Self {
            Self {
                gated_key: gated_key.into(),
                entered: Notify::new(),
                release: Notify::new(),
                seen: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecordProcessor for GatedProcessor {
        async fn received(&self, key: &str, _payload: &[u8]) -> Result<(), MeshError> {
            self.seen.lock().push(key.to_string());
            if key == self.gated_key {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(())
        }
    }

    #[test]
    fn grouping_preserves_partition_and_offset_order() {
        let groups = group_by_partition(vec![
            record(1, 5),
            record(0, 10),
            record(1, 6),
            record(0, 11),
            record(2, 1),
        ]);
        let shape: Vec<(i32, Vec<i64>)> = groups
            .iter()
            .map(|(tp, rs)| (tp.partition, rs.iter().map(|r| r.offset).collect()))
            .collect();
        assert_eq!(
            shape,
            vec![(1, vec![5, 6]), (0, vec![10, 11]), (2, vec![1])]
        );
    }

    #[test]
    fn commit_tracker_never_moves_backwards() {
        let tp = TopicPartition::new("events", 0);
        let mut tracker = CommitTracker::new();
        assert!(tracker.is_ahead(&tp, 0));
        tracker.record(&tp, 13);
        assert!(!tracker.is_ahead(&tp, 13));
        assert!(!tracker.is_ahead(&tp, 5));
        tracker.record(&tp, 5);
        assert_eq!(tracker.committed(&tp), Some(13));
        assert!(tracker.is_ahead(&tp, 14));
    }

    #[tokio::test]
    async fn commits_last_processed_offset_plus_one() {
        let h = Harness::new();
        let tp = TopicPartition::new("events", 0);
        h.broker.set_next_offset(&tp, 10);
        h.produce(0, &["a", "b", "c"]);

        let consumer = Arc::new(h.consumer(config()));
        consumer.start(&[Topic::new("events")]).await.unwrap();

        assert!(wait_until(WAIT, || !h.commits().is_empty()).await);
        consumer.stop().await;

        assert_eq!(h.processor.keys(), vec!["a", "b", "c"]);
        assert_eq!(h.commits(), vec![(tp.clone(), 13)]);
        assert_eq!(consumer.committed(&tp), Some(13));
    }

    #[tokio::test]
    async fn partitions_commit_independently() {
        let h = Harness::new();
        h.broker.create_topic("events", 2);
        h.produce(0, &["a0", "b0"]);
        h.produce(1, &["a1"]);

        let consumer = Arc::new(h.consumer(config()));
        consumer.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || h.commits().len() == 2).await);
        consumer.stop().await;

        let mut commits = h.commits();
        commits.sort();
        assert_eq!(
            commits,
            vec![
                (TopicPartition::new("events", 0), 2),
                (TopicPartition::new("events", 1), 1),
            ]
        );
    }

    #[tokio::test]
    async fn transient_failure_is_retried_in_place() {
        let h = Harness::new();
        h.produce(0, &["a", "b"]);
        h.processor.fail_times("a", 2);

        let consumer = Arc::new(h.consumer(config()));
        consumer.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || !h.commits().is_empty()).await);
        consumer.stop().await;

        assert_eq!(h.processor.keys(), vec!["a", "b"]);
        assert_eq!(h.processor.attempts(), 4);
        assert_eq!(h.commits(), vec![(TopicPartition::new("events", 0), 2)]);
    }

    #[tokio::test]
    async fn exhausted_record_commits_prefix_and_is_redelivered() {
        let h = Harness::new();
        h.produce(0, &["a", "bad", "c"]);
        // Every attempt of the first delivery fails; the redelivery succeeds.
        h.processor.fail_times("bad", 3);

        let consumer = Arc::new(h.consumer(config()));
        consumer.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || h.commits().len() == 2).await);
        consumer.stop().await;

        let tp = TopicPartition::new("events", 0);
        assert_eq!(h.commits(), vec![(tp.clone(), 1), (tp, 3)]);
        assert_eq!(h.processor.keys(), vec!["a", "bad", "c"]);
    }

    #[tokio::test]
    async fn failure_in_one_partition_does_not_block_another() {
        let h = Harness::new();
        h.broker.create_topic("events", 2);
        h.produce(0, &["stuck"]);
        h.produce(1, &["fine"]);
        h.processor.fail_always("stuck");

        let consumer = Arc::new(h.consumer(config()));
        consumer.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || !h.commits().is_empty()).await);
        consumer.stop().await;

        let commits = h.commits();
        assert!(commits.contains(&(TopicPartition::new("events", 1), 1)));
        assert!(!commits
            .iter()
            .any(|(tp, _)| tp.partition == 0));
    }

    #[tokio::test]
    async fn dead_lettered_record_counts_as_processed() {
        let h = Harness::new();
        h.produce(0, &["a", "poison", "c"]);
        h.processor.fail_always("poison");

        let consumer = Arc::new(
            h.consumer(config())
                .with_dead_letter(h.broker.clone(), Topic::new("events.dlq")),
        );
        consumer.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || !h.commits().is_empty()).await);
        consumer.stop().await;

        assert_eq!(h.commits(), vec![(TopicPartition::new("events", 0), 3)]);
        assert_eq!(h.processor.keys(), vec!["a", "c"]);
        let dlq = h.broker.records(&Topic::new("events.dlq"));
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].key, "poison");
    }

    #[tokio::test]
    async fn idle_shutdown_does_not_commit_and_releases_source() {
        let h = Harness::new();
        let consumer = Arc::new(h.consumer(config()));
        consumer.start(&[Topic::new("events")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        within(Duration::from_secs(1), consumer.stop()).await;

        assert!(h.commits().is_empty());
        assert!(h.source.is_closed());
        assert!(h.source.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn records_are_processed_in_tenant_context() {
        let h = Harness::new();
        h.produce(0, &["a"]);
        let consumer = Arc::new(
            h.consumer(config())
                .with_tenant(TenantContext::new(TenantId::new("acme"))),
        );
        consumer.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || !h.processor.is_empty()).await);
        consumer.stop().await;

        assert_eq!(h.processor.records()[0].tenant, Some(TenantId::new("acme")));
    }

    #[tokio::test]
    async fn start_requires_topics_and_valid_config() {
        let h = Harness::new();
        let consumer = Arc::new(h.consumer(config()));
        assert!(matches!(
            consumer.start(&[]).await,
            Err(MeshError::InvalidConfig { .. })
        ));

        let consumer = Arc::new(h.consumer(ConsumerConfig {
            max_processing_attempts: 0,
            ..config()
        }));
        assert!(consumer.start(&[Topic::new("events")]).await.is_err());
    }

    #[tokio::test]
    async fn restart_in_same_group_resumes_after_commit() {
        let h = Harness::new();
        h.produce(0, &["a", "b"]);
        let consumer = Arc::new(h.consumer(config()));
        consumer.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || !h.commits().is_empty()).await);
        consumer.stop().await;

        h.produce(0, &["c"]);
        let second_processor = Arc::new(RecordingProcessor::new());
        let second = Arc::new(StreamConsumer::new(
            config(),
            Arc::new(h.broker.consumer("inbound")),
            second_processor.clone(),
            Arc::new(MeshMetrics::unregistered()),
        ));
        second.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || h.commits().len() == 2).await);
        second.stop().await;

        assert_eq!(second_processor.keys(), vec!["c"]);
    }

    #[tokio::test]
    async fn stop_mid_batch_commits_current_partition_only() {
        let h = Harness::new();
        h.broker.create_topic("events", 2);
        h.produce(0, &["p0"]);
        h.produce(1, &["p1"]);

        let processor = Arc::new(GatedProcessor::new("p0"));
        let consumer = Arc::new(StreamConsumer::new(
            config(),
            h.source.clone(),
            processor.clone(),
            Arc::new(MeshMetrics::unregistered()),
        ));
        consumer.start(&[Topic::new("events")]).await.unwrap();
        within(WAIT, processor.entered.notified()).await;

        consumer.cancel.cancel();
        processor.release.notify_one();
        within(WAIT, consumer.stop()).await;

        assert_eq!(*processor.seen.lock(), vec!["p0".to_string()]);
        assert_eq!(h.commits(), vec![(TopicPartition::new("events", 0), 1)]);
        assert!(h.source.seeks().is_empty());
    }

    #[tokio::test]
    async fn stop_during_retry_backoff_leaves_record_uncommitted() {
        let h = Harness::new();
        h.produce(0, &["a"]);
        h.processor.fail_always("a");

        let consumer = Arc::new(h.consumer(ConsumerConfig {
            retry_backoff: Duration::from_secs(30),
            ..config()
        }));
        consumer.start(&[Topic::new("events")]).await.unwrap();
        assert!(wait_until(WAIT, || h.processor.attempts() == 1).await);

        within(Duration::from_secs(1), consumer.stop()).await;

        assert_eq!(h.processor.attempts(), 1);
        assert!(h.commits().is_empty());
        assert!(h.source.seeks().is_empty());
    }
}
