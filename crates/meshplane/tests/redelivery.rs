use std::sync::Arc;
use std::time::Duration;

use meshplane::config::{ConsumerConfig, TopicNamingConfig};
use meshplane::consumer::StreamConsumer;
use meshplane::metrics::MeshMetrics;
use meshplane::producer::{DefaultTopicNaming, EventKind, StreamProducer};
use meshplane::storage::memory_stream::MemoryBroker;
use meshplane::stream::StreamSource;
use meshplane::tenant::TenantContext;
use meshplane::testing::{wait_until, IdempotentSink};
use meshplane::types::{TenantId, Topic, TopicPartition};

const WAIT: Duration = Duration::from_secs(5);

fn consumer(
    broker: &Arc<MemoryBroker>,
    group: &str,
    sink: Arc<IdempotentSink>,
) -> Arc<StreamConsumer> {
    Arc::new(StreamConsumer::new(
        ConsumerConfig {
            group_id: group.into(),
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        },
        Arc::new(broker.consumer(group)),
        sink,
        Arc::new(MeshMetrics::unregistered()),
    ))
}

async fn publish_batch(broker: &Arc<MemoryBroker>) -> Topic {
    let producer = StreamProducer::new(
        broker.clone(),
        Arc::new(DefaultTopicNaming::new(TopicNamingConfig::default()).unwrap()),
        EventKind::DecodedEvents,
        Arc::new(MeshMetrics::unregistered()),
    );
    let tenant = TenantId::new("acme");
    for (key, payload) in [("device-1", "t=20"), ("device-2", "t=21"), ("device-3", "t=22")] {
        producer.publish(&tenant, key, payload.as_bytes()).await.unwrap();
    }
    producer.target_topic(&tenant).unwrap()
}

#[tokio::test]
async fn replaying_a_batch_yields_single_delivery_state() {
    let broker = Arc::new(MemoryBroker::new());
    let topic = publish_batch(&broker).await;
    let sink = Arc::new(IdempotentSink::new());

    let first = consumer(&broker, "persistence", sink.clone());
    first.start(&[topic.clone()]).await.unwrap();
    assert!(wait_until(WAIT, || sink.deliveries() == 3).await);
    first.stop().await;
    let after_first = sink.state();

    // Rewind the group and read the same batch again.
    let source = broker.consumer("persistence");
    source.subscribe(&[topic.clone()]).await.unwrap();
    source
        .commit(&[(TopicPartition::new(topic.as_str(), 0), 0)])
        .await
        .unwrap();
    source.close().await.unwrap();

    let replay = consumer(&broker, "persistence", sink.clone());
    replay.start(&[topic.clone()]).await.unwrap();
    assert!(wait_until(WAIT, || sink.deliveries() == 6).await);
    replay.stop().await;

    assert_eq!(sink.state(), after_first);
    assert_eq!(sink.state().len(), 3);
    assert_eq!(sink.state()["device-2"], b"t=21".to_vec());
}

#[tokio::test]
async fn independent_groups_each_see_every_record() {
    let broker = Arc::new(MemoryBroker::new());
    let topic = publish_batch(&broker).await;

    let persisted = Arc::new(IdempotentSink::new());
    let enriched = Arc::new(IdempotentSink::new());
    let a = consumer(&broker, "persistence", persisted.clone());
    let b = Arc::new(
        StreamConsumer::new(
            ConsumerConfig {
                group_id: "enrichment".into(),
                ..Default::default()
            },
            Arc::new(broker.consumer("enrichment")),
            enriched.clone(),
            Arc::new(MeshMetrics::unregistered()),
        )
        .with_tenant(TenantContext::new(TenantId::new("acme"))),
    );
    a.start(&[topic.clone()]).await.unwrap();
    b.start(&[topic.clone()]).await.unwrap();

    assert!(wait_until(WAIT, || persisted.deliveries() == 3 && enriched.deliveries() == 3).await);
    a.stop().await;
    b.stop().await;

    assert_eq!(persisted.state(), enriched.state());
    let tp = TopicPartition::new(topic.as_str(), 0);
    assert_eq!(broker.committed("persistence", &tp), Some(3));
    assert_eq!(broker.committed("enrichment", &tp), Some(3));
}
