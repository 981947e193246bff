use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::TopicNamingConfig;
use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::record::EventEnvelope;
use crate::stream::StreamSink;
use crate::types::{TenantId, Topic};

/// Longest topic name accepted by the stream transport.
pub const MAX_TOPIC_NAME_LEN: usize = 249;

/// Category of event a topic carries.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Raw payloads as received by event sources.
    InboundEvents,
    /// Events decoded by event sources.
    DecodedEvents,
    /// Events from devices that are not registered.
    UnregisteredDeviceEvents,
    /// Events that were stored by inbound processing.
    PersistedEvents,
    /// Events sent back for another pass through inbound processing.
    ReprocessEvents,
    /// Events enriched with device and assignment context.
    EnrichedEvents,
    /// Command invocations on their way to a destination.
    CommandInvocations,
    /// Command invocations no destination accepted.
    UndeliveredCommandInvocations,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::InboundEvents,
        EventKind::DecodedEvents,
        EventKind::UnregisteredDeviceEvents,
        EventKind::PersistedEvents,
        EventKind::ReprocessEvents,
        EventKind::EnrichedEvents,
        EventKind::CommandInvocations,
        EventKind::UndeliveredCommandInvocations,
    ];

    /// Last segment of the topic name for this kind.
    pub fn suffix(&self) -> &'static str {
        match self {
            EventKind::InboundEvents => "event-source-inbound-events",
            EventKind::DecodedEvents => "event-source-decoded-events",
            EventKind::UnregisteredDeviceEvents => "inbound-unregistered-device-events",
            EventKind::PersistedEvents => "inbound-persisted-events",
            EventKind::ReprocessEvents => "inbound-reprocess-events",
            EventKind::EnrichedEvents => "inbound-enriched-events",
            EventKind::CommandInvocations => "outbound-command-invocations",
            EventKind::UndeliveredCommandInvocations => "undelivered-command-invocations",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Maps a tenant and event kind to the topic carrying those events.
///
/// Implementations must be deterministic and free of side effects.
pub trait TopicNaming: Send + Sync {
    fn topic_for(&self, tenant_id: &TenantId, kind: EventKind) -> Result<Topic, MeshError>;
}

impl<F> TopicNaming for F
where
    F: Fn(&TenantId, EventKind) -> Result<Topic, MeshError> + Send + Sync,
{
    fn topic_for(&self, tenant_id: &TenantId, kind: EventKind) -> Result<Topic, MeshError> {
        self(tenant_id, kind)
    }
}

/// Default naming scheme:
/// `{prefix}.{instance}.tenant.{tenant}.{suffix}` for tenant topics and
/// `{prefix}.{instance}.global.{name}` for instance-wide topics.
#[derive(Debug, Clone)]
pub struct DefaultTopicNaming {
    config: TopicNamingConfig,
}

impl DefaultTopicNaming {
    pub fn new(config: TopicNamingConfig) -> Result<Self, MeshError> {
        config.validate()?;
        for (field, value) in [("prefix", &config.prefix), ("instance_id", &config.instance_id)] {
            if !is_legal_segment(value) {
                return Err(MeshError::InvalidConfig {
                    reason: format!("{field} {value:?} contains characters not allowed in topic names"),
                });
            }
        }
        Ok(Self { config })
    }

    fn base(&self) -> String {
        format!("{}.{}", self.config.prefix, self.config.instance_id)
    }

    /// Instance-wide topic shared by every tenant.
    pub fn global_topic(&self, name: &str) -> Result<Topic, MeshError> {
        if !is_legal_segment(name) {
            return Err(MeshError::InvalidConfig {
                reason: format!("global topic name {name:?} is not a legal topic segment"),
            });
        }
        Ok(Topic::new(format!("{}.global.{name}", self.base())))
    }

    /// Topic carrying tenant lifecycle updates.
    pub fn tenant_updates_topic(&self) -> Topic {
        Topic::new(format!("{}.global.tenant-model-updates", self.base()))
    }

    /// Topic carrying instance topology updates.
    pub fn topology_updates_topic(&self) -> Topic {
        Topic::new(format!("{}.global.instance-topology-updates", self.base()))
    }
}

impl TopicNaming for DefaultTopicNaming {
    fn topic_for(&self, tenant_id: &TenantId, kind: EventKind) -> Result<Topic, MeshError> {
        let resolution_error = |reason: String| MeshError::TopicResolution {
            tenant_id: tenant_id.clone(),
            event_kind: kind.to_string(),
            reason,
        };
        if tenant_id.as_str().is_empty() {
            return Err(resolution_error("tenant id is empty".to_string()));
        }
        if !is_legal_segment(tenant_id.as_str()) {
            return Err(resolution_error(format!(
                "tenant id {tenant_id:?} contains characters not allowed in topic names"
            )));
        }
        let name = format!("{}.tenant.{}.{}", self.base(), tenant_id, kind.suffix());
        if name.len() > MAX_TOPIC_NAME_LEN {
            return Err(resolution_error(format!(
                "topic name is {} characters, limit is {MAX_TOPIC_NAME_LEN}",
                name.len()
            )));
        }
        Ok(Topic::new(name))
    }
}

fn is_legal_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Publishes events of one kind to the topic its tenant maps to.
///
/// A topic that cannot be resolved aborts the publish; nothing is written
/// to a fallback topic.
pub struct StreamProducer {
    sink: Arc<dyn StreamSink>,
    naming: Arc<dyn TopicNaming>,
    kind: EventKind,
    metrics: Arc<MeshMetrics>,
}

impl StreamProducer {
    pub fn new(
        sink: Arc<dyn StreamSink>,
        naming: Arc<dyn TopicNaming>,
        kind: EventKind,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            sink,
            naming,
            kind,
            metrics,
        }
    }

    /// Producer for events from devices that are not registered.
    pub fn unregistered_events(
        sink: Arc<dyn StreamSink>,
        naming: Arc<dyn TopicNaming>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self::new(sink, naming, EventKind::UnregisteredDeviceEvents, metrics)
    }

    pub fn event_kind(&self) -> EventKind {
        self.kind
    }

    /// Topic this producer writes to for `tenant_id`.
    pub fn target_topic(&self, tenant_id: &TenantId) -> Result<Topic, MeshError> {
        self.naming.topic_for(tenant_id, self.kind)
    }

    /// Build the envelope for an event without sending it.
    pub fn envelope(
        &self,
        tenant_id: &TenantId,
        key: &str,
        payload: &[u8],
    ) -> Result<EventEnvelope, MeshError> {
        Ok(EventEnvelope {
            topic: self.target_topic(tenant_id)?,
            key: key.to_string(),
            payload: payload.to_vec(),
        })
    }

    /// Write an event to the tenant's topic and wait for the transport to
    /// acknowledge it.
    #[instrument(skip(self, payload), fields(kind = %self.kind, payload_len = payload.len()))]
    pub async fn publish(
        &self,
        tenant_id: &TenantId,
        key: &str,
        payload: &[u8],
    ) -> Result<(), MeshError> {
        let result = self.send(tenant_id, key, payload).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.metrics.events_published.with_label_values(&[outcome]).inc();
        result
    }

    async fn send(&self, tenant_id: &TenantId, key: &str, payload: &[u8]) -> Result<(), MeshError> {
        let topic = self.target_topic(tenant_id)?;
        self.sink.send(&topic, key, payload).await?;
        tracing::debug!(topic = %topic, key, "event published");
        Ok(())
    }

    /// Publish in the background. Failures are logged and counted.
    pub fn publish_detached(
        self: &Arc<Self>,
        tenant_id: TenantId,
        key: String,
        payload: Vec<u8>,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.publish(&tenant_id, &key, &payload).await {
                tracing::error!(
                    tenant_id = %tenant_id,
                    kind = %this.kind,
                    error = %e,
                    "failed to publish event"
                );
            }
        })
    }
}
