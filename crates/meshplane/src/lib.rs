//! Control-plane plumbing for a multi-tenant device-management service mesh.
//!
//! The crate ties separately deployed services into one system:
//!
//! - [`bootstrap`] forms the data-grid cluster once the required peer
//!   services appear in the topology.
//! - [`tenant`] and [`router`] route each inbound call to the engine of its
//!   tenant.
//! - [`consumer`], [`producer`] and [`queue_receiver`] move events between
//!   services with at-least-once delivery.
//! - [`command`] routes outbound device commands to pluggable destinations.
//!
//! Transports sit behind traits ([`stream`], [`cluster`],
//! [`topology::TopologyProvider`]) with in-memory backends in [`storage`]
//! and feature-gated real ones (`kafka`, `etcd`).

pub mod bootstrap;
pub mod cluster;
pub mod command;
pub mod config;
pub mod consumer;
pub mod device_management;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod producer;
pub mod queue_receiver;
pub mod record;
pub mod router;
pub mod storage;
pub mod stream;
pub mod tenant;
pub mod testing;
pub mod topology;
pub mod types;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::bootstrap::ClusterBootstrap;
    pub use crate::cluster::{ClusterConnector, ClusterHandle, DistributedMap, DistributedQueue};
    pub use crate::command::{
        decision_fn, AssignmentContext, CommandDestination, CommandExecution, CommandRouter,
        DecisionFunction, DestinationRegistry, NestingContext, RoutingOutcome, SystemCommand,
    };
    pub use crate::config::MeshConfig;
    pub use crate::consumer::StreamConsumer;
    pub use crate::error::MeshError;
    pub use crate::metrics::MeshMetrics;
    pub use crate::producer::{DefaultTopicNaming, EventKind, StreamProducer, TopicNaming};
    pub use crate::queue_receiver::QueueReceiver;
    pub use crate::record::{ConsumerRecord, RecordProcessor};
    pub use crate::router::{CallMetadata, RequestRouter, Responder, TenantInterceptor};
    pub use crate::stream::{StreamSink, StreamSource};
    pub use crate::tenant::{
        current_tenant, with_tenant, TenantContext, TenantEngine, TenantEngineMap, TenantResolver,
    };
    pub use crate::topology::{SharedTopology, TopologyProvider, TopologySnapshot};
    pub use crate::types::{DestinationId, Hostname, ServiceKind, TenantId, Topic, TopicPartition};
}
