use crate::types::{DestinationId, MemberAddress, TenantId, Topic, TopicPartition};

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("no tenant engine registered for tenant {tenant_id}")]
    TenantNotFound { tenant_id: TenantId },

    #[error("tenant id not found in {operation} request metadata")]
    MissingTenantId { operation: String },

    #[error("service unavailable: {reason}")]
    ServiceUnavailable {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("unable to resolve topic for tenant {tenant_id} and event kind {event_kind}: {reason}")]
    TopicResolution {
        tenant_id: TenantId,
        event_kind: String,
        reason: String,
    },

    #[error("no command destination registered with id {destination_id}")]
    DestinationNotFound { destination_id: DestinationId },

    #[error("command destination id {destination_id} registered more than once")]
    DuplicateDestination { destination_id: DestinationId },

    #[error("decision function failed: {reason}")]
    DecisionFailed {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("command delivery to {destination_id} failed: {reason}")]
    DeliveryFailed {
        destination_id: DestinationId,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("unable to join cluster with members {}", join_members(.members))]
    ClusterJoinFailure {
        members: Vec<MemberAddress>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("cluster connection not available: {reason}")]
    ClusterUnavailable { reason: String },

    #[error("processing failed for record {partition}@{offset}: {reason}")]
    ProcessingFailure {
        partition: TopicPartition,
        offset: i64,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("stream transport error on {topic}: {reason}")]
    StreamTransport {
        topic: Topic,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("distributed queue {queue} closed")]
    QueueClosed { queue: String },

    #[error("serialization error: {reason}")]
    Serialization {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("operation {operation} is not supported by this engine")]
    Unsupported { operation: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("component is shutting down")]
    ShuttingDown,
}

fn join_members(members: &[MemberAddress]) -> String {
    members
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl MeshError {
    /// Whether the caller may succeed by retrying later or elsewhere.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::TenantNotFound { .. }
                | MeshError::ServiceUnavailable { .. }
                | MeshError::ClusterJoinFailure { .. }
                | MeshError::ClusterUnavailable { .. }
                | MeshError::StreamTransport { .. }
        )
    }
}

impl From<MeshError> for tonic::Status {
    fn from(err: MeshError) -> Self {
        let message = err.to_string();
        match err {
            MeshError::TenantNotFound { .. } => tonic::Status::not_found(message),
            MeshError::MissingTenantId { .. } => tonic::Status::unauthenticated(message),
            MeshError::ServiceUnavailable { .. }
            | MeshError::ClusterUnavailable { .. }
            | MeshError::ClusterJoinFailure { .. }
            | MeshError::StreamTransport { .. }
            | MeshError::ShuttingDown => tonic::Status::unavailable(message),
            MeshError::InvalidConfig { .. } | MeshError::TopicResolution { .. } => {
                tonic::Status::failed_precondition(message)
            }
            MeshError::Serialization { .. } => tonic::Status::invalid_argument(message),
            MeshError::Unsupported { .. } => tonic::Status::unimplemented(message),
            _ => tonic::Status::internal(message),
        }
    }
}
