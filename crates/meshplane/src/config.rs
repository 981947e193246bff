use crate::error::MeshError;
use crate::types::{Hostname, ServiceKind};
use std::time::Duration;

/// Default port cluster members listen on.
pub const DEFAULT_CLUSTER_PORT: u16 = 5701;

/// Default name of the cluster-wide queue carrying decoded events.
pub const DEFAULT_EVENT_QUEUE: &str = "all-events";

/// Configuration for the cluster bootstrap coordinator.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Hostname of this process. Used as the cluster instance name and
    /// public address.
    pub hostname: Hostname,
    /// Service kind that must be present in the topology before joining.
    /// Default: tenant management.
    pub required_service_kind: ServiceKind,
    /// Port every member listens on. Default: 5701.
    pub cluster_port: u16,
    /// Delay between topology checks and join retries. Default: 1s.
    pub poll_interval: Duration,
    /// Cluster group name. Default: "sitewhere".
    pub group_name: String,
    /// Cluster group password. Default: "sitewhere".
    pub group_password: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            hostname: Hostname::new("localhost"),
            required_service_kind: ServiceKind::tenant_management(),
            cluster_port: DEFAULT_CLUSTER_PORT,
            poll_interval: Duration::from_secs(1),
            group_name: "sitewhere".to_string(),
            group_password: "sitewhere".to_string(),
        }
    }
}

impl BootstrapConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.hostname.as_str().is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: "hostname must not be empty".to_string(),
            });
        }
        if self.cluster_port == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "cluster_port must be > 0".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(MeshError::InvalidConfig {
                reason: "poll_interval must be > 0".to_string(),
            });
        }
        if self.group_name.is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: "group_name must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for a stream consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Client id reported to the stream transport.
    pub client_id: String,
    /// Consumer group id. Stable per logical consumer role.
    pub group_id: String,
    /// Comma-separated bootstrap servers for the stream transport.
    pub bootstrap_servers: String,
    /// Maximum number of records returned by one poll. Default: 500.
    pub max_poll_records: usize,
    /// Attempts made to process a single record before it is given up on.
    /// Default: 3.
    pub max_processing_attempts: u32,
    /// Delay between processing attempts for the same record. Default: 100ms.
    pub retry_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client_id: "meshplane-consumer".to_string(),
            group_id: "meshplane".to_string(),
            bootstrap_servers: "localhost:9092".to_string(),
            max_poll_records: 500,
            max_processing_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.group_id.is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: "group_id must not be empty".to_string(),
            });
        }
        if self.client_id.is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: "client_id must not be empty".to_string(),
            });
        }
        if self.max_poll_records == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "max_poll_records must be >= 1".to_string(),
            });
        }
        if self.max_processing_attempts == 0 {
            return Err(MeshError::InvalidConfig {
                reason: "max_processing_attempts must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for a stream producer.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub client_id: String,
    pub bootstrap_servers: String,
    /// How long to wait for the transport to acknowledge a write. Default: 5s.
    pub delivery_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: "meshplane-producer".to_string(),
            bootstrap_servers: "localhost:9092".to_string(),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.delivery_timeout.is_zero() {
            return Err(MeshError::InvalidConfig {
                reason: "delivery_timeout must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for the default topic naming scheme.
#[derive(Debug, Clone)]
pub struct TopicNamingConfig {
    /// Prefix shared by every topic. Default: "sitewhere".
    pub prefix: String,
    /// Identifier of the platform instance. Default: "default".
    pub instance_id: String,
}

impl Default for TopicNamingConfig {
    fn default() -> Self {
        Self {
            prefix: "sitewhere".to_string(),
            instance_id: "default".to_string(),
        }
    }
}

impl TopicNamingConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.prefix.is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: "topic prefix must not be empty".to_string(),
            });
        }
        if self.instance_id.is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: "instance_id must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for the distributed queue receiver.
#[derive(Debug, Clone)]
pub struct QueueReceiverConfig {
    /// Name of the cluster-wide queue. Default: "all-events".
    pub queue_name: String,
    /// Identifier of the event source owning the receiver, used in logs.
    pub source_id: String,
    /// Delay before taking again after the queue reported an error.
    /// Default: 1s.
    pub retry_backoff: Duration,
}

impl Default for QueueReceiverConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_EVENT_QUEUE.to_string(),
            source_id: "default".to_string(),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl QueueReceiverConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.queue_name.is_empty() {
            return Err(MeshError::InvalidConfig {
                reason: "queue_name must not be empty".to_string(),
            });
        }
        if self.retry_backoff.is_zero() {
            return Err(MeshError::InvalidConfig {
                reason: "queue receiver retry_backoff must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Aggregate configuration for one control-plane process.
#[derive(Debug, Clone, Default)]
pub struct MeshConfig {
    pub bootstrap: BootstrapConfig,
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
    pub topic_naming: TopicNamingConfig,
    pub queue_receiver: QueueReceiverConfig,
}

impl MeshConfig {
    /// Validate every component configuration.
    pub fn validate(&self) -> Result<(), MeshError> {
        self.bootstrap.validate()?;
        self.consumer.validate()?;
        self.producer.validate()?;
        self.topic_naming.validate()?;
        self.queue_receiver.validate()?;
        Ok(())
    }
}
