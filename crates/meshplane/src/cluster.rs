use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BootstrapConfig;
use crate::error::MeshError;
use crate::types::MemberAddress;

/// Parameters for joining the distributed-data grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinConfig {
    /// Name of this process within the cluster (its hostname).
    pub instance_name: String,
    /// Explicit TCP member list. Never empty when handed to a connector.
    pub members: Vec<MemberAddress>,
    /// Port this member listens on.
    pub port: u16,
    /// Address other members use to reach this process.
    pub public_address: MemberAddress,
    pub group_name: String,
    pub group_password: String,
    /// Discovery is always by explicit member list.
    pub multicast_enabled: bool,
}

impl JoinConfig {
    pub fn new(config: &BootstrapConfig, members: Vec<MemberAddress>) -> Self {
        Self {
            instance_name: config.hostname.to_string(),
            members,
            port: config.cluster_port,
            public_address: MemberAddress::for_host(&config.hostname, config.cluster_port),
            group_name: config.group_name.clone(),
            group_password: config.group_password.clone(),
            multicast_enabled: false,
        }
    }
}

/// Establishes the process-wide connection to the data grid.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn join(&self, config: &JoinConfig) -> Result<Arc<dyn ClusterHandle>, MeshError>;
}

/// Shared connection to the data grid. One per process, read concurrently.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    fn instance_name(&self) -> &str;

    /// Members this handle was joined with.
    fn members(&self) -> Vec<MemberAddress>;

    /// Named cluster-wide FIFO queue.
    fn queue(&self, name: &str) -> Arc<dyn DistributedQueue>;

    /// Named cluster-wide key/value map.
    fn map(&self, name: &str) -> Arc<dyn DistributedMap>;

    fn is_running(&self) -> bool;

    /// Leave the cluster. Blocked `take` calls on this handle's queues fail
    /// with `QueueClosed`.
    async fn shutdown(&self) -> Result<(), MeshError>;
}

/// Cluster-wide FIFO queue of opaque items.
#[async_trait]
pub trait DistributedQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn offer(&self, item: Vec<u8>) -> Result<(), MeshError>;

    /// Remove the head of the queue, waiting until an item is available.
    ///
    /// Cancel safe: dropping the future never loses an item.
    async fn take(&self) -> Result<Vec<u8>, MeshError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cluster-wide map of string keys to opaque values.
#[async_trait]
pub trait DistributedMap: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError>;

    /// Insert a value, returning the previous one.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, MeshError>;

    async fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError>;
}
