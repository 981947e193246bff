use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::types::{Hostname, MemberAddress, ServiceKind};

/// Liveness state reported for a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

/// One running instance of a service kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub hostname: Hostname,
    pub service_kind: ServiceKind,
    pub state: InstanceState,
    /// Time of the last heartbeat observed for the instance, if known.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl InstanceDescriptor {
    pub fn new(hostname: Hostname, service_kind: ServiceKind, state: InstanceState) -> Self {
        Self {
            hostname,
            service_kind,
            state,
            last_heartbeat: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, InstanceState::Starting | InstanceState::Running)
    }
}

/// Instances of a single service kind, keyed by hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub microservices_by_hostname: BTreeMap<Hostname, InstanceDescriptor>,
}

impl TopologyEntry {
    pub fn is_empty(&self) -> bool {
        self.microservices_by_hostname.is_empty()
    }

    pub fn len(&self) -> usize {
        self.microservices_by_hostname.len()
    }
}

/// Immutable point-in-time view of the mesh. Replaced wholesale on every
/// topology change, never mutated in place once published.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub entries_by_service_kind: BTreeMap<ServiceKind, TopologyEntry>,
}

impl TopologySnapshot {
    /// Build a snapshot from a flat list of instance descriptors.
    pub fn from_instances(instances: impl IntoIterator<Item = InstanceDescriptor>) -> Self {
        let mut snapshot = Self::default();
        for instance in instances {
            snapshot
                .entries_by_service_kind
                .entry(instance.service_kind.clone())
                .or_default()
                .microservices_by_hostname
                .insert(instance.hostname.clone(), instance);
        }
        snapshot
    }

    pub fn entry(&self, kind: &ServiceKind) -> Option<&TopologyEntry> {
        self.entries_by_service_kind.get(kind)
    }

    /// Cluster member addresses for every instance of `kind`, in hostname
    /// order. Empty when the kind is absent or has no instances.
    pub fn member_addresses(&self, kind: &ServiceKind, port: u16) -> Vec<MemberAddress> {
        self.entry(kind)
            .map(|entry| {
                entry
                    .microservices_by_hostname
                    .keys()
                    .map(|host| MemberAddress::for_host(host, port))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Source of topology snapshots.
///
/// `snapshot` returning `None` means the topology is not known yet, which is
/// distinct from a known-empty mesh.
pub trait TopologyProvider: Send + Sync {
    fn snapshot(&self) -> Option<Arc<TopologySnapshot>>;

    /// Receiver that changes whenever a new snapshot is published. Providers
    /// that cannot signal changes return `None` and are polled instead.
    fn changes(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Topology holder that snapshot publishers write into and readers load
/// from without locking.
pub struct SharedTopology {
    current: ArcSwapOption<TopologySnapshot>,
    version: watch::Sender<u64>,
}

impl SharedTopology {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            current: ArcSwapOption::empty(),
            version,
        }
    }

    pub fn with_snapshot(snapshot: TopologySnapshot) -> Self {
        let topology = Self::new();
        topology.publish(snapshot);
        topology
    }

    /// Replace the current snapshot and wake every watcher.
    pub fn publish(&self, snapshot: TopologySnapshot) {
        self.current.store(Some(Arc::new(snapshot)));
        self.version.send_modify(|v| *v += 1);
        tracing::debug!(version = *self.version.borrow(), "published topology snapshot");
    }

    /// Forget the current snapshot, returning to the "not ready" state.
    pub fn clear(&self) {
        self.current.store(None);
        self.version.send_modify(|v| *v += 1);
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Stream yielding the current snapshot and then every published
    /// replacement. Intermediate snapshots may be skipped by slow readers.
    pub fn watch_snapshots(
        self: &Arc<Self>,
    ) -> Pin<Box<dyn Stream<Item = Option<Arc<TopologySnapshot>>> + Send>> {
        let this = Arc::clone(self);
        Box::pin(WatchStream::new(self.version.subscribe()).map(move |_| this.current.load_full()))
    }
}

impl Default for SharedTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyProvider for SharedTopology {
    fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.current.load_full()
    }

    fn changes(&self) -> Option<watch::Receiver<u64>> {
        Some(self.version.subscribe())
    }
}

impl<T: TopologyProvider + ?Sized> TopologyProvider for Arc<T> {
    fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        (**self).snapshot()
    }

    fn changes(&self) -> Option<watch::Receiver<u64>> {
        (**self).changes()
    }
}
