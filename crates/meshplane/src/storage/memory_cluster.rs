use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterConnector, ClusterHandle, DistributedMap, DistributedQueue, JoinConfig};
use crate::error::MeshError;
use crate::types::MemberAddress;

/// In-process data grid. Every handle joined through the same connector
/// shares its queues and maps.
#[derive(Default)]
struct Grid {
    queues: DashMap<String, Arc<MemoryQueue>>,
    maps: DashMap<String, Arc<Mutex<HashMap<String, Vec<u8>>>>>,
}

impl Grid {
    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::default()))
            .clone()
    }

    fn map(&self, name: &str) -> Arc<Mutex<HashMap<String, Vec<u8>>>> {
        self.maps
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[derive(Default)]
struct MemoryQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

/// In-memory cluster connector for testing and single-process deployments.
///
/// Records every join attempt and can be told to fail the next N joins.
#[derive(Default)]
pub struct MemoryClusterConnector {
    grid: Arc<Grid>,
    joins: Mutex<Vec<JoinConfig>>,
    failures_remaining: AtomicU32,
}

impl MemoryClusterConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` join attempts with `ClusterJoinFailure`.
    pub fn fail_next_joins(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Every join attempt seen so far, including failed ones.
    pub fn join_attempts(&self) -> Vec<JoinConfig> {
        self.joins.lock().clone()
    }

    /// Open a handle on the shared grid without going through `join`, as a
    /// peer process would.
    pub fn peer_handle(&self, instance_name: impl Into<String>) -> Arc<dyn ClusterHandle> {
        Arc::new(MemoryClusterHandle {
            instance_name: instance_name.into(),
            members: Vec::new(),
            grid: self.grid.clone(),
            closed: CancellationToken::new(),
            running: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl ClusterConnector for MemoryClusterConnector {
    async fn join(&self, config: &JoinConfig) -> Result<Arc<dyn ClusterHandle>, MeshError> {
        self.joins.lock().push(config.clone());
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MeshError::ClusterJoinFailure {
                members: config.members.clone(),
                source: Some("injected join failure".into()),
            });
        }
        Ok(Arc::new(MemoryClusterHandle {
            instance_name: config.instance_name.clone(),
            members: config.members.clone(),
            grid: self.grid.clone(),
            closed: CancellationToken::new(),
            running: AtomicBool::new(true),
        }))
    }
}

pub struct MemoryClusterHandle {
    instance_name: String,
    members: Vec<MemberAddress>,
    grid: Arc<Grid>,
    closed: CancellationToken,
    running: AtomicBool,
}

#[async_trait]
impl ClusterHandle for MemoryClusterHandle {
    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    fn members(&self) -> Vec<MemberAddress> {
        self.members.clone()
    }

    fn queue(&self, name: &str) -> Arc<dyn DistributedQueue> {
        Arc::new(MemoryQueueView {
            name: name.to_string(),
            queue: self.grid.queue(name),
            closed: self.closed.clone(),
        })
    }

    fn map(&self, name: &str) -> Arc<dyn DistributedMap> {
        Arc::new(MemoryMapView {
            name: name.to_string(),
            entries: self.grid.map(name),
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), MeshError> {
        self.running.store(false, Ordering::SeqCst);
        self.closed.cancel();
        tracing::info!(instance = %self.instance_name, "left in-memory cluster");
        Ok(())
    }
}

struct MemoryQueueView {
    name: String,
    queue: Arc<MemoryQueue>,
    closed: CancellationToken,
}

#[async_trait]
impl DistributedQueue for MemoryQueueView {
    fn name(&self) -> &str {
        &self.name
    }

    async fn offer(&self, item: Vec<u8>) -> Result<(), MeshError> {
        if self.closed.is_cancelled() {
            return Err(MeshError::QueueClosed {
                queue: self.name.clone(),
            });
        }
        self.queue.items.lock().push_back(item);
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn take(&self) -> Result<Vec<u8>, MeshError> {
        loop {
            // Register interest before checking so an offer between the
            // check and the await is not missed.
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.is_cancelled() {
                return Err(MeshError::QueueClosed {
                    queue: self.name.clone(),
                });
            }
            if let Some(item) = self.queue.items.lock().pop_front() {
                return Ok(item);
            }

            tokio::select! {
                _ = self.closed.cancelled() => {
                    return Err(MeshError::QueueClosed {
                        queue: self.name.clone(),
                    });
                }
                _ = &mut notified => {}
            }
        }
    }

    fn len(&self) -> usize {
        self.queue.items.lock().len()
    }
}

struct MemoryMapView {
    name: String,
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl DistributedMap for MemoryMapView {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, MeshError> {
        Ok(self.entries.lock().insert(key.to_string(), value))
    }

    async fn remove(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        Ok(self.entries.lock().remove(key))
    }
}
