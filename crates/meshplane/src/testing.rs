//! In-memory fakes for unit and integration testing.
//!
//! Everything here records what it was asked to do so tests can assert on
//! it. Paired with the in-memory backends in [`crate::storage`] these let a
//! whole control plane run inside one test without external services.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cluster::{ClusterConnector, ClusterHandle, JoinConfig};
use crate::command::{
    AssignmentContext, CommandDestination, CommandExecution, NestingContext, SystemCommand,
};
use crate::error::MeshError;
use crate::record::RecordProcessor;
use crate::tenant::current_tenant;
use crate::topology::{
    InstanceDescriptor, InstanceState, TopologyProvider, TopologySnapshot,
};
use crate::types::{DestinationId, Hostname, ServiceKind, TenantId};

/// Install a `tracing` subscriber honouring `RUST_LOG`. Safe to call more
/// than once.
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshplane=debug")))
        .try_init();
}

/// Poll `condition` until it holds or `timeout` elapses. Returns whether it
/// held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test if it takes longer than `timeout`.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    match tokio::time::timeout(timeout, future).await {
        Ok(output) => output,
        Err(_) => panic!("operation did not complete within {timeout:?}"),
    }
}

/// One call to [`RecordProcessor::received`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRecord {
    pub key: String,
    pub payload: Vec<u8>,
    /// Ambient tenant at the time of the call.
    pub tenant: Option<TenantId>,
}

/// Processor recording every record it accepts. Can be told to fail a key a
/// number of times, or always.
#[derive(Default)]
pub struct RecordingProcessor {
    received: Mutex<Vec<ReceivedRecord>>,
    failures: Mutex<HashMap<String, Option<usize>>>,
    attempts: AtomicUsize,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls for `key`.
    pub fn fail_times(&self, key: impl Into<String>, times: usize) {
        self.failures.lock().insert(key.into(), Some(times));
    }

    /// Fail every call for `key`.
    pub fn fail_always(&self, key: impl Into<String>) {
        self.failures.lock().insert(key.into(), None);
    }

    /// Records accepted so far, in call order.
    pub fn records(&self) -> Vec<ReceivedRecord> {
        self.received.lock().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.received.lock().iter().map(|r| r.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls made so far, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordProcessor for RecordingProcessor {
    async fn received(&self, key: &str, payload: &[u8]) -> Result<(), MeshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock();
            match failures.get_mut(key) {
                Some(None) => {
                    return Err(MeshError::ServiceUnavailable {
                        reason: format!("processing of {key} always fails"),
                        source: None,
                    })
                }
                Some(Some(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(MeshError::ServiceUnavailable {
                        reason: format!("processing of {key} failed"),
                        source: None,
                    });
                }
                _ => {}
            }
        }
        self.received.lock().push(ReceivedRecord {
            key: key.to_string(),
            payload: payload.to_vec(),
            tenant: current_tenant().map(|c| c.tenant_id),
        });
        Ok(())
    }
}

/// Processor that applies each key at most once: replays of an already seen
/// key are acknowledged and ignored.
#[derive(Default)]
pub struct IdempotentSink {
    state: Mutex<BTreeMap<String, Vec<u8>>>,
    deliveries: AtomicUsize,
}

impl IdempotentSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied state: one entry per distinct key.
    pub fn state(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().clone()
    }

    /// Total calls, replays included.
    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordProcessor for IdempotentSink {
    async fn received(&self, key: &str, payload: &[u8]) -> Result<(), MeshError> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| payload.to_vec());
        Ok(())
    }
}

/// A command handed to a [`RecordingDestination`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Command(CommandExecution),
    System(SystemCommand),
}

/// Command destination recording every delivery.
pub struct RecordingDestination {
    id: DestinationId,
    fail: bool,
    deliveries: Mutex<Vec<Delivery>>,
    nesting: Mutex<Vec<NestingContext>>,
}

impl RecordingDestination {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DestinationId::new(id),
            fail: false,
            deliveries: Mutex::new(Vec::new()),
            nesting: Mutex::new(Vec::new()),
        }
    }

    /// Destination whose deliveries always fail.
    pub fn failing(id: impl Into<String>) -> Self {
        Self {
            fail: true,
            ..Self::new(id)
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn nesting_seen(&self) -> Vec<NestingContext> {
        self.nesting.lock().clone()
    }

    fn record(&self, delivery: Delivery, nesting: &NestingContext) -> Result<(), MeshError> {
        if self.fail {
            return Err(MeshError::ServiceUnavailable {
                reason: format!("destination {} is offline", self.id),
                source: None,
            });
        }
        self.deliveries.lock().push(delivery);
        self.nesting.lock().push(nesting.clone());
        Ok(())
    }
}

#[async_trait]
impl CommandDestination for RecordingDestination {
    fn destination_id(&self) -> &DestinationId {
        &self.id
    }

    async fn deliver_command(
        &self,
        execution: &CommandExecution,
        nesting: &NestingContext,
        _assignment: &AssignmentContext,
    ) -> Result<(), MeshError> {
        self.record(Delivery::Command(execution.clone()), nesting)
    }

    async fn deliver_system_command(
        &self,
        command: &SystemCommand,
        nesting: &NestingContext,
        _assignment: &AssignmentContext,
    ) -> Result<(), MeshError> {
        self.record(Delivery::System(command.clone()), nesting)
    }
}

/// Topology provider returning a fixed snapshot and never signalling
/// changes.
pub struct StaticTopology {
    snapshot: Option<Arc<TopologySnapshot>>,
}

impl StaticTopology {
    /// Provider whose topology is never ready.
    pub fn not_ready() -> Self {
        Self { snapshot: None }
    }

    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self {
            snapshot: Some(Arc::new(snapshot)),
        }
    }

    /// Running instances of `kind` on each of `hosts`.
    pub fn with_instances(kind: ServiceKind, hosts: &[&str]) -> Self {
        Self::new(TopologySnapshot::from_instances(hosts.iter().map(|h| {
            InstanceDescriptor::new(Hostname::new(*h), kind.clone(), InstanceState::Running)
        })))
    }
}

impl TopologyProvider for StaticTopology {
    fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.snapshot.clone()
    }
}

/// Connector whose joins always fail.
#[derive(Default)]
pub struct FailingConnector {
    attempts: AtomicUsize,
}

impl FailingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterConnector for FailingConnector {
    async fn join(&self, config: &JoinConfig) -> Result<Arc<dyn ClusterHandle>, MeshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(MeshError::ClusterJoinFailure {
            members: config.members.clone(),
            source: Some("connection refused".into()),
        })
    }
}
