use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cluster::{ClusterConnector, ClusterHandle, JoinConfig};
use crate::config::BootstrapConfig;
use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::topology::TopologyProvider;
use crate::types::MemberAddress;

/// Receiving side of the bootstrap result. Holds `None` until the cluster
/// connection is established.
pub type ClusterHandleReceiver = watch::Receiver<Option<Arc<dyn ClusterHandle>>>;

/// Waits for the required peer service kind to appear in the topology, then
/// joins the data grid with every instance of that kind as a member.
///
/// Owns one background task. The task ends once the join succeeds; the
/// resulting handle is published to every subscriber and shut down on
/// [`ClusterBootstrap::stop`].
pub struct ClusterBootstrap {
    config: BootstrapConfig,
    topology: Arc<dyn TopologyProvider>,
    connector: Arc<dyn ClusterConnector>,
    metrics: Arc<MeshMetrics>,
    cancel: CancellationToken,
    handle_tx: watch::Sender<Option<Arc<dyn ClusterHandle>>>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClusterBootstrap {
    pub fn new(
        config: BootstrapConfig,
        topology: Arc<dyn TopologyProvider>,
        connector: Arc<dyn ClusterConnector>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        let (handle_tx, _) = watch::channel(None);
        Self {
            config,
            topology,
            connector,
            metrics,
            cancel: CancellationToken::new(),
            handle_tx,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the bootstrap task. Calling `start` again while the task
    /// exists has no effect.
    pub fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        self.config.validate()?;
        if self.cancel.is_cancelled() {
            return Err(MeshError::ShuttingDown);
        }
        let mut task = self.task.lock();
        if task.is_some() {
            tracing::warn!("cluster bootstrap already started");
            return Ok(());
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run().await }));
        Ok(())
    }

    /// Cancel the bootstrap task, wait for it to end and leave the cluster
    /// if it was joined.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "cluster bootstrap task panicked");
            }
        }
        let handle = self.handle_tx.send_replace(None);
        if let Some(handle) = handle {
            if let Err(e) = handle.shutdown().await {
                tracing::warn!(error = %e, "failed to leave cluster during shutdown");
            }
            self.metrics.cluster_connected.set(0);
        }
    }

    /// Current cluster handle, if the join has completed.
    pub fn handle(&self) -> Option<Arc<dyn ClusterHandle>> {
        self.handle_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> ClusterHandleReceiver {
        self.handle_tx.subscribe()
    }

    /// Wait until the cluster connection is established. Fails with
    /// `ShuttingDown` if the coordinator is stopped first.
    pub async fn wait_for_handle(&self) -> Result<Arc<dyn ClusterHandle>, MeshError> {
        let mut rx = self.handle_tx.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MeshError::ShuttingDown),
            handle = await_handle(&mut rx) => handle.ok_or(MeshError::ShuttingDown),
        }
    }

    #[instrument(skip(self), fields(
        hostname = %self.config.hostname,
        required = %self.config.required_service_kind,
    ))]
    async fn run(&self) {
        let mut changes = self.topology.changes();
        loop {
            let mut attempted = false;
            match self.topology.snapshot() {
                None => tracing::debug!("topology not available yet"),
                Some(snapshot) => {
                    let members = snapshot
                        .member_addresses(&self.config.required_service_kind, self.config.cluster_port);
                    if members.is_empty() {
                        tracing::debug!("no instances of required service kind yet");
                    } else {
                        attempted = true;
                        let joined = tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            joined = self.try_join(members) => joined,
                        };
                        match joined {
                            Ok(handle) => {
                                self.metrics.cluster_connected.set(1);
                                self.handle_tx.send_replace(Some(handle));
                                return;
                            }
                            Err(e) => tracing::warn!(error = %e, "unable to join cluster, will retry"),
                        }
                    }
                }
            }

            // A failed join waits out the full interval; otherwise a topology
            // change cuts the wait short.
            let wake = if attempted { None } else { changes.as_mut() };
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("cluster bootstrap stopped before joining");
                    return;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = topology_changed(wake) => {}
            }
        }
    }

    async fn try_join(
        &self,
        members: Vec<MemberAddress>,
    ) -> Result<Arc<dyn ClusterHandle>, MeshError> {
        let config = JoinConfig::new(&self.config, members);
        let member_list = config
            .members
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(members = %member_list, "joining cluster");
        self.metrics.cluster_join_attempts.inc();
        let handle = self.connector.join(&config).await?;
        tracing::info!(members = %member_list, "cluster connection established");
        Ok(handle)
    }
}

async fn await_handle(rx: &mut ClusterHandleReceiver) -> Option<Arc<dyn ClusterHandle>> {
    match rx.wait_for(Option::is_some).await {
        Ok(handle) => handle.clone(),
        Err(_) => None,
    }
}

async fn topology_changed(rx: Option<&mut watch::Receiver<u64>>) {
    match rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_cluster::MemoryClusterConnector;
    use crate::topology::{
        InstanceDescriptor, InstanceState, SharedTopology, TopologyEntry, TopologySnapshot,
    };
    use crate::types::{Hostname, ServiceKind};
    use std::time::Duration;

    fn config(required: ServiceKind) -> BootstrapConfig {
        BootstrapConfig {
            hostname: Hostname::new("node-1"),
            required_service_kind: required,
            ..Default::default()
        }
    }

    fn snapshot_with(kind: ServiceKind, hosts: &[&str]) -> TopologySnapshot {
        TopologySnapshot::from_instances(hosts.iter().map(|h| {
            InstanceDescriptor::new(Hostname::new(*h), kind.clone(), InstanceState::Running)
        }))
    }

    fn bootstrap(
        topology: Arc<dyn TopologyProvider>,
        connector: Arc<MemoryClusterConnector>,
        required: ServiceKind,
    ) -> Arc<ClusterBootstrap> {
        Arc::new(ClusterBootstrap::new(
            config(required),
            topology,
            connector,
            Arc::new(MeshMetrics::unregistered()),
        ))
    }

    /// Provider without change notification, so bootstrap must poll it.
    struct PolledTopology(parking_lot::Mutex<Option<Arc<TopologySnapshot>>>);

    impl TopologyProvider for PolledTopology {
        fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
            self.0.lock().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn joins_with_single_required_instance() {
        let topology = Arc::new(SharedTopology::with_snapshot(snapshot_with(
            ServiceKind::device_management(),
            &["host-a"],
        )));
        let connector = Arc::new(MemoryClusterConnector::new());
        let b = bootstrap(topology, connector.clone(), ServiceKind::device_management());
        b.start().unwrap();

        let handle = b.wait_for_handle().await.unwrap();
        assert_eq!(handle.members(), vec![MemberAddress::new("host-a", 5701)]);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let attempts = connector.join_attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].members, vec![MemberAddress::new("host-a", 5701)]);
        assert_eq!(attempts[0].instance_name, "node-1");
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn members_cover_every_instance_in_hostname_order() {
        let topology = Arc::new(SharedTopology::with_snapshot(snapshot_with(
            ServiceKind::tenant_management(),
            &["tm-2", "tm-1", "tm-3"],
        )));
        let connector = Arc::new(MemoryClusterConnector::new());
        let b = bootstrap(topology, connector.clone(), ServiceKind::tenant_management());
        b.start().unwrap();
        b.wait_for_handle().await.unwrap();

        let members: Vec<String> = connector.join_attempts()[0]
            .members
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(members, vec!["tm-1:5701", "tm-2:5701", "tm-3:5701"]);
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn never_joins_without_members() {
        let topology = Arc::new(SharedTopology::new());
        let connector = Arc::new(MemoryClusterConnector::new());
        let b = bootstrap(
            topology.clone(),
            connector.clone(),
            ServiceKind::device_management(),
        );
        b.start().unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(connector.join_attempts().is_empty());

        topology.publish(snapshot_with(ServiceKind::event_sources(), &["es-1"]));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(connector.join_attempts().is_empty());

        let mut empty_entry = TopologySnapshot::default();
        empty_entry
            .entries_by_service_kind
            .insert(ServiceKind::device_management(), TopologyEntry::default());
        topology.publish(empty_entry);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(connector.join_attempts().is_empty());
        assert!(b.handle().is_none());

        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn polled_topology_joins_within_one_interval() {
        let topology = Arc::new(PolledTopology(parking_lot::Mutex::new(None)));
        let connector = Arc::new(MemoryClusterConnector::new());
        let b = bootstrap(
            topology.clone(),
            connector.clone(),
            ServiceKind::device_management(),
        );
        b.start().unwrap();

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        *topology.0.lock() = Some(Arc::new(snapshot_with(
            ServiceKind::device_management(),
            &["host-a"],
        )));

        let joined = tokio::time::timeout(Duration::from_secs(1), b.wait_for_handle()).await;
        assert!(joined.is_ok(), "join did not complete within one interval");
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn topology_change_wakes_bootstrap_early() {
        let topology = Arc::new(SharedTopology::new());
        let connector = Arc::new(MemoryClusterConnector::new());
        let b = bootstrap(
            topology.clone(),
            connector.clone(),
            ServiceKind::device_management(),
        );
        b.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let before = tokio::time::Instant::now();
        topology.publish(snapshot_with(ServiceKind::device_management(), &["host-a"]));
        b.wait_for_handle().await.unwrap();
        assert!(before.elapsed() < Duration::from_secs(1));
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_join_with_fixed_delay() {
        let topology = Arc::new(SharedTopology::with_snapshot(snapshot_with(
            ServiceKind::device_management(),
            &["host-a"],
        )));
        let connector = Arc::new(MemoryClusterConnector::new());
        connector.fail_next_joins(2);
        let b = bootstrap(topology, connector.clone(), ServiceKind::device_management());

        let started = tokio::time::Instant::now();
        b.start().unwrap();
        b.wait_for_handle().await.unwrap();

        assert_eq!(connector.join_attempts().len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_waiting_bootstrap() {
        let topology = Arc::new(SharedTopology::new());
        let connector = Arc::new(MemoryClusterConnector::new());
        let b = bootstrap(topology, connector, ServiceKind::device_management());
        b.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.wait_for_handle().await })
        };
        tokio::time::timeout(Duration::from_millis(10), b.stop())
            .await
            .expect("stop should not wait for the poll interval");

        let err = waiter.await.unwrap().err().unwrap();
        assert!(matches!(err, MeshError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_joined_cluster() {
        let topology = Arc::new(SharedTopology::with_snapshot(snapshot_with(
            ServiceKind::device_management(),
            &["host-a"],
        )));
        let connector = Arc::new(MemoryClusterConnector::new());
        let b = bootstrap(topology, connector, ServiceKind::device_management());
        b.start().unwrap();
        let handle = b.wait_for_handle().await.unwrap();
        assert!(handle.is_running());

        b.stop().await;
        assert!(!handle.is_running());
        assert!(b.handle().is_none());
        assert!(b.start().is_err());
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let b = ClusterBootstrap::new(
            BootstrapConfig {
                poll_interval: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(SharedTopology::new()),
            Arc::new(MemoryClusterConnector::new()),
            Arc::new(MeshMetrics::unregistered()),
        );
        let err = Arc::new(b).start().unwrap_err();
        assert!(matches!(err, MeshError::InvalidConfig { .. }));
    }
}
