//! etcd-backed topology: instances register JSON descriptors under a key
//! prefix with a lease, and every watcher rebuilds the snapshot from the
//! prefix whenever it changes.

use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, EventType, GetOptions, LeaseGrantOptions, PutOptions, WatchOptions};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::MeshError;
use crate::topology::{InstanceDescriptor, SharedTopology, TopologyProvider, TopologySnapshot};

/// Maximum backoff between watch reconnection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Topology provider fed by instance registrations in etcd.
///
/// The snapshot stays `None` until the first successful read of the
/// registration prefix.
pub struct EtcdTopology {
    client: Arc<Mutex<Client>>,
    prefix: String,
    lease_ttl: i64,
    topology: Arc<SharedTopology>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    lease_id: parking_lot::Mutex<Option<i64>>,
}

impl EtcdTopology {
    /// - `prefix`: key prefix for instance registrations (e.g. "/mesh/instances/").
    /// - `lease_ttl`: TTL in seconds of this process's registration.
    pub fn new(client: Client, prefix: impl Into<String>, lease_ttl: i64) -> Result<Self, MeshError> {
        if lease_ttl <= 0 {
            return Err(MeshError::InvalidConfig {
                reason: format!("lease_ttl must be positive, got {lease_ttl}"),
            });
        }
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            prefix: prefix.into(),
            lease_ttl,
            topology: Arc::new(SharedTopology::new()),
            cancel: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            lease_id: parking_lot::Mutex::new(None),
        })
    }

    fn instance_key(&self, descriptor: &InstanceDescriptor) -> String {
        format!(
            "{}{}/{}",
            self.prefix, descriptor.service_kind, descriptor.hostname
        )
    }

    fn map_err(e: etcd_client::Error) -> MeshError {
        MeshError::ServiceUnavailable {
            reason: format!("etcd: {e}"),
            source: Some(Box::new(e)),
        }
    }

    /// Snapshot holder the watch task publishes into.
    pub fn shared(&self) -> Arc<SharedTopology> {
        self.topology.clone()
    }

    /// Read every registration under the prefix and publish the resulting
    /// snapshot. Malformed entries are skipped.
    pub async fn refresh(&self) -> Result<(), MeshError> {
        let snapshot = load_snapshot(&self.client, &self.prefix).await?;
        self.topology.publish(snapshot);
        Ok(())
    }

    /// Register this process's descriptor under a lease kept alive in the
    /// background. The registration disappears when the process stops
    /// renewing it.
    pub async fn register_instance(&self, descriptor: &InstanceDescriptor) -> Result<i64, MeshError> {
        let value = serde_json::to_vec(descriptor).map_err(|e| MeshError::Serialization {
            reason: format!("failed to encode instance descriptor: {e}"),
            source: Some(Box::new(e)),
        })?;
        let key = self.instance_key(descriptor);

        let lease_id = {
            let mut client = self.client.lock().await;
            let lease = client
                .lease_grant(self.lease_ttl, None::<LeaseGrantOptions>)
                .await
                .map_err(Self::map_err)?;
            let lease_id = lease.id();
            if let Err(e) = client
                .put(key.as_str(), value, Some(PutOptions::new().with_lease(lease_id)))
                .await
            {
                if let Err(revoke_err) = client.lease_revoke(lease_id).await {
                    tracing::warn!(lease_id, error = %revoke_err, "failed to revoke lease after registration failure");
                }
                return Err(Self::map_err(e));
            }
            lease_id
        };
        tracing::info!(key = %key, lease_id, "registered instance");

        *self.lease_id.lock() = Some(lease_id);
        let task = tokio::spawn(keep_alive(
            self.client.clone(),
            lease_id,
            self.lease_ttl,
            self.cancel.clone(),
        ));
        self.tasks.lock().push(task);
        Ok(lease_id)
    }

    /// Load the current registrations, then keep the snapshot current from
    /// a prefix watch. Reconnects with exponential backoff when the watch
    /// stream fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        self.refresh().await?;
        let (watcher, stream) = {
            let mut client = self.client.lock().await;
            client
                .watch(self.prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                .await
                .map_err(Self::map_err)?
        };
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.watch_loop(watcher, stream).await });
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn watch_loop(&self, mut watcher: etcd_client::Watcher, mut stream: etcd_client::WatchStream) {
        let mut backoff = Duration::from_millis(500);
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = stream.message() => message,
            };
            match message {
                Ok(Some(resp)) => {
                    backoff = Duration::from_millis(500);
                    let relevant = resp
                        .events()
                        .iter()
                        .any(|e| matches!(e.event_type(), EventType::Put | EventType::Delete));
                    if relevant {
                        if let Err(e) = self.refresh().await {
                            tracing::warn!(error = %e, "failed to reload topology after change");
                        }
                    }
                    continue;
                }
                Ok(None) => tracing::warn!("etcd topology watch stream ended"),
                Err(e) => tracing::warn!(error = %e, "etcd topology watch stream error"),
            }

            // Reconnect.
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                let reconnected = {
                    let mut client = self.client.lock().await;
                    client
                        .watch(self.prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                        .await
                };
                match reconnected {
                    Ok((new_watcher, new_stream)) => {
                        watcher = new_watcher;
                        stream = new_stream;
                        tracing::info!("etcd topology watch reconnected");
                        if let Err(e) = self.refresh().await {
                            tracing::warn!(error = %e, "failed to reload topology after reconnect");
                        }
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "etcd topology watch reconnect failed"),
                }
            }
        }
        if let Err(e) = watcher.cancel().await {
            tracing::debug!(error = %e, "failed to cancel etcd watch");
        }
    }

    /// Stop watching, stop renewing the registration and revoke it.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "etcd topology task panicked");
            }
        }
        let lease_id = self.lease_id.lock().take();
        if let Some(lease_id) = lease_id {
            let mut client = self.client.lock().await;
            if let Err(e) = client.lease_revoke(lease_id).await {
                tracing::warn!(lease_id, error = %e, "failed to revoke registration lease, it will expire via TTL");
            }
        }
    }
}

impl TopologyProvider for EtcdTopology {
    fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.topology.snapshot()
    }

    fn changes(&self) -> Option<watch::Receiver<u64>> {
        self.topology.changes()
    }
}

async fn load_snapshot(client: &Mutex<Client>, prefix: &str) -> Result<TopologySnapshot, MeshError> {
    let resp = {
        let mut client = client.lock().await;
        client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(EtcdTopology::map_err)?
    };
    let instances = resp.kvs().iter().filter_map(|kv| {
        match serde_json::from_slice::<InstanceDescriptor>(kv.value()) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                tracing::warn!(
                    key = %kv.key_str().unwrap_or("<non-utf8>"),
                    error = %e,
                    "skipping malformed instance registration"
                );
                None
            }
        }
    });
    Ok(TopologySnapshot::from_instances(instances.collect::<Vec<_>>()))
}

async fn keep_alive(client: Arc<Mutex<Client>>, lease_id: i64, lease_ttl: i64, cancel: CancellationToken) {
    let interval = Duration::from_secs((lease_ttl as u64).max(3) / 3);
    loop {
        let started = {
            let mut c = client.lock().await;
            c.lease_keep_alive(lease_id).await
        };
        match started {
            Ok((mut keeper, mut stream)) => loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = keeper.keep_alive().await {
                    tracing::warn!(lease_id, error = %e, "etcd lease keep-alive failed, reconnecting");
                    break;
                }
                match tokio::time::timeout(Duration::from_secs(5), stream.message()).await {
                    Ok(Ok(Some(_))) => {}
                    Ok(Ok(None)) => {
                        tracing::warn!(lease_id, "etcd keep-alive stream ended");
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(lease_id, error = %e, "etcd keep-alive stream error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(lease_id, "etcd keep-alive response timed out");
                        break;
                    }
                }
            },
            Err(e) => {
                tracing::warn!(lease_id, error = %e, "etcd keep-alive initialization failed, retrying in 1s");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}
