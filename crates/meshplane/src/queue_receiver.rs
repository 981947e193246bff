use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::bootstrap::ClusterHandleReceiver;
use crate::cluster::{ClusterHandle, DistributedQueue};
use crate::config::QueueReceiverConfig;
use crate::error::MeshError;
use crate::metrics::MeshMetrics;
use crate::record::RecordProcessor;

/// Item carried on the distributed event queue, encoded as MessagePack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub key: String,
    pub payload: Vec<u8>,
}

impl QueueItem {
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec_named(self).map_err(|e| MeshError::Serialization {
            reason: format!("failed to encode queue item: {e}"),
            source: Some(Box::new(e)),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MeshError> {
        rmp_serde::from_slice(bytes).map_err(|e| MeshError::Serialization {
            reason: format!("failed to decode queue item: {e}"),
            source: Some(Box::new(e)),
        })
    }
}

/// Offer an item on the named queue of `handle`.
pub async fn offer_item(
    handle: &dyn ClusterHandle,
    queue_name: &str,
    item: &QueueItem,
) -> Result<(), MeshError> {
    handle.queue(queue_name).offer(item.encode()?).await
}

/// Takes decoded events from a cluster-wide queue and hands each one to a
/// [`RecordProcessor`].
///
/// Waits for the cluster connection published by the bootstrap coordinator
/// before dequeuing. Exactly one dequeuing task per receiver; stopping it
/// leaves queued items in place for other receivers.
pub struct QueueReceiver {
    config: QueueReceiverConfig,
    cluster: ClusterHandleReceiver,
    processor: Arc<dyn RecordProcessor>,
    metrics: Arc<MeshMetrics>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QueueReceiver {
    pub fn new(
        config: QueueReceiverConfig,
        cluster: ClusterHandleReceiver,
        processor: Arc<dyn RecordProcessor>,
        metrics: Arc<MeshMetrics>,
    ) -> Self {
        Self {
            config,
            cluster,
            processor,
            metrics,
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn display_name(&self) -> String {
        format!("Cluster Queue Receiver ({})", self.config.queue_name)
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn start(self: &Arc<Self>) -> Result<(), MeshError> {
        self.config.validate()?;
        if self.cancel.is_cancelled() {
            return Err(MeshError::ShuttingDown);
        }
        let mut task = self.task.lock();
        if task.is_some() {
            tracing::warn!(queue = %self.config.queue_name, "queue receiver already started");
            return Ok(());
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run().await }));
        Ok(())
    }

    /// Interrupt the blocked dequeue and wait for the task to end. Items
    /// still queued are not drained.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "queue receiver task panicked");
            }
        }
    }

    #[instrument(skip(self), fields(queue = %self.config.queue_name, source_id = %self.config.source_id))]
    async fn run(&self) {
        let mut cluster = self.cluster.clone();
        let handle = tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::info!("queue receiver stopped before cluster connection was available");
                return;
            }
            handle = cluster.wait_for(Option::is_some) => match handle {
                Ok(handle) => handle.clone(),
                Err(_) => None,
            },
        };
        let Some(handle) = handle else {
            tracing::warn!("cluster connection closed before it became available");
            return;
        };

        let queue = handle.queue(&self.config.queue_name);
        tracing::info!("queue receiver started");
        self.receive_loop(queue.as_ref()).await;
        tracing::info!("queue receiver stopped");
    }

    async fn receive_loop(&self, queue: &dyn DistributedQueue) {
        loop {
            let taken = tokio::select! {
                _ = self.cancel.cancelled() => return,
                taken = queue.take() => taken,
            };
            let bytes = match taken {
                Ok(bytes) => bytes,
                Err(MeshError::QueueClosed { .. }) => {
                    tracing::info!("distributed queue closed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        backoff_ms = self.config.retry_backoff.as_millis() as u64,
                        "failed to take item from distributed queue, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                    continue;
                }
            };
            self.metrics.queue_items_received.inc();

            let item = match QueueItem::decode(&bytes) {
                Ok(item) => item,
                Err(e) => {
                    tracing::error!(error = %e, len = bytes.len(), "discarding undecodable queue item");
                    continue;
                }
            };
            if let Err(e) = self.processor.received(&item.key, &item.payload).await {
                self.metrics.processing_failures.inc();
                tracing::error!(key = %item.key, error = %e, "failed to process queue item");
            }
        }
    }
}
