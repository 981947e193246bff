use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Control-plane prometheus metrics.
pub struct MeshMetrics {
    /// Number of cluster join attempts made by the bootstrap coordinator.
    pub cluster_join_attempts: IntCounter,
    /// 1 once the cluster connection is established, 0 otherwise.
    pub cluster_connected: IntGauge,
    /// Records handed to `received` successfully.
    pub records_processed: IntCounter,
    /// Per-partition offset commits.
    pub offset_commits: IntCounter,
    /// Records whose processing attempts were exhausted.
    pub processing_failures: IntCounter,
    /// Records forwarded to the dead-letter sink.
    pub records_dead_lettered: IntCounter,
    /// Items taken from the distributed queue.
    pub queue_items_received: IntCounter,
    /// Events published, labelled by outcome (`ok` / `error`).
    pub events_published: IntCounterVec,
    /// Command routing outcomes, labelled by outcome (`delivered` /
    /// `delivery_failed` / `destination_not_found` / `no_destination`).
    pub commands_routed: IntCounterVec,
}

impl MeshMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.cluster_join_attempts.clone()))?;
        registry.register(Box::new(metrics.cluster_connected.clone()))?;
        registry.register(Box::new(metrics.records_processed.clone()))?;
        registry.register(Box::new(metrics.offset_commits.clone()))?;
        registry.register(Box::new(metrics.processing_failures.clone()))?;
        registry.register(Box::new(metrics.records_dead_lettered.clone()))?;
        registry.register(Box::new(metrics.queue_items_received.clone()))?;
        registry.register(Box::new(metrics.events_published.clone()))?;
        registry.register(Box::new(metrics.commands_routed.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric definitions")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            cluster_join_attempts: IntCounter::with_opts(Opts::new(
                "mesh_cluster_join_attempts",
                "Number of cluster join attempts",
            ))?,
            cluster_connected: IntGauge::with_opts(Opts::new(
                "mesh_cluster_connected",
                "Whether the cluster connection is established",
            ))?,
            records_processed: IntCounter::with_opts(Opts::new(
                "mesh_records_processed",
                "Stream records processed successfully",
            ))?,
            offset_commits: IntCounter::with_opts(Opts::new(
                "mesh_offset_commits",
                "Per-partition offset commits",
            ))?,
            processing_failures: IntCounter::with_opts(Opts::new(
                "mesh_processing_failures",
                "Stream records whose processing attempts were exhausted",
            ))?,
            records_dead_lettered: IntCounter::with_opts(Opts::new(
                "mesh_records_dead_lettered",
                "Stream records forwarded to the dead-letter sink",
            ))?,
            queue_items_received: IntCounter::with_opts(Opts::new(
                "mesh_queue_items_received",
                "Items taken from the distributed event queue",
            ))?,
            events_published: IntCounterVec::new(
                Opts::new("mesh_events_published", "Events published by outcome"),
                &["outcome"],
            )?,
            commands_routed: IntCounterVec::new(
                Opts::new("mesh_commands_routed", "Command routing outcomes"),
                &["outcome"],
            )?,
        })
    }
}
