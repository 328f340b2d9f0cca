//! Refresh and publish loop
//!
//! Every check period the reconciler re-reads the kubelet configuration and
//! the NUMA topology, and writes the node's `Numatopology` record when
//! anything changed or the record is missing.

use crate::cpuset::parse_cpu_list;
use crate::health::{components, HealthRegistry};
use crate::kubelet::KubeletConfiguration;
use crate::machine::RESOURCE_CPU;
use crate::observability::{ExporterMetrics, StructuredLogger};
use crate::quantity::ResourceList;
use crate::record::{NumatopoSpec, Numatopology, RecordStore, RecordStoreError};
use crate::reservation::ReservationState;
use crate::topology::{TopologyConfig, TopologyRegistry};
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the reconcile loop
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between cycles (default: 3 seconds)
    pub check_period: Duration,
    /// Kubelet configuration file
    pub kubelet_conf: PathBuf,
    /// Topology sources
    pub topology: TopologyConfig,
    /// Operator reservation overrides, e.g. `cpu -> 200m`
    pub res_reserved: BTreeMap<String, String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            check_period: Duration::from_secs(3),
            kubelet_conf: PathBuf::from("/var/lib/kubelet/config.yaml"),
            topology: TopologyConfig::default(),
            res_reserved: BTreeMap::new(),
        }
    }
}

/// How the node record was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOperation {
    Create,
    Update,
}

impl PublishOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishOperation::Create => "create",
            PublishOperation::Update => "update",
        }
    }
}

impl fmt::Display for PublishOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one cycle observed and did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub reservation_changed: bool,
    pub topology_changed: bool,
    pub published: Option<PublishOperation>,
}

/// Owns all exporter state; one instance per process
pub struct Reconciler {
    config: ReconcilerConfig,
    node_name: String,
    capacity: ResourceList,
    reservation: ReservationState,
    topology: TopologyRegistry,
    store: Arc<dyn RecordStore>,
    health: HealthRegistry,
    metrics: ExporterMetrics,
    logger: StructuredLogger,
    /// A change was adopted but not yet written
    pending_publish: bool,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        node_name: String,
        capacity: ResourceList,
        store: Arc<dyn RecordStore>,
        health: HealthRegistry,
        metrics: ExporterMetrics,
    ) -> Self {
        let logger = StructuredLogger::new(&node_name);

        Self {
            config,
            node_name,
            capacity,
            reservation: ReservationState::new(),
            topology: TopologyRegistry::new(),
            store,
            health,
            metrics,
            logger,
            pending_publish: false,
        }
    }

    pub fn reservation(&self) -> &ReservationState {
        &self.reservation
    }

    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    pub fn pending_publish(&self) -> bool {
        self.pending_publish
    }

    /// Run cycles until shutdown; cycles never overlap
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            node = %self.node_name,
            check_period_ms = self.config.check_period.as_millis() as u64,
            "Starting reconcile loop"
        );

        let mut ticker = interval(self.config.check_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.run_cycle().await;
                    debug!(
                        reservation_changed = outcome.reservation_changed,
                        topology_changed = outcome.topology_changed,
                        published = ?outcome.published,
                        "Cycle complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reconcile loop");
                    break;
                }
            }
        }
    }

    /// Refresh reservation and topology, then publish if needed
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let start = Instant::now();

        let reservation_changed = self.refresh_reservation().await;
        let topology_changed = self.refresh_topology().await;

        if reservation_changed {
            self.metrics.inc_reservation_changes();
        }
        if topology_changed {
            self.metrics.inc_topology_changes();
        }

        let published = self
            .publish_if_needed(reservation_changed || topology_changed)
            .await;

        self.metrics
            .observe_cycle_duration(start.elapsed().as_secs_f64());

        CycleOutcome {
            reservation_changed,
            topology_changed,
            published,
        }
    }

    async fn refresh_reservation(&mut self) -> bool {
        let kubelet = match KubeletConfiguration::load(&self.config.kubelet_conf).await {
            Ok(kubelet) => kubelet,
            Err(e) => {
                warn!(error = %e, "Failed to get kubelet configuration");
                self.metrics.inc_kubelet_config_errors();
                self.health
                    .set_degraded(components::RESERVATION, e.to_string())
                    .await;
                return false;
            }
        };

        self.health.set_healthy(components::RESERVATION).await;
        self.reservation
            .update(&kubelet, &self.config.res_reserved, &self.capacity)
    }

    async fn refresh_topology(&mut self) -> bool {
        let changed = self.topology.update(&self.config.topology).await;

        let summary = self.topology.allocatable_summary();
        let cpu = summary.get(RESOURCE_CPU).cloned().unwrap_or_default();
        let free = parse_cpu_list(&cpu.allocatable).map(|c| c.len()).unwrap_or(0);
        self.metrics.set_cpus(free as i64, cpu.capacity as i64);

        if cpu.capacity == 0 {
            self.health
                .set_degraded(components::TOPOLOGY, "no CPUs discovered on online NUMA nodes")
                .await;
        } else if self.topology.cpu_detail().is_none() {
            self.health
                .set_degraded(components::TOPOLOGY, "CPU placement detail unavailable")
                .await;
        } else {
            self.health.set_healthy(components::TOPOLOGY).await;
        }

        changed
    }

    fn current_spec(&self) -> NumatopoSpec {
        NumatopoSpec {
            policies: self.reservation.policies().clone(),
            res_reserved: self.reservation.reserved().clone(),
            numa_res_map: self.topology.allocatable_summary(),
            cpu_detail: self.topology.cpu_detail().unwrap_or_default(),
        }
    }

    async fn publish_if_needed(&mut self, changed: bool) -> Option<PublishOperation> {
        let existing = match self.store.get(&self.node_name).await {
            Ok(existing) => existing,
            Err(e) => {
                self.pending_publish |= changed;
                self.publish_failed(&e).await;
                return None;
            }
        };

        if !changed && !self.pending_publish && existing.is_some() {
            return None;
        }

        let spec = self.current_spec();
        let result = match existing {
            None => {
                let record = Numatopology::new(&self.node_name, spec);
                self.store
                    .create(&record)
                    .await
                    .map(|_| PublishOperation::Create)
            }
            Some(mut record) => {
                record.spec = spec;
                self.store
                    .update(&record)
                    .await
                    .map(|_| PublishOperation::Update)
            }
        };

        match result {
            Ok(operation) => {
                self.pending_publish = false;
                self.published(operation).await;
                Some(operation)
            }
            Err(e) => {
                self.pending_publish = true;
                self.publish_failed(&e).await;
                None
            }
        }
    }

    async fn published(&self, operation: PublishOperation) {
        let allocatable = self
            .topology
            .allocatable_summary()
            .remove(RESOURCE_CPU)
            .map(|info| info.allocatable)
            .unwrap_or_default();

        self.logger.log_published(
            operation.as_str(),
            &allocatable,
            self.reservation.reserved().get(RESOURCE_CPU).map(String::as_str),
            self.topology.cpu_detail().map(|d| d.len()).unwrap_or(0),
        );
        self.metrics.inc_publishes(operation.as_str());
        self.health.set_healthy(components::PUBLISHER).await;
        self.health.set_ready(true).await;
    }

    async fn publish_failed(&self, error: &RecordStoreError) {
        self.logger.log_publish_failed(&error.to_string());
        self.metrics.inc_publish_errors();
        self.health
            .set_degraded(components::PUBLISHER, error.to_string())
            .await;
    }
}

/// Builder for the reconciler
pub struct ReconcilerBuilder {
    config: ReconcilerConfig,
    node_name: Option<String>,
    capacity: ResourceList,
    store: Option<Arc<dyn RecordStore>>,
    health: Option<HealthRegistry>,
    metrics: Option<ExporterMetrics>,
}

impl ReconcilerBuilder {
    pub fn new() -> Self {
        Self {
            config: ReconcilerConfig::default(),
            node_name: None,
            capacity: ResourceList::new(),
            store: None,
            health: None,
            metrics: None,
        }
    }

    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn check_period(mut self, period: Duration) -> Self {
        self.config.check_period = period;
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// Machine capacity used to resolve percentage eviction thresholds
    pub fn capacity(mut self, capacity: ResourceList) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: ExporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Reconciler> {
        let node_name = self
            .node_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Node name is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Record store is required"))?;
        if self.config.check_period.is_zero() {
            anyhow::bail!("Check period must be greater than zero");
        }

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => ExporterMetrics::new()?,
        };

        Ok(Reconciler::new(
            self.config,
            node_name,
            self.capacity,
            store,
            self.health.unwrap_or_default(),
            metrics,
        ))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
