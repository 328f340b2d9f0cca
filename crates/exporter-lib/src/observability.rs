//! Observability infrastructure for the exporter
//!
//! Provides:
//! - Prometheus metrics (cycle latency, change and publish counters, CPU gauges)
//! - Structured JSON event logging with tracing

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Histogram buckets for cycle latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const NAMESPACE: &str = "numatopo_exporter";

struct ExporterMetricsInner {
    registry: Registry,
    cycle_duration_seconds: Histogram,
    topology_changes: IntCounter,
    reservation_changes: IntCounter,
    publishes: IntCounterVec,
    publish_errors: IntCounter,
    kubelet_config_errors: IntCounter,
    allocatable_cpus: IntGauge,
    capacity_cpus: IntGauge,
}

impl ExporterMetricsInner {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Time spent in one refresh and publish cycle",
            )
            .namespace(NAMESPACE)
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let topology_changes = IntCounter::with_opts(
            Opts::new("topology_changes_total", "Cycles in which the NUMA topology changed")
                .namespace(NAMESPACE),
        )?;
        let reservation_changes = IntCounter::with_opts(
            Opts::new(
                "reservation_changes_total",
                "Cycles in which kubelet policies or reserved CPU changed",
            )
            .namespace(NAMESPACE),
        )?;
        let publishes = IntCounterVec::new(
            Opts::new("publishes_total", "Numatopology records written").namespace(NAMESPACE),
            &["operation"],
        )?;
        let publish_errors = IntCounter::with_opts(
            Opts::new("publish_errors_total", "Failed reads or writes of the node record")
                .namespace(NAMESPACE),
        )?;
        let kubelet_config_errors = IntCounter::with_opts(
            Opts::new(
                "kubelet_config_errors_total",
                "Failures reading or parsing the kubelet configuration",
            )
            .namespace(NAMESPACE),
        )?;
        let allocatable_cpus = IntGauge::with_opts(
            Opts::new("allocatable_cpus", "CPUs in the shared pool").namespace(NAMESPACE),
        )?;
        let capacity_cpus = IntGauge::with_opts(
            Opts::new("capacity_cpus", "CPUs attached to online NUMA nodes").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(cycle_duration_seconds.clone()))?;
        registry.register(Box::new(topology_changes.clone()))?;
        registry.register(Box::new(reservation_changes.clone()))?;
        registry.register(Box::new(publishes.clone()))?;
        registry.register(Box::new(publish_errors.clone()))?;
        registry.register(Box::new(kubelet_config_errors.clone()))?;
        registry.register(Box::new(allocatable_cpus.clone()))?;
        registry.register(Box::new(capacity_cpus.clone()))?;

        Ok(Self {
            registry,
            cycle_duration_seconds,
            topology_changes,
            reservation_changes,
            publishes,
            publish_errors,
            kubelet_config_errors,
            allocatable_cpus,
            capacity_cpus,
        })
    }
}

/// Exporter metrics for Prometheus exposition
///
/// Clones share the same underlying registry.
#[derive(Clone)]
pub struct ExporterMetrics {
    inner: Arc<ExporterMetricsInner>,
}

impl std::fmt::Debug for ExporterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterMetrics").finish_non_exhaustive()
    }
}

impl ExporterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            inner: Arc::new(ExporterMetricsInner::new()?),
        })
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.inner.cycle_duration_seconds.observe(duration_secs);
    }

    pub fn inc_topology_changes(&self) {
        self.inner.topology_changes.inc();
    }

    pub fn inc_reservation_changes(&self) {
        self.inner.reservation_changes.inc();
    }

    /// Count a successful write; `operation` is `create` or `update`
    pub fn inc_publishes(&self, operation: &str) {
        self.inner.publishes.with_label_values(&[operation]).inc();
    }

    pub fn publishes(&self, operation: &str) -> u64 {
        self.inner.publishes.with_label_values(&[operation]).get()
    }

    pub fn inc_publish_errors(&self) {
        self.inner.publish_errors.inc();
    }

    pub fn publish_errors(&self) -> u64 {
        self.inner.publish_errors.get()
    }

    pub fn inc_kubelet_config_errors(&self) {
        self.inner.kubelet_config_errors.inc();
    }

    pub fn kubelet_config_errors(&self) -> u64 {
        self.inner.kubelet_config_errors.get()
    }

    pub fn set_cpus(&self, allocatable: i64, capacity: i64) {
        self.inner.allocatable_cpus.set(allocatable);
        self.inner.capacity_cpus.set(capacity);
    }

    /// Text exposition of every exporter metric
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Structured logger for exporter events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, check_period: std::time::Duration) {
        info!(
            event = "exporter_started",
            node = %self.node_name,
            exporter_version = %version,
            check_period_ms = check_period.as_millis() as u64,
            "Resource exporter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Resource exporter shutting down"
        );
    }

    /// A node record was written; `operation` is `create` or `update`
    pub fn log_published(
        &self,
        operation: &str,
        allocatable_cpus: &str,
        reserved_cpu: Option<&str>,
        cpu_detail_entries: usize,
    ) {
        info!(
            event = "numatopo_published",
            node = %self.node_name,
            operation = %operation,
            allocatable_cpus = %allocatable_cpus,
            reserved_cpu = ?reserved_cpu,
            cpu_detail_entries = cpu_detail_entries,
            "Published node topology"
        );
    }

    pub fn log_publish_failed(&self, error: &str) {
        warn!(
            event = "numatopo_publish_failed",
            node = %self.node_name,
            error = %error,
            "Failed to publish node topology, retrying next cycle"
        );
    }
}
