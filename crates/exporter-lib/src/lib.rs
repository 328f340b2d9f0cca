//! Exporter library for NUMA-aware scheduling
//!
//! This crate provides the core functionality for:
//! - CPU/NUMA topology discovery from sysfs and the kubelet CPU manager
//! - Kubelet reservation and eviction threshold accounting
//! - Publishing the node's `Numatopology` record
//! - Health checks and observability

pub mod cpuset;
pub mod eviction;
pub mod health;
pub mod kubelet;
pub mod machine;
pub mod observability;
pub mod quantity;
pub mod reconciler;
pub mod record;
pub mod reservation;
pub mod topology;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use observability::{ExporterMetrics, StructuredLogger};
pub use quantity::{Quantity, QuantityFormat, ResourceList};
pub use reconciler::{
    CycleOutcome, PublishOperation, Reconciler, ReconcilerBuilder, ReconcilerConfig,
};
pub use record::{KubeRecordStore, NumatopoSpec, Numatopology, RecordStore, RecordStoreError};
