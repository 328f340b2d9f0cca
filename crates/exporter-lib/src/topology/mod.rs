//! NUMA topology discovery
//!
//! Each resource kind has a [`TopologyProvider`] that rebuilds its view of
//! the node from sysfs and kubelet checkpoint files on every cycle and
//! reports whether anything changed. The [`TopologyRegistry`] drives all
//! providers and aggregates their views for publication.

mod checkpoint;
mod cpu;
mod registry;


pub use checkpoint::{CheckpointError, CpuManagerCheckpoint};
pub use cpu::{CpuTopologyProvider, CpuTopologySnapshot, TopologyReadError};
pub use registry::TopologyRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Locations of the raw topology sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    /// sysfs system devices directory (contains `node/` and `cpu/`)
    pub device_path: PathBuf,
    /// kubelet CPU manager checkpoint file
    pub cpu_manager_state: PathBuf,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/sys/devices/system"),
            cpu_manager_state: PathBuf::from("/var/lib/kubelet/cpu_manager_state"),
        }
    }
}

/// Placement of one logical CPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    #[serde(rename = "numa", default)]
    pub numa_node_id: u32,
    #[serde(rename = "socket", default)]
    pub socket_id: u32,
    #[serde(rename = "core", default)]
    pub core_id: u32,
}

/// Allocatable ids and total capacity of one resource kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Free ids in canonical range text
    #[serde(default)]
    pub allocatable: String,
    #[serde(default)]
    pub capacity: u32,
}

/// Source of topology for a single resource kind
#[async_trait]
pub trait TopologyProvider: Send + Sync + fmt::Debug {
    /// Resource kind, e.g. `cpu`
    fn name(&self) -> &str;

    /// Re-derive the topology; `Some` carries a replacement when it changed
    async fn update(&self, config: &TopologyConfig) -> Option<Box<dyn TopologyProvider>>;

    /// Allocatable/capacity summary across all NUMA nodes
    fn allocatable_summary(&self) -> ResourceInfo;

    /// Per-CPU placement keyed by CPU id text, if this kind provides it
    fn detail(&self) -> Option<BTreeMap<String, CpuInfo>>;
}
