//! CPU topology provider
//!
//! Reads, relative to the device path:
//! - `node/online` for the NUMA nodes
//! - `node/node<N>/cpulist` for each node's CPUs
//! - `cpu/cpu<N>/topology/{core_id,physical_package_id}` for placement
//!
//! and the CPU manager checkpoint for the free (shared pool) CPUs.

use super::{
    async_trait, CpuInfo, CpuManagerCheckpoint, ResourceInfo, TopologyConfig, TopologyProvider,
};
use crate::cpuset::{format_cpu_list, parse_cpu_list, CpuSetParseError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, warn};

pub const CPU_RESOURCE_KIND: &str = "cpu";

#[derive(Debug, Error)]
pub enum TopologyReadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: CpuSetParseError,
    },

    #[error("{0} is empty")]
    Empty(PathBuf),
}

/// One cycle's view of the CPU topology
///
/// Maps compare without regard to insertion order; the sequences keep the
/// order in which the source files list their ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTopologySnapshot {
    /// Online NUMA node ids
    pub numa_nodes: Vec<u32>,
    /// NUMA id -> number of CPUs
    pub numa_capacity: BTreeMap<u32, u32>,
    /// NUMA id -> free CPU ids
    pub numa_free_cpus: BTreeMap<u32, Vec<u32>>,
    /// CPU id -> NUMA id
    pub cpu_to_numa: BTreeMap<u32, u32>,
    /// CPU id -> placement; `None` when any CPU's placement was unreadable
    pub cpu_detail: Option<BTreeMap<u32, CpuInfo>>,
}

impl CpuTopologySnapshot {
    /// Build a snapshot from the raw sources
    ///
    /// Unreadable sources contribute nothing; the snapshot is never an error.
    pub async fn read(config: &TopologyConfig) -> Self {
        let node_path = config.device_path.join("node");
        let mut snapshot = Self {
            numa_nodes: read_numa_online(&node_path.join("online")).await,
            ..Self::default()
        };

        snapshot.update_numa_capacity(&node_path).await;

        let free_cpus = read_free_cpus(&config.cpu_manager_state).await;
        snapshot.assign_free_cpus(&free_cpus);

        snapshot.cpu_detail = snapshot.read_cpu_detail(&config.device_path).await;
        snapshot
    }

    /// Owning NUMA node of a CPU
    ///
    /// CPUs missing from the node cpulists are reported on node 0. The
    /// checkpoint can list such CPUs when a cpulist was unreadable; they are
    /// attributed to node 0 rather than dropped.
    pub fn numa_of(&self, cpu: u32) -> u32 {
        self.cpu_to_numa.get(&cpu).copied().unwrap_or(0)
    }

    async fn update_numa_capacity(&mut self, node_path: &Path) {
        for &node in &self.numa_nodes {
            let cpulist = node_path.join(format!("node{}", node)).join("cpulist");
            let cpus = match read_cpu_list(&cpulist).await {
                Ok(cpus) => cpus,
                Err(e) => {
                    error!(numa_node = node, error = %e, "Failed to read NUMA node cpulist");
                    Vec::new()
                }
            };

            self.numa_capacity.insert(node, cpus.len() as u32);
            for cpu in cpus {
                self.cpu_to_numa.insert(cpu, node);
            }
        }
    }

    fn assign_free_cpus(&mut self, free_cpus: &[u32]) {
        for &cpu in free_cpus {
            let node = self.numa_of(cpu);
            self.numa_free_cpus.entry(node).or_default().push(cpu);
        }
    }

    /// All-or-nothing: one unreadable CPU discards the whole map
    async fn read_cpu_detail(&self, device_path: &Path) -> Option<BTreeMap<u32, CpuInfo>> {
        let mut detail = BTreeMap::new();

        for (&cpu, &numa_node_id) in &self.cpu_to_numa {
            let topology = device_path
                .join("cpu")
                .join(format!("cpu{}", cpu))
                .join("topology");

            let placement = async {
                let core_id = read_single_id(&topology.join("core_id")).await?;
                let socket_id = read_single_id(&topology.join("physical_package_id")).await?;
                Ok::<_, TopologyReadError>((core_id, socket_id))
            };

            match placement.await {
                Ok((core_id, socket_id)) => {
                    detail.insert(
                        cpu,
                        CpuInfo {
                            numa_node_id,
                            socket_id,
                            core_id,
                        },
                    );
                }
                Err(e) => {
                    error!(cpu, error = %e, "Failed to read CPU topology, dropping CPU detail");
                    return None;
                }
            }
        }

        Some(detail)
    }

    /// Union of all free CPUs in canonical form plus total capacity
    pub fn allocatable(&self) -> ResourceInfo {
        let free: BTreeSet<u32> = self.numa_free_cpus.values().flatten().copied().collect();

        ResourceInfo {
            allocatable: format_cpu_list(&free),
            capacity: self.numa_capacity.values().sum(),
        }
    }
}

async fn read_cpu_list(path: &Path) -> Result<Vec<u32>, TopologyReadError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| TopologyReadError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    parse_cpu_list(&content).map_err(|source| TopologyReadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

async fn read_single_id(path: &Path) -> Result<u32, TopologyReadError> {
    read_cpu_list(path)
        .await?
        .first()
        .copied()
        .ok_or_else(|| TopologyReadError::Empty(path.to_path_buf()))
}

async fn read_numa_online(path: &Path) -> Vec<u32> {
    match read_cpu_list(path).await {
        Ok(nodes) => nodes,
        Err(e) => {
            error!(error = %e, "Failed to read online NUMA nodes");
            Vec::new()
        }
    }
}

async fn read_free_cpus(path: &Path) -> Vec<u32> {
    let checkpoint = match CpuManagerCheckpoint::load(path).await {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!(error = %e, "Failed to load CPU manager checkpoint");
            return Vec::new();
        }
    };

    match parse_cpu_list(&checkpoint.default_cpu_set) {
        Ok(cpus) => cpus,
        Err(e) => {
            warn!(
                default_cpu_set = %checkpoint.default_cpu_set,
                error = %e,
                "Failed to parse CPU manager default cpuset"
            );
            Vec::new()
        }
    }
}

/// CPU topology provider holding the last adopted snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTopologyProvider {
    snapshot: CpuTopologySnapshot,
}

impl CpuTopologyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: CpuTopologySnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &CpuTopologySnapshot {
        &self.snapshot
    }
}

#[async_trait]
impl TopologyProvider for CpuTopologyProvider {
    fn name(&self) -> &str {
        CPU_RESOURCE_KIND
    }

    async fn update(&self, config: &TopologyConfig) -> Option<Box<dyn TopologyProvider>> {
        let snapshot = CpuTopologySnapshot::read(config).await;
        if snapshot == self.snapshot {
            return None;
        }

        debug!(
            numa_nodes = ?snapshot.numa_nodes,
            capacity = ?snapshot.numa_capacity,
            free = ?snapshot.numa_free_cpus,
            "CPU topology changed"
        );
        Some(Box::new(Self::with_snapshot(snapshot)))
    }

    fn allocatable_summary(&self) -> ResourceInfo {
        self.snapshot.allocatable()
    }

    fn detail(&self) -> Option<BTreeMap<String, CpuInfo>> {
        self.snapshot.cpu_detail.as_ref().map(|detail| {
            detail
                .iter()
                .map(|(cpu, info)| (cpu.to_string(), *info))
                .collect()
        })
    }
}
