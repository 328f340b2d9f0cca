//! Machine capacity discovery
//!
//! Reads logical CPU count, total memory and hugepage pools once at
//! startup. Failure here is fatal: without capacity the reservation
//! calculation cannot resolve percentage thresholds.

use crate::quantity::{Quantity, QuantityFormat, ResourceList};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
const HUGEPAGES_PREFIX: &str = "hugepages-";

/// Startup failure while discovering machine capacity
#[derive(Debug, Error)]
pub enum MachineInfoError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no processors listed in {0}")]
    NoProcessors(PathBuf),

    #[error("MemTotal missing or malformed in {0}")]
    NoMemTotal(PathBuf),
}

/// Filesystem roots used for machine discovery
#[derive(Debug, Clone)]
pub struct MachinePaths {
    pub proc_root: PathBuf,
    pub sys_root: PathBuf,
}

impl Default for MachinePaths {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
        }
    }
}

impl MachinePaths {
    /// Prefer the host's procfs when it is mounted under `/rootfs`
    pub fn detect() -> Self {
        let host_proc = Path::new("/rootfs/proc");
        if host_proc.exists() {
            info!(path = %host_proc.display(), "Using host procfs");
            Self {
                proc_root: host_proc.to_path_buf(),
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }
}

/// A hugepage pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HugePagesInfo {
    pub page_size_kib: u64,
    pub num_pages: u64,
}

/// Static machine description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub num_cores: u32,
    pub memory_capacity: u64,
    pub hugepages: Vec<HugePagesInfo>,
}

impl MachineInfo {
    /// Discover the machine description
    pub async fn load(paths: &MachinePaths) -> Result<Self, MachineInfoError> {
        let cpuinfo_path = paths.proc_root.join("cpuinfo");
        let cpuinfo = read(&cpuinfo_path).await?;
        let num_cores = Self::parse_num_cores(&cpuinfo);
        if num_cores == 0 {
            return Err(MachineInfoError::NoProcessors(cpuinfo_path));
        }

        let meminfo_path = paths.proc_root.join("meminfo");
        let meminfo = read(&meminfo_path).await?;
        let memory_capacity =
            Self::parse_mem_total(&meminfo).ok_or(MachineInfoError::NoMemTotal(meminfo_path))?;

        let hugepages = Self::read_hugepages(&paths.sys_root.join("kernel/mm/hugepages")).await;

        let info = Self {
            num_cores,
            memory_capacity,
            hugepages,
        };
        info!(
            num_cores = info.num_cores,
            memory_capacity = info.memory_capacity,
            hugepage_pools = info.hugepages.len(),
            "Loaded machine info"
        );
        Ok(info)
    }

    /// Count `processor` entries in /proc/cpuinfo
    pub fn parse_num_cores(content: &str) -> u32 {
        content
            .lines()
            .filter(|line| {
                line.split(':')
                    .next()
                    .map(|key| key.trim() == "processor")
                    .unwrap_or(false)
            })
            .count() as u32
    }

    /// MemTotal from /proc/meminfo, in bytes
    pub fn parse_mem_total(content: &str) -> Option<u64> {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix("MemTotal:")?;
            let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kib * 1024)
        })
    }

    /// Hugepage pools are optional; unreadable entries are skipped
    async fn read_hugepages(dir: &Path) -> Vec<HugePagesInfo> {
        let mut pools = Vec::new();

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "No hugepage information");
                return pools;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(page_size_kib) = name
                .strip_prefix(HUGEPAGES_PREFIX)
                .and_then(|s| s.strip_suffix("kB"))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };

            let num_pages = match fs::read_to_string(entry.path().join("nr_hugepages")).await {
                Ok(content) => content.trim().parse().unwrap_or(0),
                Err(_) => continue,
            };

            pools.push(HugePagesInfo {
                page_size_kib,
                num_pages,
            });
        }

        pools.sort_by_key(|pool| pool.page_size_kib);
        pools
    }

    /// Capacity as the kubelet reports it
    pub fn capacity(&self) -> ResourceList {
        let mut capacity = ResourceList::new();

        capacity.insert(
            RESOURCE_CPU.to_string(),
            Quantity::from_milli(self.num_cores as i64 * 1000, QuantityFormat::DecimalSI),
        );
        capacity.insert(
            RESOURCE_MEMORY.to_string(),
            Quantity::new(self.memory_capacity as i64, QuantityFormat::BinarySI),
        );

        for pool in &self.hugepages {
            let page_size =
                Quantity::new(pool.page_size_kib as i64 * 1024, QuantityFormat::BinarySI);
            let total = pool.page_size_kib * 1024 * pool.num_pages;
            capacity.insert(
                format!("{}{}", HUGEPAGES_PREFIX, page_size),
                Quantity::new(total as i64, QuantityFormat::BinarySI),
            );
        }

        capacity
    }
}

async fn read(path: &Path) -> Result<String, MachineInfoError> {
    fs::read_to_string(path)
        .await
        .map_err(|source| MachineInfoError::Read {
            path: path.to_path_buf(),
            source,
        })
}
