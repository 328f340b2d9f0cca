//! Kubelet CPU manager checkpoint
//!
//! The checkpoint (`/var/lib/kubelet/cpu_manager_state`) is JSON:
//!
//! ```json
//! {"policyName":"static","defaultCpuSet":"0-1,6-7","entries":{...},"checksum":1234}
//! ```
//!
//! `defaultCpuSet` lists the CPUs not exclusively assigned to any container.
//! The checksum is not verified.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuManagerCheckpoint {
    #[serde(default)]
    pub policy_name: String,
    #[serde(default)]
    pub default_cpu_set: String,
    #[serde(default)]
    pub checksum: u64,
}

impl CpuManagerCheckpoint {
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    pub async fn load(path: &Path) -> Result<Self, CheckpointError> {
        let data = fs::read(path).await.map_err(|source| CheckpointError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_slice(&data).map_err(|source| CheckpointError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }
}
