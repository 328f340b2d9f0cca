//! Kubelet configuration file reader
//!
//! Only the fields relevant to NUMA-aware reservation are decoded; the
//! rest of the `KubeletConfiguration` document is ignored.

use serde::{de, Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Policy value the kubelet assumes when a manager policy is unset
pub const DEFAULT_POLICY: &str = "none";

#[derive(Debug, Error)]
pub enum KubeletConfigError {
    #[error("failed to read kubelet configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse kubelet configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Subset of `kubelet.config.k8s.io/v1beta1` KubeletConfiguration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    #[serde(default)]
    pub cpu_manager_policy: Option<String>,

    #[serde(default)]
    pub topology_manager_policy: Option<String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub kube_reserved: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub system_reserved: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub eviction_hard: BTreeMap<String, String>,
}

impl KubeletConfiguration {
    /// Parse a configuration document
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Read and parse the kubelet configuration file
    pub async fn load(path: &Path) -> Result<Self, KubeletConfigError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| KubeletConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        Self::from_yaml(&content).map_err(|source| KubeletConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// CPU manager policy, defaulting to `none`
    ///
    /// Unset publishes `none`; the upstream numatopo exporter sends `""` instead.
    pub fn cpu_manager_policy(&self) -> &str {
        non_empty_or_default(self.cpu_manager_policy.as_deref())
    }

    /// Topology manager policy, defaulting to `none`
    pub fn topology_manager_policy(&self) -> &str {
        non_empty_or_default(self.topology_manager_policy.as_deref())
    }
}

/// Accept `cpu: 1` as well as `cpu: "1"`; a null map is empty
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_yaml::Value>> = Option::deserialize(deserializer)?;

    raw.unwrap_or_default()
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(<D::Error as de::Error>::custom(format!(
                        "expected a scalar for {:?}, got {:?}",
                        key, other
                    )))
                }
            };
            Ok((key, value))
        })
        .collect()
}

fn non_empty_or_default(policy: Option<&str>) -> &str {
    match policy {
        Some(p) if !p.is_empty() => p,
        _ => DEFAULT_POLICY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
cgroupDriver: systemd
cpuManagerPolicy: static
topologyManagerPolicy: single-numa-node
kubeReserved:
  cpu: 200m
  memory: 300Mi
systemReserved:
  cpu: 300m
  memory: 1Gi
evictionHard:
  memory.available: 1Gi
  nodefs.available: "10%"
"#;

    #[test]
    fn test_parse_sample() {
        let config = KubeletConfiguration::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.cpu_manager_policy(), "static");
        assert_eq!(config.topology_manager_policy(), "single-numa-node");
        assert_eq!(config.kube_reserved["cpu"], "200m");
        assert_eq!(config.system_reserved["memory"], "1Gi");
        assert_eq!(config.eviction_hard["nodefs.available"], "10%");
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config = KubeletConfiguration::from_yaml("kind: KubeletConfiguration\n").unwrap();
        assert_eq!(config.cpu_manager_policy(), DEFAULT_POLICY);
        assert_eq!(config.topology_manager_policy(), DEFAULT_POLICY);
        assert!(config.kube_reserved.is_empty());
        assert!(config.eviction_hard.is_empty());
    }

    #[test]
    fn test_unquoted_numbers_and_null_maps() {
        let config = KubeletConfiguration::from_yaml(
            "kubeReserved:\n  cpu: 1\n  pid: 1000\nsystemReserved: null\n",
        )
        .unwrap();
        assert_eq!(config.kube_reserved["cpu"], "1");
        assert_eq!(config.kube_reserved["pid"], "1000");
        assert!(config.system_reserved.is_empty());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, SAMPLE).await.unwrap();

        let config = KubeletConfiguration::load(&path).await.unwrap();
        assert_eq!(config.cpu_manager_policy(), "static");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = KubeletConfiguration::load(&dir.path().join("absent.yaml")).await;
        assert!(matches!(result, Err(KubeletConfigError::Read { .. })));
    }

    #[tokio::test]
    async fn test_load_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "kubeReserved: [not, a, map]\n").await.unwrap();

        let result = KubeletConfiguration::load(&path).await;
        assert!(matches!(result, Err(KubeletConfigError::Parse { .. })));
    }
}
