//! Published node topology record
//!
//! The record is the cluster-scoped `Numatopology` custom resource
//! (`nodeinfo.volcano.sh/v1alpha1`), one per node and named after it.

use crate::topology::{CpuInfo, ResourceInfo};
use async_trait::async_trait;
use k8s_openapi::ClusterResourceScope;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use thiserror::Error;

pub const GROUP: &str = "nodeinfo.volcano.sh";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "Numatopology";
pub const PLURAL: &str = "numatopologies";

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("failed to get numatopology {name}: {source}")]
    Get {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to create numatopology {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to update numatopology {name}: {source}")]
    Update {
        name: String,
        #[source]
        source: kube::Error,
    },

    /// Failure from a store that is not backed by the Kubernetes API
    #[error("{0}")]
    Other(String),
}

/// Topology facts consumed by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumatopoSpec {
    /// Kubelet manager policies, e.g. `CPUManagerPolicy -> static`
    #[serde(default)]
    pub policies: BTreeMap<String, String>,

    /// Reserved quantity text per resource
    #[serde(rename = "resReserved", default)]
    pub res_reserved: BTreeMap<String, String>,

    /// Allocatable/capacity per resource kind
    #[serde(rename = "numares", default)]
    pub numa_res_map: BTreeMap<String, ResourceInfo>,

    /// Placement per CPU id
    #[serde(rename = "cpuDetail", default)]
    pub cpu_detail: BTreeMap<String, CpuInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Numatopology {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NumatopoSpec,
}

impl Numatopology {
    pub fn new(name: &str, spec: NumatopoSpec) -> Self {
        Self {
            api_version: format!("{}/{}", GROUP, VERSION),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

impl kube::Resource for Numatopology {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn group(_dt: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_dt: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn kind(_dt: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn plural(_dt: &()) -> Cow<'_, str> {
        PLURAL.into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Storage for published records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a record; `Ok(None)` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<Numatopology>, RecordStoreError>;

    async fn create(&self, record: &Numatopology) -> Result<Numatopology, RecordStoreError>;

    /// Replace an existing record; `record` carries the fetched metadata
    async fn update(&self, record: &Numatopology) -> Result<Numatopology, RecordStoreError>;
}

/// Record store over the Kubernetes API
#[derive(Clone)]
pub struct KubeRecordStore {
    api: Api<Numatopology>,
}

impl KubeRecordStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl RecordStore for KubeRecordStore {
    async fn get(&self, name: &str) -> Result<Option<Numatopology>, RecordStoreError> {
        match self.api.get(name).await {
            Ok(record) => Ok(Some(record)),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
            Err(source) => Err(RecordStoreError::Get {
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn create(&self, record: &Numatopology) -> Result<Numatopology, RecordStoreError> {
        self.api
            .create(&PostParams::default(), record)
            .await
            .map_err(|source| RecordStoreError::Create {
                name: record.name().to_string(),
                source,
            })
    }

    async fn update(&self, record: &Numatopology) -> Result<Numatopology, RecordStoreError> {
        self.api
            .replace(record.name(), &PostParams::default(), record)
            .await
            .map_err(|source| RecordStoreError::Update {
                name: record.name().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    fn sample_spec() -> NumatopoSpec {
        NumatopoSpec {
            policies: BTreeMap::from([
                ("CPUManagerPolicy".to_string(), "static".to_string()),
                ("TopologyManagerPolicy".to_string(), "none".to_string()),
            ]),
            res_reserved: BTreeMap::from([("cpu".to_string(), "500m".to_string())]),
            numa_res_map: BTreeMap::from([(
                "cpu".to_string(),
                ResourceInfo {
                    allocatable: "0-1,6-7".to_string(),
                    capacity: 8,
                },
            )]),
            cpu_detail: BTreeMap::from([(
                "3".to_string(),
                CpuInfo {
                    numa_node_id: 0,
                    socket_id: 0,
                    core_id: 1,
                },
            )]),
        }
    }

    #[test]
    fn test_resource_metadata() {
        assert_eq!(Numatopology::api_version(&()), "nodeinfo.volcano.sh/v1alpha1");
        assert_eq!(Numatopology::plural(&()), "numatopologies");

        let record = Numatopology::new("node-a", NumatopoSpec::default());
        assert_eq!(record.name(), "node-a");
        assert_eq!(record.api_version, "nodeinfo.volcano.sh/v1alpha1");
        assert_eq!(record.kind, "Numatopology");
    }

    #[test]
    fn test_wire_format() {
        let record = Numatopology::new("node-a", sample_spec());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["apiVersion"], "nodeinfo.volcano.sh/v1alpha1");
        assert_eq!(json["metadata"]["name"], "node-a");
        assert_eq!(json["spec"]["policies"]["CPUManagerPolicy"], "static");
        assert_eq!(json["spec"]["resReserved"]["cpu"], "500m");
        assert_eq!(json["spec"]["numares"]["cpu"]["allocatable"], "0-1,6-7");
        assert_eq!(json["spec"]["numares"]["cpu"]["capacity"], 8);
        assert_eq!(json["spec"]["cpuDetail"]["3"]["core"], 1);
        assert_eq!(json["spec"]["cpuDetail"]["3"]["socket"], 0);
        assert_eq!(json["spec"]["cpuDetail"]["3"]["numa"], 0);
    }

    #[test]
    fn test_decode_existing_record() {
        let json = r#"{
            "apiVersion": "nodeinfo.volcano.sh/v1alpha1",
            "kind": "Numatopology",
            "metadata": {"name": "node-a", "resourceVersion": "42"},
            "spec": {"policies": {"CPUManagerPolicy": "none"}}
        }"#;

        let record: Numatopology = serde_json::from_str(json).unwrap();
        assert_eq!(record.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(record.spec.policies["CPUManagerPolicy"], "none");
        assert!(record.spec.cpu_detail.is_empty());
    }
}
