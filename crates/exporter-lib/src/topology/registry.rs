use super::{CpuInfo, CpuTopologyProvider, ResourceInfo, TopologyConfig, TopologyProvider};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Topology providers keyed by resource kind
#[derive(Debug)]
pub struct TopologyRegistry {
    providers: BTreeMap<String, Box<dyn TopologyProvider>>,
}

impl Default for TopologyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyRegistry {
    /// Registry with the CPU provider installed
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(CpuTopologyProvider::new()));
        registry
    }

    pub fn empty() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// Install a provider, replacing any provider of the same kind
    pub fn register(&mut self, provider: Box<dyn TopologyProvider>) {
        let name = provider.name().to_string();
        debug!(kind = %name, "Registered topology provider");
        self.providers.insert(name, provider);
    }

    pub fn get(&self, kind: &str) -> Option<&dyn TopologyProvider> {
        self.providers.get(kind).map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Re-derive every provider, adopting changed ones as the new baseline
    ///
    /// Returns true when at least one provider changed.
    pub async fn update(&mut self, config: &TopologyConfig) -> bool {
        let mut changed = false;

        for (kind, provider) in self.providers.iter_mut() {
            if let Some(updated) = provider.update(config).await {
                info!(kind = %kind, "Topology changed");
                *provider = updated;
                changed = true;
            }
        }

        changed
    }

    /// Allocatable/capacity summary per resource kind
    pub fn allocatable_summary(&self) -> BTreeMap<String, ResourceInfo> {
        self.providers
            .iter()
            .map(|(kind, provider)| (kind.clone(), provider.allocatable_summary()))
            .collect()
    }

    /// Per-CPU detail from the first provider that has it
    pub fn cpu_detail(&self) -> Option<BTreeMap<String, CpuInfo>> {
        self.providers.values().find_map(|provider| provider.detail())
    }
}
