//! Node resource reservation
//!
//! Tracks the kubelet manager policies and the CPU the node keeps back
//! from workloads. The reserved CPU is either the operator override or
//! the sum of kube-reserved, system-reserved and hard-eviction
//! reservations.

use crate::eviction::{hard_eviction_reservation, parse_thresholds, EvictionError};
use crate::kubelet::{KubeletConfiguration, DEFAULT_POLICY};
use crate::machine::RESOURCE_CPU;
use crate::quantity::{
    parse_resource_list, Quantity, QuantityFormat, QuantityParseError, ResourceList,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CPU_MANAGER_POLICY: &str = "CPUManagerPolicy";
pub const TOPOLOGY_MANAGER_POLICY: &str = "TopologyManagerPolicy";

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("failed to parse kubeReserved: {0}")]
    KubeReserved(#[source] QuantityParseError),

    #[error("failed to parse systemReserved: {0}")]
    SystemReserved(#[source] QuantityParseError),

    #[error("failed to parse evictionHard: {0}")]
    EvictionHard(#[source] EvictionError),

    #[error("reserved {0} overflows")]
    Overflow(String),
}

/// Policies and reservations as last published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationState {
    policies: BTreeMap<String, String>,
    reserved: BTreeMap<String, String>,
}

impl Default for ReservationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationState {
    /// Both policies start as `none` with nothing reserved
    pub fn new() -> Self {
        let policies = [CPU_MANAGER_POLICY, TOPOLOGY_MANAGER_POLICY]
            .into_iter()
            .map(|name| (name.to_string(), DEFAULT_POLICY.to_string()))
            .collect();

        Self {
            policies,
            reserved: BTreeMap::new(),
        }
    }

    pub fn policies(&self) -> &BTreeMap<String, String> {
        &self.policies
    }

    pub fn reserved(&self) -> &BTreeMap<String, String> {
        &self.reserved
    }

    /// Fold a kubelet configuration into the state
    ///
    /// `overrides` are the operator's `--res-reserved` values and `capacity`
    /// the machine capacity. Returns true when policies or the reserved CPU
    /// changed.
    pub fn update(
        &mut self,
        kubelet: &KubeletConfiguration,
        overrides: &BTreeMap<String, String>,
        capacity: &ResourceList,
    ) -> bool {
        let policies_changed = self.update_policies(kubelet);
        let cpu_changed = self.update_reserved_cpu(reserved_cpu(kubelet, overrides, capacity));

        policies_changed || cpu_changed
    }

    fn update_policies(&mut self, kubelet: &KubeletConfiguration) -> bool {
        let mut changed = false;

        for (name, value) in [
            (CPU_MANAGER_POLICY, kubelet.cpu_manager_policy()),
            (TOPOLOGY_MANAGER_POLICY, kubelet.topology_manager_policy()),
        ] {
            if self.policies.get(name).map(String::as_str) != Some(value) {
                info!(policy = name, value, "Kubelet policy changed");
                self.policies.insert(name.to_string(), value.to_string());
                changed = true;
            }
        }

        changed
    }

    fn update_reserved_cpu(&mut self, cpu: Option<String>) -> bool {
        if self.reserved.get(RESOURCE_CPU) == cpu.as_ref() {
            return false;
        }

        info!(
            previous = ?self.reserved.get(RESOURCE_CPU),
            current = ?cpu,
            "Reserved CPU changed"
        );
        match cpu {
            Some(cpu) => self.reserved.insert(RESOURCE_CPU.to_string(), cpu),
            None => self.reserved.remove(RESOURCE_CPU),
        };
        true
    }
}

/// Reserved CPU text; the operator override is taken verbatim
fn reserved_cpu(
    kubelet: &KubeletConfiguration,
    overrides: &BTreeMap<String, String>,
    capacity: &ResourceList,
) -> Option<String> {
    if let Some(cpu) = overrides.get(RESOURCE_CPU) {
        return Some(cpu.clone());
    }

    match calculate_node_reservation(
        &kubelet.kube_reserved,
        &kubelet.system_reserved,
        &kubelet.eviction_hard,
        capacity,
    ) {
        Ok(reservation) => {
            debug!(reservation = ?reservation, "Calculated node reservation");
            reservation.get(RESOURCE_CPU).map(Quantity::to_string)
        }
        Err(e) => {
            warn!(error = %e, "Failed to calculate CPU reservation, assuming none");
            None
        }
    }
}

/// Total reservation per capacity resource
///
/// Resources not present in `capacity` are ignored and zero totals are
/// omitted.
pub fn calculate_node_reservation(
    kube_reserved: &BTreeMap<String, String>,
    system_reserved: &BTreeMap<String, String>,
    eviction_hard: &BTreeMap<String, String>,
    capacity: &ResourceList,
) -> Result<ResourceList, ReservationError> {
    let kube = parse_resource_list(kube_reserved).map_err(ReservationError::KubeReserved)?;
    let system = parse_resource_list(system_reserved).map_err(ReservationError::SystemReserved)?;
    let thresholds = parse_thresholds(eviction_hard).map_err(ReservationError::EvictionHard)?;
    let eviction = hard_eviction_reservation(&thresholds, capacity);

    let mut result = ResourceList::new();
    for resource in capacity.keys() {
        let mut total = Quantity::zero(QuantityFormat::DecimalSI);
        for reserved in [&kube, &system, &eviction] {
            if let Some(&quantity) = reserved.get(resource) {
                total = total
                    .checked_add(quantity)
                    .ok_or_else(|| ReservationError::Overflow(resource.clone()))?;
            }
        }

        if !total.is_zero() {
            result.insert(resource.clone(), total);
        }
    }

    Ok(result)
}
