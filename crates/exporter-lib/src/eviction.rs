//! Hard eviction thresholds
//!
//! Parses kubelet `evictionHard` statements (`memory.available: 100Mi`,
//! `nodefs.available: 10%`) and turns them into the amount of each
//! resource the node keeps back from workloads.

use crate::machine::RESOURCE_MEMORY;
use crate::quantity::{Quantity, QuantityFormat, QuantityParseError, ResourceList};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const RESOURCE_EPHEMERAL_STORAGE: &str = "ephemeral-storage";

/// Errors produced while parsing eviction thresholds
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvictionError {
    #[error("unsupported eviction signal {0:?}")]
    UnsupportedSignal(String),

    #[error("invalid eviction percentage {value:?} for signal {signal}")]
    InvalidPercentage { signal: Signal, value: String },

    #[error("eviction threshold {signal} must be positive: {value}")]
    NotPositive { signal: Signal, value: String },

    #[error("invalid eviction threshold for signal {signal}: {source}")]
    InvalidQuantity {
        signal: Signal,
        #[source]
        source: QuantityParseError,
    },
}

/// Eviction signals understood by the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Signal {
    MemoryAvailable,
    AllocatableMemoryAvailable,
    NodeFsAvailable,
    NodeFsInodesFree,
    ImageFsAvailable,
    ImageFsInodesFree,
    ContainerFsAvailable,
    ContainerFsInodesFree,
    PidAvailable,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::MemoryAvailable => "memory.available",
            Signal::AllocatableMemoryAvailable => "allocatableMemory.available",
            Signal::NodeFsAvailable => "nodefs.available",
            Signal::NodeFsInodesFree => "nodefs.inodesFree",
            Signal::ImageFsAvailable => "imagefs.available",
            Signal::ImageFsInodesFree => "imagefs.inodesFree",
            Signal::ContainerFsAvailable => "containerfs.available",
            Signal::ContainerFsInodesFree => "containerfs.inodesFree",
            Signal::PidAvailable => "pid.available",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let signal = match name {
            "memory.available" => Signal::MemoryAvailable,
            "allocatableMemory.available" => Signal::AllocatableMemoryAvailable,
            "nodefs.available" => Signal::NodeFsAvailable,
            "nodefs.inodesFree" => Signal::NodeFsInodesFree,
            "imagefs.available" => Signal::ImageFsAvailable,
            "imagefs.inodesFree" => Signal::ImageFsInodesFree,
            "containerfs.available" => Signal::ContainerFsAvailable,
            "containerfs.inodesFree" => Signal::ContainerFsInodesFree,
            "pid.available" => Signal::PidAvailable,
            _ => return None,
        };
        Some(signal)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold value, absolute or relative to capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdValue {
    Quantity(Quantity),
    /// `numerator / denominator` of capacity, kept exact
    Percentage { numerator: i128, denominator: i128 },
}

impl ThresholdValue {
    /// Resolve the threshold against a capacity
    ///
    /// Percentages truncate to whole units and render in binary format.
    pub fn resolve(&self, capacity: Option<&Quantity>) -> Quantity {
        match *self {
            ThresholdValue::Quantity(quantity) => quantity,
            ThresholdValue::Percentage {
                numerator,
                denominator,
            } => {
                let capacity = capacity.map(Quantity::value).unwrap_or(0);
                let reserved = capacity * numerator / denominator;
                Quantity::new(reserved as i64, QuantityFormat::BinarySI)
            }
        }
    }
}

/// A hard eviction threshold: evict when `signal < value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Threshold {
    pub signal: Signal,
    pub value: ThresholdValue,
}

/// Parse the `evictionHard` map of a kubelet configuration
///
/// `0%` and `100%` disable a signal and are skipped.
pub fn parse_thresholds(
    eviction_hard: &BTreeMap<String, String>,
) -> Result<Vec<Threshold>, EvictionError> {
    let mut thresholds = Vec::new();

    for (name, raw) in eviction_hard {
        let signal =
            Signal::parse(name).ok_or_else(|| EvictionError::UnsupportedSignal(name.clone()))?;

        if let Some(value) = parse_threshold_value(signal, raw)? {
            thresholds.push(Threshold { signal, value });
        }
    }

    Ok(thresholds)
}

fn parse_threshold_value(
    signal: Signal,
    raw: &str,
) -> Result<Option<ThresholdValue>, EvictionError> {
    if let Some(percent) = raw.strip_suffix('%') {
        if raw == "0%" || raw == "100%" {
            return Ok(None);
        }
        let (numerator, denominator) =
            parse_percentage(percent).ok_or_else(|| EvictionError::InvalidPercentage {
                signal,
                value: raw.to_string(),
            })?;
        return Ok(Some(ThresholdValue::Percentage {
            numerator,
            denominator,
        }));
    }

    let quantity: Quantity = raw
        .parse()
        .map_err(|source| EvictionError::InvalidQuantity { signal, source })?;
    if quantity.is_zero() || quantity.is_negative() {
        return Err(EvictionError::NotPositive {
            signal,
            value: raw.to_string(),
        });
    }

    Ok(Some(ThresholdValue::Quantity(quantity)))
}

/// Parse `12.5` into `(125, 1000)`, i.e. a fraction of one; must lie in [0, 100]
fn parse_percentage(percent: &str) -> Option<(i128, i128)> {
    let (whole, fraction) = percent.split_once('.').unwrap_or((percent, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) || fraction.len() > 9 {
        return None;
    }

    let numerator: i128 = format!("{}{}", whole, fraction).parse().ok()?;
    let denominator = 100 * 10i128.pow(fraction.len() as u32);
    if numerator > denominator {
        return None;
    }

    Some((numerator, denominator))
}

/// Resources held back by hard eviction thresholds
///
/// Only `memory.available` and `nodefs.available` reserve anything; they map
/// to `memory` and `ephemeral-storage` respectively.
pub fn hard_eviction_reservation(
    thresholds: &[Threshold],
    capacity: &ResourceList,
) -> ResourceList {
    let mut reserved = ResourceList::new();

    for threshold in thresholds {
        let resource = match threshold.signal {
            Signal::MemoryAvailable => RESOURCE_MEMORY,
            Signal::NodeFsAvailable => RESOURCE_EPHEMERAL_STORAGE,
            _ => continue,
        };

        let value = threshold.value.resolve(capacity.get(resource));
        reserved.insert(resource.to_string(), value);
    }

    reserved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    fn eviction(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_quantity_threshold() {
        let thresholds = parse_thresholds(&eviction(&[("memory.available", "1Gi")])).unwrap();
        assert_eq!(thresholds.len(), 1);
        assert_eq!(thresholds[0].signal, Signal::MemoryAvailable);
        assert_eq!(thresholds[0].value, ThresholdValue::Quantity(q("1Gi")));
    }

    #[test]
    fn test_parse_percentage_threshold() {
        let thresholds = parse_thresholds(&eviction(&[("nodefs.available", "12.5%")])).unwrap();
        assert_eq!(
            thresholds[0].value,
            ThresholdValue::Percentage {
                numerator: 125,
                denominator: 1000
            }
        );
    }

    #[test]
    fn test_disabled_percentages_skipped() {
        let thresholds = parse_thresholds(&eviction(&[
            ("memory.available", "0%"),
            ("nodefs.available", "100%"),
        ]))
        .unwrap();
        assert!(thresholds.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_thresholds(&eviction(&[("cpu.available", "1")])),
            Err(EvictionError::UnsupportedSignal("cpu.available".to_string()))
        );
        assert!(matches!(
            parse_thresholds(&eviction(&[("memory.available", "150%")])),
            Err(EvictionError::InvalidPercentage { .. })
        ));
        assert!(matches!(
            parse_thresholds(&eviction(&[("memory.available", "-1Gi")])),
            Err(EvictionError::NotPositive { .. })
        ));
        assert!(matches!(
            parse_thresholds(&eviction(&[("memory.available", "0")])),
            Err(EvictionError::NotPositive { .. })
        ));
        assert!(matches!(
            parse_thresholds(&eviction(&[("memory.available", "lots")])),
            Err(EvictionError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn test_memory_percentage_resolves_exactly() {
        let capacity = ResourceList::from([("memory".to_string(), q("4Gi"))]);
        let thresholds = parse_thresholds(&eviction(&[("memory.available", "50%")])).unwrap();

        let reserved = hard_eviction_reservation(&thresholds, &capacity);
        assert_eq!(reserved["memory"], q("2Gi"));
        assert_eq!(reserved["memory"].to_string(), "2Gi");
    }

    #[test]
    fn test_nodefs_maps_to_ephemeral_storage() {
        let capacity = ResourceList::new();
        let thresholds = parse_thresholds(&eviction(&[
            ("nodefs.available", "10%"),
            ("imagefs.available", "15%"),
        ]))
        .unwrap();

        let reserved = hard_eviction_reservation(&thresholds, &capacity);
        assert_eq!(reserved.len(), 1);
        assert!(reserved["ephemeral-storage"].is_zero());
    }
}
