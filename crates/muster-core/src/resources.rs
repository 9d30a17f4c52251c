use crate::error::{MusterError, MusterResult};
use serde::{Deserialize, Serialize};

/// Abstract capacity units. Not tied to any real OS resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// CPU units.
    #[serde(default)]
    pub cpu: f64,
    /// Memory units.
    #[serde(default)]
    pub memory: f64,
    /// Storage units.
    #[serde(default)]
    pub storage: f64,
}

impl ResourceAllocation {
    /// Build an allocation.
    pub fn new(cpu: f64, memory: f64, storage: f64) -> Self {
        Self {
            cpu,
            memory,
            storage,
        }
    }

    /// No resources.
    pub fn zero() -> Self {
        Self::default()
    }

    fn dims(&self) -> [f64; 3] {
        [self.cpu, self.memory, self.storage]
    }

    /// Rejects negative, NaN, or infinite components.
    pub fn validate(&self, what: &str) -> MusterResult<()> {
        for (name, value) in [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("storage", self.storage),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(MusterError::Validation(format!(
                    "{what}.{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// True if every component of `self` is at most the matching component of `capacity`.
    pub fn fits_within(&self, capacity: &ResourceAllocation) -> bool {
        self.cpu <= capacity.cpu && self.memory <= capacity.memory && self.storage <= capacity.storage
    }

    /// Dimension-wise sum.
    pub fn add(&self, other: &ResourceAllocation) -> ResourceAllocation {
        ResourceAllocation {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
            storage: self.storage + other.storage,
        }
    }

    /// Component-wise subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &ResourceAllocation) -> ResourceAllocation {
        ResourceAllocation {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: (self.memory - other.memory).max(0.0),
            storage: (self.storage - other.storage).max(0.0),
        }
    }

    /// Component-wise division, used to compute a per-member share of a floor.
    pub fn divided_by(&self, n: usize) -> ResourceAllocation {
        if n == 0 {
            return *self;
        }
        let n = n as f64;
        ResourceAllocation {
            cpu: self.cpu / n,
            memory: self.memory / n,
            storage: self.storage / n,
        }
    }

    /// Number of dimensions in which `self` (available) strictly exceeds `required`.
    pub fn surplus_score(&self, required: &ResourceAllocation) -> u8 {
        self.dims()
            .iter()
            .zip(required.dims())
            .filter(|(have, need)| **have > *need)
            .count() as u8
    }

    /// Number of dimensions in which `self` meets or exceeds `floor`.
    pub fn satisfied_dims(&self, floor: &ResourceAllocation) -> u8 {
        self.dims()
            .iter()
            .zip(floor.dims())
            .filter(|(have, need)| **have >= *need)
            .count() as u8
    }

    /// Spare capacity left after `required`, normalized per dimension by `total`.
    ///
    /// Dimensions with a zero total contribute nothing.
    pub fn surplus_ratio(&self, required: &ResourceAllocation, total: &ResourceAllocation) -> f64 {
        self.dims()
            .iter()
            .zip(required.dims())
            .zip(total.dims())
            .filter(|(_, t)| *t > 0.0)
            .map(|((have, need), t)| (have - need) / t)
            .sum()
    }
}

impl std::fmt::Display for ResourceAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={} memory={} storage={}",
            self.cpu, self.memory, self.storage
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_within_is_component_wise() {
        let capacity = ResourceAllocation::new(8.0, 16384.0, 1024.0);
        assert!(ResourceAllocation::new(1.0, 512.0, 64.0).fits_within(&capacity));
        assert!(capacity.fits_within(&capacity));
        assert!(!ResourceAllocation::new(9.0, 1.0, 1.0).fits_within(&capacity));
        assert!(!ResourceAllocation::new(1.0, 1.0, 2048.0).fits_within(&capacity));
    }

    #[test]
    fn test_saturating_sub_clamps() {
        let a = ResourceAllocation::new(1.0, 2.0, 3.0);
        let b = ResourceAllocation::new(2.0, 1.0, 3.0);
        assert_eq!(a.saturating_sub(&b), ResourceAllocation::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_surplus_score_counts_strict_excess() {
        let available = ResourceAllocation::new(4.0, 512.0, 64.0);
        let required = ResourceAllocation::new(1.0, 512.0, 64.0);
        assert_eq!(available.surplus_score(&required), 1);
        assert_eq!(available.satisfied_dims(&required), 3);
    }

    #[test]
    fn test_surplus_ratio_prefers_more_spare() {
        let total = ResourceAllocation::new(8.0, 1000.0, 100.0);
        let required = ResourceAllocation::new(1.0, 100.0, 10.0);
        let roomy = ResourceAllocation::new(8.0, 1000.0, 100.0);
        let tight = ResourceAllocation::new(2.0, 200.0, 20.0);
        assert_eq!(roomy.surplus_score(&required), tight.surplus_score(&required));
        assert!(roomy.surplus_ratio(&required, &total) > tight.surplus_ratio(&required, &total));
    }

    #[test]
    fn test_validate_rejects_negative_and_nan() {
        assert!(ResourceAllocation::new(-1.0, 0.0, 0.0).validate("total").is_err());
        assert!(ResourceAllocation::new(0.0, f64::NAN, 0.0).validate("total").is_err());
        assert!(ResourceAllocation::new(0.0, 0.0, f64::INFINITY).validate("total").is_err());
        assert!(ResourceAllocation::zero().validate("total").is_ok());
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        let r: ResourceAllocation = serde_json::from_str(r#"{"cpu": 2}"#).unwrap();
        assert_eq!(r, ResourceAllocation::new(2.0, 0.0, 0.0));
    }
}
