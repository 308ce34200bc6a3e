//! Discrete axis value validators
//!
//! Indexing axes on real machines only reach a fixed set of positions,
//! either an explicit list or a regular stepping grid. A validator only
//! answers whether a value is reachable; it never snaps.

use serde::{Deserialize, Serialize};

/// Tolerance for matching a requested value against a discrete position.
const DISCRETE_TOLERANCE: f64 = 1e-9;

/// Acceptable positions for a discrete axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscreteValidator {
    /// An explicit list of reachable positions
    List(Vec<f64>),
    /// Positions on a regular grid `start + n * step` for integer `n`
    Stepping { start: f64, step: f64 },
}

impl DiscreteValidator {
    /// Whether `value` matches a reachable position within tolerance.
    pub fn accepts(&self, value: f64) -> bool {
        match self {
            Self::List(values) => values
                .iter()
                .any(|v| (v - value).abs() <= DISCRETE_TOLERANCE),
            Self::Stepping { start, step } => {
                if step.abs() <= DISCRETE_TOLERANCE {
                    return (value - start).abs() <= DISCRETE_TOLERANCE;
                }
                let steps = (value - start) / step;
                (steps - steps.round()).abs() * step.abs() <= DISCRETE_TOLERANCE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_accepts_listed_values_only() {
        let v = DiscreteValidator::List(vec![0.0, 45.0, 90.0]);
        assert!(v.accepts(45.0));
        assert!(v.accepts(90.0 + 1e-12));
        assert!(!v.accepts(30.0));
    }

    #[test]
    fn test_stepping_accepts_grid_values() {
        let v = DiscreteValidator::Stepping {
            start: -180.0,
            step: 15.0,
        };
        assert!(v.accepts(-180.0));
        assert!(v.accepts(0.0));
        assert!(v.accepts(75.0));
        assert!(!v.accepts(7.5));
    }

    #[test]
    fn test_zero_step_matches_start_only() {
        let v = DiscreteValidator::Stepping {
            start: 10.0,
            step: 0.0,
        };
        assert!(v.accepts(10.0));
        assert!(!v.accepts(10.1));
    }
}
