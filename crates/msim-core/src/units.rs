//! Unit of measure for the machine model
//!
//! Every kinematic object carries the unit its lengths are expressed in.
//! Converting a machine to another unit system runs exactly one scale
//! pass over all length-valued state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Millimeters per inch.
pub const MM_PER_INCH: f64 = 25.4;

/// Unit of measure for length-valued state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    /// Metric system (mm)
    Metric,
    /// Inch system
    Inch,
}

impl Default for Units {
    fn default() -> Self {
        Self::Metric
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metric => write!(f, "metric"),
            Self::Inch => write!(f, "inch"),
        }
    }
}

impl FromStr for Units {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "metric" | "mm" => Ok(Self::Metric),
            "inch" | "in" | "imperial" => Ok(Self::Inch),
            _ => Err(format!("Unknown unit system: {}", s)),
        }
    }
}

impl Units {
    /// Factor that converts a length in `self` into a length in `target`.
    pub fn scale_factor_to(&self, target: Units) -> f64 {
        match (self, target) {
            (Units::Metric, Units::Inch) => 1.0 / MM_PER_INCH,
            (Units::Inch, Units::Metric) => MM_PER_INCH,
            _ => 1.0,
        }
    }
}
