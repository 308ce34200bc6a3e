//! Lost-data diagnostics
//!
//! Loading an older file can require defaulting values the format did
//! not carry yet. Each such fixup is reported as a `LostData` record
//! returned alongside the loaded data. Notices are plain data, never
//! errors, and callers decide whether to surface them.
//!
//! The code set is closed and stable: discriminants are explicit and are
//! never renumbered or reused, so hosts can persist and compare them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Section string used by tool and toolpath binary streams.
pub const BIN_LOST_DATA_SECTION: &str = "BinLostData";

/// Stable identifiers for compatibility fallbacks
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LostDataCode {
    UnitDefaulted = 1,
    AllParamsDefaulted = 2,
    ViewTransformDefaulted = 3,
    AxisLimitsDefaulted = 4,
    AxisInitialValueDefaulted = 5,
    AxisDirectionAdjustedToZ = 6,
    CollisionPairNameSynthesized = 7,
    CollisionObjectPruned = 8,
    PreprocessorTypeDefaulted = 9,
    ToolShoulderLengthDefaulted = 10,
    ToolToothCountDefaulted = 11,
    ToolpathFeedRateDefaulted = 12,
}

impl LostDataCode {
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl fmt::Display for LostDataCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// One compatibility fallback applied while loading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostData {
    pub code: LostDataCode,
    /// Which part of the file the fallback applied to.
    pub section: String,
}

impl LostData {
    pub fn new(code: LostDataCode, section: impl Into<String>) -> Self {
        Self {
            code,
            section: section.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(LostDataCode::UnitDefaulted.code(), 1);
        assert_eq!(LostDataCode::AxisLimitsDefaulted.code(), 4);
        assert_eq!(LostDataCode::ToolpathFeedRateDefaulted.code(), 12);
    }

    #[test]
    fn test_record_carries_section() {
        let entry = LostData::new(LostDataCode::ToolToothCountDefaulted, BIN_LOST_DATA_SECTION);
        assert_eq!(entry.section, "BinLostData");
        assert_eq!(entry.code.code(), 11);
    }
}
