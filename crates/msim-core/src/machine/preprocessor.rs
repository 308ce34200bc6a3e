//! Preprocessor registration records
//!
//! A machine definition can name external preprocessor scripts that a
//! host runs against incoming toolpaths. The model only persists the
//! registrations; execution is entirely the host's business.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessorKind {
    /// Rewrites moves of an existing toolpath
    Modifier,
    /// Inserts additional moves
    Inserter,
}

impl fmt::Display for PreprocessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modifier => write!(f, "modifier"),
            Self::Inserter => write!(f, "inserter"),
        }
    }
}

impl FromStr for PreprocessorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "modifier" => Ok(Self::Modifier),
            "inserter" => Ok(Self::Inserter),
            _ => Err(format!("Unknown preprocessor type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preprocessor {
    pub file: String,
    pub instance_variable: String,
    pub kind: PreprocessorKind,
}

impl Preprocessor {
    pub fn new(
        file: impl Into<String>,
        instance_variable: impl Into<String>,
        kind: PreprocessorKind,
    ) -> Self {
        Self {
            file: file.into(),
            instance_variable: instance_variable.into(),
            kind,
        }
    }
}
