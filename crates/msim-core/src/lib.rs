//! Machine Model Core Data Structures
//!
//! This crate contains the kinematic model of a CNC machine:
//! - KinematicObject: one node of the kinematic tree, thirteen kinds
//! - KinematicTree: tree storage, matrix propagation, scene-change ledger
//! - MachineDefinition: trees, magazine, collision checks, preprocessors
//! - io: versioned XML machine files plus binary tool/toolpath streams

pub mod clamped;
pub mod discrete;
pub mod io;
pub mod machine;
pub mod node;
pub mod tree;
pub mod units;

pub use clamped::*;
pub use discrete::*;
pub use io::*;
pub use machine::*;
pub use node::*;
pub use tree::*;
pub use units::*;
