//! Machine definition XML persistence
//!
//! The writer always emits the current schema; the reader accepts any
//! `xmlVersion` up to the current one and applies per-value fixups for
//! older files, reported as lost-data records.

pub mod reader;
pub mod writer;

/// Current machine definition schema version.
pub const CURRENT_XML_VERSION: f32 = 1.7;

pub use reader::{read_machine_file, read_machine_string, XmlReadError};
pub use writer::{write_machine_file, write_machine_string, XmlWriteError};
