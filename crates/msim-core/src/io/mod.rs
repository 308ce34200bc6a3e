//! Persistence for machine definitions, tools and toolpaths
//!
//! Machine definitions live in a versioned XML format; tools and
//! toolpaths use small binary streams. Every loader reports the
//! compatibility fallbacks it applied as lost-data records.

pub mod binary;
pub mod lost_data;
pub mod xml;

pub use binary::{
    load_tool, load_toolpath, save_tool, save_toolpath, BinaryError, ToolKind, ToolRecord,
    ToolpathMove, ToolpathRecord,
};
pub use lost_data::{LostData, LostDataCode, BIN_LOST_DATA_SECTION};
pub use xml::{
    read_machine_file, read_machine_string, write_machine_file, write_machine_string,
    XmlReadError, XmlWriteError, CURRENT_XML_VERSION,
};
