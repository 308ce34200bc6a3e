//! Tool and toolpath binary streams
//!
//! Little-endian framing with a magic marker and a version word up
//! front. Writers always emit the complete current layout; readers
//! accept any version up to the current one and default the fields an
//! older layout did not carry, reporting each default as a `LostData`
//! record.

use std::io::{Read, Write};

use glam::DVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::io::lost_data::{LostData, LostDataCode, BIN_LOST_DATA_SECTION};
use crate::units::Units;

/// Marker at the start of every tool stream ("W5TL").
pub const TOOL_MAGIC: u32 = 0x4C54_3557;
/// Marker at the start of every toolpath stream ("-SaT").
pub const TOOLPATH_MAGIC: u32 = 0x5461_532D;

pub const TOOL_STREAM_VERSION: u32 = 3;
pub const TOOLPATH_STREAM_VERSION: u32 = 2;

/// Upper bound on embedded string lengths, to catch corrupt streams
/// before allocating.
const MAX_STRING_LEN: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum BinaryError {
    #[error("bad magic marker {found:#010x}, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },
    #[error("stream version {found} is newer than the supported version {current}")]
    UnsupportedVersion { found: u32, current: u32 },
    #[error("invalid value for field '{field}'")]
    InvalidField { field: &'static str },
    #[error("i/o error reading or writing stream")]
    Io(#[from] std::io::Error),
}

/// Basic shape class of a cutting tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    EndMill,
    BallMill,
    BullMill,
    Drill,
    Lathe,
}

impl ToolKind {
    fn tag(&self) -> u32 {
        match self {
            Self::EndMill => 0,
            Self::BallMill => 1,
            Self::BullMill => 2,
            Self::Drill => 3,
            Self::Lathe => 4,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::EndMill),
            1 => Some(Self::BallMill),
            2 => Some(Self::BullMill),
            3 => Some(Self::Drill),
            4 => Some(Self::Lathe),
            _ => None,
        }
    }
}

/// Persistent description of a cutting tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub name: String,
    pub units: Units,
    pub kind: ToolKind,
    pub diameter: f64,
    pub flute_length: f64,
    /// Since stream version 2.
    pub shoulder_length: f64,
    /// Since stream version 3.
    pub tooth_count: u32,
}

/// One move of a toolpath
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolpathMove {
    pub position: DVec3,
    pub orientation: DVec3,
    /// Since stream version 2.
    pub feed: f64,
    pub rapid: bool,
}

/// Persistent toolpath: a named sequence of moves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolpathRecord {
    pub name: String,
    pub units: Units,
    pub moves: Vec<ToolpathMove>,
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, BinaryError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, BinaryError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64, BinaryError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_vec3<R: Read>(r: &mut R) -> Result<DVec3, BinaryError> {
    Ok(DVec3::new(read_f64(r)?, read_f64(r)?, read_f64(r)?))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, BinaryError> {
    let len = read_u32(r)?;
    if len > MAX_STRING_LEN {
        return Err(BinaryError::InvalidField { field: "string length" });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| BinaryError::InvalidField { field: "string" })
}

fn read_units<R: Read>(r: &mut R) -> Result<Units, BinaryError> {
    match read_u8(r)? {
        0 => Ok(Units::Metric),
        1 => Ok(Units::Inch),
        _ => Err(BinaryError::InvalidField { field: "units" }),
    }
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<(), BinaryError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64<W: Write>(w: &mut W, v: f64) -> Result<(), BinaryError> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_vec3<W: Write>(w: &mut W, v: DVec3) -> Result<(), BinaryError> {
    write_f64(w, v.x)?;
    write_f64(w, v.y)?;
    write_f64(w, v.z)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), BinaryError> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn write_units<W: Write>(w: &mut W, units: Units) -> Result<(), BinaryError> {
    let tag: u8 = match units {
        Units::Metric => 0,
        Units::Inch => 1,
    };
    w.write_all(&[tag])?;
    Ok(())
}

/// Write a tool record in the current stream layout.
pub fn save_tool<W: Write>(w: &mut W, tool: &ToolRecord) -> Result<(), BinaryError> {
    write_u32(w, TOOL_MAGIC)?;
    write_u32(w, TOOL_STREAM_VERSION)?;
    write_string(w, &tool.name)?;
    write_units(w, tool.units)?;
    write_u32(w, tool.kind.tag())?;
    write_f64(w, tool.diameter)?;
    write_f64(w, tool.flute_length)?;
    write_f64(w, tool.shoulder_length)?;
    write_u32(w, tool.tooth_count)?;
    Ok(())
}

/// Read a tool record of any version up to the current one.
///
/// Fields absent from older layouts are defaulted and reported: the
/// shoulder length falls back to the flute length (v1), the tooth count
/// to zero (v1/v2).
pub fn load_tool<R: Read>(r: &mut R) -> Result<(ToolRecord, Vec<LostData>), BinaryError> {
    let magic = read_u32(r)?;
    if magic != TOOL_MAGIC {
        return Err(BinaryError::BadMagic {
            found: magic,
            expected: TOOL_MAGIC,
        });
    }
    let version = read_u32(r)?;
    if version > TOOL_STREAM_VERSION {
        return Err(BinaryError::UnsupportedVersion {
            found: version,
            current: TOOL_STREAM_VERSION,
        });
    }
    let mut lost = Vec::new();
    let name = read_string(r)?;
    let units = read_units(r)?;
    let kind_tag = read_u32(r)?;
    let kind = ToolKind::from_tag(kind_tag).ok_or(BinaryError::InvalidField { field: "tool kind" })?;
    let diameter = read_f64(r)?;
    let flute_length = read_f64(r)?;
    let shoulder_length = if version >= 2 {
        read_f64(r)?
    } else {
        lost.push(LostData::new(
            LostDataCode::ToolShoulderLengthDefaulted,
            BIN_LOST_DATA_SECTION,
        ));
        flute_length
    };
    let tooth_count = if version >= 3 {
        read_u32(r)?
    } else {
        lost.push(LostData::new(
            LostDataCode::ToolToothCountDefaulted,
            BIN_LOST_DATA_SECTION,
        ));
        0
    };
    if !lost.is_empty() {
        debug!(version, defaults = lost.len(), "tool stream loaded with defaults");
    }
    Ok((
        ToolRecord {
            name,
            units,
            kind,
            diameter,
            flute_length,
            shoulder_length,
            tooth_count,
        },
        lost,
    ))
}

/// Write a toolpath in the current stream layout.
pub fn save_toolpath<W: Write>(w: &mut W, toolpath: &ToolpathRecord) -> Result<(), BinaryError> {
    write_u32(w, TOOLPATH_MAGIC)?;
    write_u32(w, TOOLPATH_STREAM_VERSION)?;
    write_string(w, &toolpath.name)?;
    write_units(w, toolpath.units)?;
    write_u32(w, toolpath.moves.len() as u32)?;
    for mv in &toolpath.moves {
        write_vec3(w, mv.position)?;
        write_vec3(w, mv.orientation)?;
        write_f64(w, mv.feed)?;
        w.write_all(&[mv.rapid as u8])?;
    }
    Ok(())
}

/// Read a toolpath of any version up to the current one.
///
/// `ignore_bin_file_version` skips the too-new-version check only and
/// reads the stream as the current layout; the magic check always
/// applies. Version 1 streams carry no feed rates; all moves get feed 0
/// and a single `LostData` entry reports the default.
pub fn load_toolpath<R: Read>(
    r: &mut R,
    ignore_bin_file_version: bool,
) -> Result<(ToolpathRecord, Vec<LostData>), BinaryError> {
    let magic = read_u32(r)?;
    if magic != TOOLPATH_MAGIC {
        return Err(BinaryError::BadMagic {
            found: magic,
            expected: TOOLPATH_MAGIC,
        });
    }
    let mut version = read_u32(r)?;
    if version > TOOLPATH_STREAM_VERSION {
        if !ignore_bin_file_version {
            return Err(BinaryError::UnsupportedVersion {
                found: version,
                current: TOOLPATH_STREAM_VERSION,
            });
        }
        debug!(version, "reading newer toolpath stream as current layout");
        version = TOOLPATH_STREAM_VERSION;
    }
    let mut lost = Vec::new();
    let name = read_string(r)?;
    let units = read_units(r)?;
    let count = read_u32(r)?;
    let mut moves = Vec::with_capacity(count.min(MAX_STRING_LEN) as usize);
    for _ in 0..count {
        let position = read_vec3(r)?;
        let orientation = read_vec3(r)?;
        let feed = if version >= 2 { read_f64(r)? } else { 0.0 };
        let rapid = read_u8(r)? != 0;
        moves.push(ToolpathMove {
            position,
            orientation,
            feed,
            rapid,
        });
    }
    if version < 2 && !moves.is_empty() {
        lost.push(LostData::new(
            LostDataCode::ToolpathFeedRateDefaulted,
            BIN_LOST_DATA_SECTION,
        ));
    }
    Ok((ToolpathRecord { name, units, moves }, lost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_tool() -> ToolRecord {
        ToolRecord {
            name: "face_mill_d63".to_string(),
            units: Units::Metric,
            kind: ToolKind::EndMill,
            diameter: 63.0,
            flute_length: 40.0,
            shoulder_length: 55.0,
            tooth_count: 6,
        }
    }

    #[test]
    fn test_tool_round_trip() {
        let tool = sample_tool();
        let mut buf = Vec::new();
        save_tool(&mut buf, &tool).unwrap();

        let (loaded, lost) = load_tool(&mut Cursor::new(buf)).unwrap();
        assert_eq!(loaded, tool);
        assert!(lost.is_empty());
    }

    #[test]
    fn test_tool_bad_magic() {
        let mut buf = Vec::new();
        save_tool(&mut buf, &sample_tool()).unwrap();
        buf[0] ^= 0xFF;
        let err = load_tool(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, BinaryError::BadMagic { expected, .. } if expected == TOOL_MAGIC));
    }

    #[test]
    fn test_tool_newer_version_rejected() {
        let mut buf = Vec::new();
        save_tool(&mut buf, &sample_tool()).unwrap();
        buf[4..8].copy_from_slice(&(TOOL_STREAM_VERSION + 1).to_le_bytes());
        let err = load_tool(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, BinaryError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_tool_v1_defaults_reported() {
        // Hand-build a version 1 stream: no shoulder length, no tooth count.
        let mut buf = Vec::new();
        write_u32(&mut buf, TOOL_MAGIC).unwrap();
        write_u32(&mut buf, 1).unwrap();
        write_string(&mut buf, "drill_d8").unwrap();
        write_units(&mut buf, Units::Inch).unwrap();
        write_u32(&mut buf, ToolKind::Drill.tag()).unwrap();
        write_f64(&mut buf, 8.0).unwrap();
        write_f64(&mut buf, 30.0).unwrap();

        let (tool, lost) = load_tool(&mut Cursor::new(buf)).unwrap();
        assert_eq!(tool.shoulder_length, 30.0);
        assert_eq!(tool.tooth_count, 0);
        assert_eq!(tool.kind, ToolKind::Drill);
        let codes: Vec<u32> = lost.iter().map(|l| l.code.code()).collect();
        assert_eq!(codes, vec![10, 11]);
        assert!(lost.iter().all(|l| l.section == BIN_LOST_DATA_SECTION));
    }

    #[test]
    fn test_tool_truncated_stream() {
        let mut buf = Vec::new();
        save_tool(&mut buf, &sample_tool()).unwrap();
        buf.truncate(buf.len() - 4);
        let err = load_tool(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, BinaryError::Io(_)));
    }

    #[test]
    fn test_tool_unknown_kind_tag() {
        let mut buf = Vec::new();
        write_u32(&mut buf, TOOL_MAGIC).unwrap();
        write_u32(&mut buf, 1).unwrap();
        write_string(&mut buf, "odd").unwrap();
        write_units(&mut buf, Units::Metric).unwrap();
        write_u32(&mut buf, 99).unwrap();
        write_f64(&mut buf, 1.0).unwrap();
        write_f64(&mut buf, 1.0).unwrap();
        let err = load_tool(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, BinaryError::InvalidField { field: "tool kind" }));
    }

    fn sample_toolpath() -> ToolpathRecord {
        ToolpathRecord {
            name: "roughing_1".to_string(),
            units: Units::Metric,
            moves: vec![
                ToolpathMove {
                    position: DVec3::new(0.0, 0.0, 50.0),
                    orientation: DVec3::Z,
                    feed: 0.0,
                    rapid: true,
                },
                ToolpathMove {
                    position: DVec3::new(10.0, 5.0, -2.0),
                    orientation: DVec3::Z,
                    feed: 1200.0,
                    rapid: false,
                },
            ],
        }
    }

    #[test]
    fn test_toolpath_round_trip() {
        let tp = sample_toolpath();
        let mut buf = Vec::new();
        save_toolpath(&mut buf, &tp).unwrap();
        let (loaded, lost) = load_toolpath(&mut Cursor::new(buf), false).unwrap();
        assert_eq!(loaded, tp);
        assert!(lost.is_empty());
    }

    #[test]
    fn test_toolpath_v1_defaults_feed_once() {
        let mut buf = Vec::new();
        write_u32(&mut buf, TOOLPATH_MAGIC).unwrap();
        write_u32(&mut buf, 1).unwrap();
        write_string(&mut buf, "legacy").unwrap();
        write_units(&mut buf, Units::Metric).unwrap();
        write_u32(&mut buf, 2).unwrap();
        for i in 0..2 {
            write_vec3(&mut buf, DVec3::new(i as f64, 0.0, 0.0)).unwrap();
            write_vec3(&mut buf, DVec3::Z).unwrap();
            buf.push(0);
        }

        let (tp, lost) = load_toolpath(&mut Cursor::new(buf), false).unwrap();
        assert_eq!(tp.moves.len(), 2);
        assert!(tp.moves.iter().all(|m| m.feed == 0.0));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].code, LostDataCode::ToolpathFeedRateDefaulted);
    }

    #[test]
    fn test_toolpath_version_escape_hatch() {
        let tp = sample_toolpath();
        let mut buf = Vec::new();
        save_toolpath(&mut buf, &tp).unwrap();
        buf[4..8].copy_from_slice(&(TOOLPATH_STREAM_VERSION + 5).to_le_bytes());

        let err = load_toolpath(&mut Cursor::new(buf.clone()), false).unwrap_err();
        assert!(matches!(err, BinaryError::UnsupportedVersion { found: 7, .. }));

        // Opting in reads the stream as the current layout.
        let (loaded, _) = load_toolpath(&mut Cursor::new(buf), true).unwrap();
        assert_eq!(loaded, tp);

        // The escape hatch never bypasses the magic check.
        let mut bad = Vec::new();
        save_toolpath(&mut bad, &tp).unwrap();
        bad[0] ^= 0xFF;
        assert!(matches!(
            load_toolpath(&mut Cursor::new(bad), true),
            Err(BinaryError::BadMagic { .. })
        ));
    }
}
