//! Machine definition XML reader
//!
//! Pull-based parsing with `quick-xml`. Any `xmlVersion` up to the
//! current schema loads; newer files are rejected. Values an older
//! schema did not carry are defaulted, each default reported as a
//! lost-data record. Structural problems abort the whole load; no
//! partially populated machine ever escapes.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use glam::{DMat4, DVec3};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, warn};

use crate::discrete::DiscreteValidator;
use crate::io::lost_data::{LostData, LostDataCode};
use crate::io::xml::CURRENT_XML_VERSION;
use crate::machine::{
    CollisionPair, MachineDefinition, MachineError, ObjectGroup, Preprocessor, PreprocessorKind,
};
use crate::node::{AxisState, GeometryState, HeldToolState, KinematicObject, NodeType};
use crate::units::Units;

#[derive(Debug, Error)]
pub enum XmlReadError {
    #[error("malformed XML document")]
    Xml(#[from] quick_xml::Error),
    #[error("failed to read machine definition file")]
    Io(#[from] std::io::Error),
    #[error("file version {found} is newer than the supported version {current}")]
    UnsupportedVersion { found: f32, current: f32 },
    #[error("missing element '{element}' in {context}")]
    MissingElement {
        element: &'static str,
        context: String,
    },
    #[error("missing attribute '{attribute}' on element '{element}'")]
    MissingAttribute {
        attribute: &'static str,
        element: String,
    },
    #[error("invalid value '{value}' for attribute '{attribute}' on element '{element}'")]
    InvalidAttribute {
        attribute: &'static str,
        element: String,
        value: String,
    },
    #[error("unexpected element '{element}' in {context}")]
    UnexpectedElement {
        element: String,
        context: &'static str,
    },
    #[error("malformed matrix in '{context}'")]
    MalformedMatrix { context: String },
    #[error("malformed attribute on element '{element}'")]
    MalformedAttribute { element: String },
    #[error(transparent)]
    Machine(#[from] MachineError),
}

impl XmlReadError {
    /// Stable numeric code for host-side error reporting.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Xml(_) => 100,
            Self::Io(_) => 101,
            Self::UnsupportedVersion { .. } => 102,
            Self::MissingElement { .. } => 103,
            Self::MissingAttribute { .. } => 104,
            Self::InvalidAttribute { .. } => 105,
            Self::UnexpectedElement { .. } => 106,
            Self::MalformedMatrix { .. } => 107,
            Self::MalformedAttribute { .. } => 108,
            Self::Machine(_) => 109,
        }
    }
}

/// Parse a machine definition document.
///
/// The machine is converted to `target_units` after loading, so a host
/// always receives a model in its own unit system. Returns the machine
/// together with every compatibility fallback that was applied.
pub fn read_machine_string(
    xml: &str,
    target_units: Units,
) -> Result<(MachineDefinition, Vec<LostData>), XmlReadError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut state = MachineReader {
        reader,
        machine: MachineDefinition::new(Units::Metric),
        lost: Vec::new(),
        version: CURRENT_XML_VERSION,
        synthesized_pairs: 0,
    };
    state.parse_document()?;
    let MachineReader {
        machine: mut loaded,
        lost,
        version,
        ..
    } = state;
    loaded.set_xml_version(version);
    loaded.scale(target_units);
    loaded.reset_all_scene_changes();
    debug!(version, fixups = lost.len(), "machine definition loaded");
    Ok((loaded, lost))
}

/// Parse a machine definition file. See [`read_machine_string`].
pub fn read_machine_file(
    path: &Path,
    target_units: Units,
) -> Result<(MachineDefinition, Vec<LostData>), XmlReadError> {
    let xml = fs::read_to_string(path)?;
    read_machine_string(&xml, target_units)
}

struct MachineReader<'x> {
    reader: Reader<&'x [u8]>,
    machine: MachineDefinition,
    lost: Vec<LostData>,
    version: f32,
    synthesized_pairs: u32,
}

impl<'x> MachineReader<'x> {
    /// Whether the file predates schema version `v`.
    fn older_than(&self, v: f32) -> bool {
        self.version < v - 1e-4
    }

    fn parse_document(&mut self) -> Result<(), XmlReadError> {
        // Find the root element.
        loop {
            match self.reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"machine_definition" => {
                    self.parse_root_attributes(&e)?;
                    break;
                }
                Event::Decl(_) | Event::Comment(_) | Event::Text(_) | Event::DocType(_) => {}
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "machine_definition",
                        context: "document".to_string(),
                    })
                }
                Event::Start(e) | Event::Empty(e) => {
                    return Err(XmlReadError::UnexpectedElement {
                        element: element_name(&e),
                        context: "document",
                    })
                }
                _ => {}
            }
        }

        let mut saw_kinematics = false;
        loop {
            match self.reader.read_event()? {
                Event::Start(e) => match e.name().as_ref() {
                    b"machine_data" => {
                        if let Some(text) = attr_opt(&e, "write_stl")? {
                            let flag = parse_bool(&text, "write_stl", "machine_data")?;
                            self.machine.set_write_stl(flag);
                        }
                        self.parse_machine_data()?;
                    }
                    b"kinematics" => {
                        saw_kinematics = true;
                        self.parse_kinematics(None, None)?;
                    }
                    b"magazine" => self.parse_magazine()?,
                    b"collision_checks" => self.parse_collision_checks()?,
                    b"preprocessors" => self.parse_preprocessors()?,
                    _ => {
                        return Err(XmlReadError::UnexpectedElement {
                            element: element_name(&e),
                            context: "machine_definition",
                        })
                    }
                },
                Event::Empty(e) => match e.name().as_ref() {
                    // Empty sections are legal and mean "nothing here".
                    b"machine_data" | b"kinematics" | b"magazine" | b"collision_checks"
                    | b"preprocessors" => {
                        if e.name().as_ref() == b"kinematics" {
                            saw_kinematics = true;
                        }
                    }
                    _ => {
                        return Err(XmlReadError::UnexpectedElement {
                            element: element_name(&e),
                            context: "machine_definition",
                        })
                    }
                },
                Event::End(e) if e.name().as_ref() == b"machine_definition" => break,
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "machine_definition end tag",
                        context: "document".to_string(),
                    })
                }
                _ => {}
            }
        }
        if !saw_kinematics {
            return Err(XmlReadError::MissingElement {
                element: "kinematics",
                context: "machine_definition".to_string(),
            });
        }
        Ok(())
    }

    fn parse_root_attributes(&mut self, e: &BytesStart<'_>) -> Result<(), XmlReadError> {
        let version_text = attr_required(e, "xmlVersion")?;
        self.version = version_text.parse::<f32>().map_err(|_| {
            XmlReadError::InvalidAttribute {
                attribute: "xmlVersion",
                element: "machine_definition".to_string(),
                value: version_text.clone(),
            }
        })?;
        if self.version > CURRENT_XML_VERSION + 1e-4 {
            return Err(XmlReadError::UnsupportedVersion {
                found: self.version,
                current: CURRENT_XML_VERSION,
            });
        }

        match attr_opt(e, "unit")? {
            Some(text) => {
                let units = Units::from_str(&text).map_err(|_| XmlReadError::InvalidAttribute {
                    attribute: "unit",
                    element: "machine_definition".to_string(),
                    value: text,
                })?;
                self.machine = MachineDefinition::new(units);
            }
            None if self.older_than(1.2) => {
                self.lost
                    .push(LostData::new(LostDataCode::UnitDefaulted, "machine_data"));
            }
            None => {
                return Err(XmlReadError::MissingAttribute {
                    attribute: "unit",
                    element: "machine_definition".to_string(),
                })
            }
        }
        Ok(())
    }

    fn parse_machine_data(&mut self) -> Result<(), XmlReadError> {
        let mut saw_view_matrix = false;
        loop {
            match self.reader.read_event()? {
                Event::Start(e) => match e.name().as_ref() {
                    b"name" => {
                        let text = self.reader.read_text(e.name())?.into_owned();
                        self.machine.set_machine_name(text);
                    }
                    b"controller" => {
                        let text = self.reader.read_text(e.name())?.into_owned();
                        self.machine.set_controller_name(text);
                    }
                    b"view_matrix" => {
                        let text = self.reader.read_text(e.name())?;
                        let matrix = parse_matrix(&text, "view_matrix")?;
                        self.machine.set_view_transform(matrix);
                        saw_view_matrix = true;
                    }
                    _ => {
                        return Err(XmlReadError::UnexpectedElement {
                            element: element_name(&e),
                            context: "machine_data",
                        })
                    }
                },
                Event::Empty(_) => {}
                Event::End(e) if e.name().as_ref() == b"machine_data" => break,
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "machine_data end tag",
                        context: "machine_definition".to_string(),
                    })
                }
                _ => {}
            }
        }
        if !saw_view_matrix {
            if self.older_than(1.2) {
                self.lost.push(LostData::new(
                    LostDataCode::ViewTransformDefaulted,
                    "machine_data",
                ));
            } else {
                return Err(XmlReadError::MissingElement {
                    element: "view_matrix",
                    context: "machine_data".to_string(),
                });
            }
        }
        Ok(())
    }

    fn parse_kinematics(
        &mut self,
        parent: Option<&str>,
        tree_id: Option<&str>,
    ) -> Result<(), XmlReadError> {
        loop {
            match self.reader.read_event()? {
                Event::Start(e) => self.parse_node(&e, false, parent, tree_id)?,
                Event::Empty(e) => self.parse_node(&e, true, parent, tree_id)?,
                Event::End(e) if e.name().as_ref() == b"kinematics" => break,
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "kinematics end tag",
                        context: "machine_definition".to_string(),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_node(
        &mut self,
        e: &BytesStart<'_>,
        is_empty: bool,
        parent: Option<&str>,
        tree_id: Option<&str>,
    ) -> Result<(), XmlReadError> {
        let tag = element_name(e);
        let node_type = NodeType::from_str(&tag).map_err(|_| XmlReadError::UnexpectedElement {
            element: tag.clone(),
            context: "kinematics",
        })?;
        let id = attr_required(e, "id")?;
        let units = self.machine.units();

        let node = match node_type {
            NodeType::CoordinateTransform => KinematicObject::coordinate_transform(&id, units),
            NodeType::RevolvingSet => KinematicObject::revolving_set(&id, units),
            NodeType::RotationalAxis => {
                KinematicObject::rotational_axis(&id, self.parse_axis(e, &tag)?, units)
            }
            NodeType::TranslationalAxis => {
                KinematicObject::translational_axis(&id, self.parse_axis(e, &tag)?, units)
            }
            NodeType::WorkPiece => KinematicObject::work_piece(&id, parse_geometry(e)?, units),
            NodeType::Fixture => KinematicObject::fixture(&id, parse_geometry(e)?, units),
            NodeType::StockGeometry => {
                KinematicObject::stock_geometry(&id, parse_geometry(e)?, units)
            }
            NodeType::InitialStock => KinematicObject::initial_stock(&id, parse_geometry(e)?, units),
            NodeType::TailStock => KinematicObject::tail_stock(&id, parse_geometry(e)?, units),
            NodeType::WireEdmHead => KinematicObject::wire_edm_head(&id, parse_geometry(e)?, units),
            NodeType::MountAdapter => {
                KinematicObject::mount_adapter(&id, parse_geometry(e)?, units)
            }
            NodeType::ToolpathGeometry => {
                KinematicObject::toolpath_geometry(&id, parse_geometry(e)?, units)
            }
            NodeType::HeldTool => KinematicObject::held_tool(&id, parse_held_tool(e, &tag)?, units),
        };
        let is_axis = node.is_axis();
        self.machine.add_object(node, parent, tree_id)?;
        if is_empty {
            return Ok(());
        }

        loop {
            match self.reader.read_event()? {
                Event::Start(c) if c.name().as_ref() == b"matrix" => {
                    let text = self.reader.read_text(c.name())?;
                    if is_axis {
                        // Axis matrices are derived from the value.
                        continue;
                    }
                    let matrix = parse_matrix(&text, &id)?;
                    self.machine.set_initial_coordinate_system(&id, matrix)?;
                }
                Event::Start(c) => self.parse_node(&c, false, Some(&id), tree_id)?,
                Event::Empty(c) => self.parse_node(&c, true, Some(&id), tree_id)?,
                Event::End(c) if c.name().as_ref() == tag.as_bytes() => break,
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "node end tag",
                        context: tag.clone(),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_axis(&mut self, e: &BytesStart<'_>, tag: &str) -> Result<AxisState, XmlReadError> {
        let direction_text = attr_required(e, "direction")?;
        let mut direction = parse_vec3(&direction_text, "direction", tag)?;
        if direction.length_squared() < 1e-18 {
            self.lost.push(LostData::new(
                LostDataCode::AxisDirectionAdjustedToZ,
                "kinematics",
            ));
            warn!(axis = tag, "null axis direction adjusted to Z");
            direction = DVec3::Z;
        }
        let min = attr_opt(e, "min")?;
        let max = attr_opt(e, "max")?;
        if (min.is_none() || max.is_none()) && self.older_than(1.3) {
            self.lost.push(LostData::new(
                LostDataCode::AxisLimitsDefaulted,
                "kinematics",
            ));
        }
        let min = match min {
            Some(s) => parse_f64(&s, "min", tag)?,
            None => f64::NEG_INFINITY,
        };
        let max = match max {
            Some(s) => parse_f64(&s, "max", tag)?,
            None => f64::INFINITY,
        };

        let value = match attr_opt(e, "value")? {
            Some(s) => parse_f64(&s, "value", tag)?,
            None => 0.0,
        };
        let initial = match attr_opt(e, "initial")? {
            Some(s) => parse_f64(&s, "initial", tag)?,
            None if self.older_than(1.4) => {
                self.lost.push(LostData::new(
                    LostDataCode::AxisInitialValueDefaulted,
                    "kinematics",
                ));
                0.0
            }
            None => value,
        };

        let mut axis = AxisState::new(direction)
            .with_limits(min, max)
            .with_initial_value(initial);
        if let Some(center_text) = attr_opt(e, "center")? {
            axis = axis.with_center(parse_vec3(&center_text, "center", tag)?);
        }
        if let Some(list_text) = attr_opt(e, "discrete_values")? {
            let mut values = Vec::new();
            for part in list_text.split_whitespace() {
                values.push(parse_f64(part, "discrete_values", tag)?);
            }
            axis = axis.with_validator(DiscreteValidator::List(values));
        } else if let Some(start_text) = attr_opt(e, "discrete_start")? {
            let step_text = attr_opt(e, "discrete_step")?.ok_or(XmlReadError::MissingAttribute {
                attribute: "discrete_step",
                element: tag.to_string(),
            })?;
            axis = axis.with_validator(DiscreteValidator::Stepping {
                start: parse_f64(&start_text, "discrete_start", tag)?,
                step: parse_f64(&step_text, "discrete_step", tag)?,
            });
        }
        axis.set_value(value)
            .map_err(|_| XmlReadError::InvalidAttribute {
                attribute: "value",
                element: tag.to_string(),
                value: value.to_string(),
            })?;
        Ok(axis)
    }

    fn parse_magazine(&mut self) -> Result<(), XmlReadError> {
        loop {
            match self.reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"module" => {
                    let id = attr_required(&e, "id")?;
                    self.machine.add_kinematic_module(&id)?;
                    loop {
                        match self.reader.read_event()? {
                            Event::Start(c) if c.name().as_ref() == b"kinematics" => {
                                self.parse_kinematics(None, Some(&id))?;
                            }
                            Event::Empty(c) if c.name().as_ref() == b"kinematics" => {}
                            Event::End(c) if c.name().as_ref() == b"module" => break,
                            Event::Eof => {
                                return Err(XmlReadError::MissingElement {
                                    element: "module end tag",
                                    context: "magazine".to_string(),
                                })
                            }
                            _ => {}
                        }
                    }
                }
                Event::Empty(e) if e.name().as_ref() == b"module" => {
                    let id = attr_required(&e, "id")?;
                    self.machine.add_kinematic_module(&id)?;
                }
                Event::Start(e) | Event::Empty(e) => {
                    return Err(XmlReadError::UnexpectedElement {
                        element: element_name(&e),
                        context: "magazine",
                    })
                }
                Event::End(e) if e.name().as_ref() == b"magazine" => break,
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "magazine end tag",
                        context: "machine_definition".to_string(),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_collision_checks(&mut self) -> Result<(), XmlReadError> {
        loop {
            match self.reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"pair" => {
                    let name = match attr_opt(&e, "name")? {
                        Some(name) => name,
                        None if self.older_than(1.5) => {
                            self.synthesized_pairs += 1;
                            self.lost.push(LostData::new(
                                LostDataCode::CollisionPairNameSynthesized,
                                "collision_checks",
                            ));
                            format!("collision_pair_{}", self.synthesized_pairs)
                        }
                        None => {
                            return Err(XmlReadError::MissingAttribute {
                                attribute: "name",
                                element: "pair".to_string(),
                            })
                        }
                    };
                    let mut groups = Vec::new();
                    loop {
                        match self.reader.read_event()? {
                            Event::Start(g) if g.name().as_ref() == b"group" => {
                                groups.push(self.parse_collision_group(&g)?);
                            }
                            Event::Empty(g) if g.name().as_ref() == b"group" => {
                                groups.push(ObjectGroup::new(attr_required(&g, "name")?));
                            }
                            Event::End(p) if p.name().as_ref() == b"pair" => break,
                            Event::Eof => {
                                return Err(XmlReadError::MissingElement {
                                    element: "pair end tag",
                                    context: "collision_checks".to_string(),
                                })
                            }
                            _ => {}
                        }
                    }
                    if groups.len() != 2 {
                        return Err(XmlReadError::MissingElement {
                            element: "group",
                            context: format!("pair '{}'", name),
                        });
                    }
                    let group2 = groups.pop().unwrap_or_else(|| ObjectGroup::new(""));
                    let group1 = groups.pop().unwrap_or_else(|| ObjectGroup::new(""));
                    self.machine
                        .add_coll_check(CollisionPair::new(name, group1, group2), false)?;
                }
                Event::End(e) if e.name().as_ref() == b"collision_checks" => break,
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "collision_checks end tag",
                        context: "machine_definition".to_string(),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_collision_group(&mut self, g: &BytesStart<'_>) -> Result<ObjectGroup, XmlReadError> {
        let mut group = ObjectGroup::new(attr_required(g, "name")?);
        loop {
            match self.reader.read_event()? {
                Event::Empty(o) | Event::Start(o) if o.name().as_ref() == b"object" => {
                    let id = attr_required(&o, "id")?;
                    if self.machine.is_object_defined_in_any_tree(&id) {
                        group.insert_member(id);
                    } else {
                        // Old files may reference objects removed since.
                        warn!(object = id.as_str(), "pruning unknown collision group member");
                        self.lost.push(LostData::new(
                            LostDataCode::CollisionObjectPruned,
                            "collision_checks",
                        ));
                    }
                }
                Event::End(e) if e.name().as_ref() == b"group" => break,
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "group end tag",
                        context: "collision_checks".to_string(),
                    })
                }
                _ => {}
            }
        }
        Ok(group)
    }

    fn parse_preprocessors(&mut self) -> Result<(), XmlReadError> {
        loop {
            match self.reader.read_event()? {
                Event::Empty(e) | Event::Start(e) if e.name().as_ref() == b"preprocessor" => {
                    let file = attr_required(&e, "file")?;
                    let variable = attr_required(&e, "variable")?;
                    let kind_text = attr_required(&e, "type")?;
                    let kind = match PreprocessorKind::from_str(&kind_text) {
                        Ok(kind) => kind,
                        Err(_) if self.older_than(1.6) => {
                            self.lost.push(LostData::new(
                                LostDataCode::PreprocessorTypeDefaulted,
                                "preprocessors",
                            ));
                            PreprocessorKind::Modifier
                        }
                        Err(_) => {
                            return Err(XmlReadError::InvalidAttribute {
                                attribute: "type",
                                element: "preprocessor".to_string(),
                                value: kind_text,
                            })
                        }
                    };
                    self.machine
                        .add_preprocessor(Preprocessor::new(file, variable, kind));
                }
                Event::End(e) if e.name().as_ref() == b"preprocessors" => break,
                Event::Eof => {
                    return Err(XmlReadError::MissingElement {
                        element: "preprocessors end tag",
                        context: "machine_definition".to_string(),
                    })
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attr_opt(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, XmlReadError> {
    let attr = e
        .try_get_attribute(name)
        .map_err(|_| XmlReadError::MalformedAttribute {
            element: element_name(e),
        })?;
    match attr {
        Some(a) => {
            let raw = String::from_utf8_lossy(&a.value).into_owned();
            let unescaped =
                quick_xml::escape::unescape(&raw).map_err(|_| XmlReadError::MalformedAttribute {
                    element: element_name(e),
                })?;
            Ok(Some(unescaped.into_owned()))
        }
        None => Ok(None),
    }
}

fn attr_required(e: &BytesStart<'_>, name: &'static str) -> Result<String, XmlReadError> {
    attr_opt(e, name)?.ok_or(XmlReadError::MissingAttribute {
        attribute: name,
        element: element_name(e),
    })
}

fn parse_f64(text: &str, attribute: &'static str, element: &str) -> Result<f64, XmlReadError> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| XmlReadError::InvalidAttribute {
            attribute,
            element: element.to_string(),
            value: text.to_string(),
        })
}

fn parse_bool(text: &str, attribute: &'static str, element: &str) -> Result<bool, XmlReadError> {
    match text.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(XmlReadError::InvalidAttribute {
            attribute,
            element: element.to_string(),
            value: other.to_string(),
        }),
    }
}

fn parse_vec3(text: &str, attribute: &'static str, element: &str) -> Result<DVec3, XmlReadError> {
    let parts: Vec<f64> = text
        .split_whitespace()
        .map(|p| parse_f64(p, attribute, element))
        .collect::<Result<_, _>>()?;
    if parts.len() != 3 {
        return Err(XmlReadError::InvalidAttribute {
            attribute,
            element: element.to_string(),
            value: text.to_string(),
        });
    }
    Ok(DVec3::new(parts[0], parts[1], parts[2]))
}

/// 16 row-major floats, space separated.
fn parse_matrix(text: &str, context: &str) -> Result<DMat4, XmlReadError> {
    let values: Vec<f64> = text
        .split_whitespace()
        .map(|p| p.parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| XmlReadError::MalformedMatrix {
            context: context.to_string(),
        })?;
    let array: [f64; 16] = values
        .try_into()
        .map_err(|_| XmlReadError::MalformedMatrix {
            context: context.to_string(),
        })?;
    Ok(DMat4::from_cols_array(&array).transpose())
}

fn parse_geometry(e: &BytesStart<'_>) -> Result<GeometryState, XmlReadError> {
    Ok(GeometryState::new(
        attr_opt(e, "stl")?.unwrap_or_default(),
    ))
}

fn parse_held_tool(e: &BytesStart<'_>, tag: &str) -> Result<HeldToolState, XmlReadError> {
    let mut tool = HeldToolState::new(None);
    tool.geometry_mut()
        .set_stl_filename(attr_opt(e, "stl")?.unwrap_or_default());
    if let Some(text) = attr_opt(e, "holder_visible")? {
        tool.set_holder_visible(parse_bool(&text, "holder_visible", tag)?);
    }
    if let Some(text) = attr_opt(e, "arbor_visible")? {
        tool.set_arbor_visible(parse_bool(&text, "arbor_visible", tag)?);
    }
    if let Some(text) = attr_opt(e, "cutting_visible")? {
        tool.set_cutting_visible(parse_bool(&text, "cutting_visible", tag)?);
    }
    if let Some(text) = attr_opt(e, "non_cutting_visible")? {
        tool.set_non_cutting_visible(parse_bool(&text, "non_cutting_visible", tag)?);
    }
    Ok(tool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::xml::writer::write_machine_string;
    use crate::node::NodeType;
    use std::io::Write;

    fn approx_eq(a: DMat4, b: DMat4) -> bool {
        a.to_cols_array()
            .iter()
            .zip(b.to_cols_array().iter())
            .all(|(x, y)| (x - y).abs() < 1e-9)
    }

    const SMALL_MACHINE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<machine_definition xmlVersion="1.7" unit="metric">
  <machine_data write_stl="false">
    <name>mill_3ax</name>
    <controller>ctrl-7</controller>
    <view_matrix>1 0 0 0 0 1 0 0 0 0 1 0 0 0 0 1</view_matrix>
  </machine_data>
  <kinematics>
    <coordinate_transform id="base">
      <matrix>1 0 0 10 0 1 0 0 0 0 1 0 0 0 0 1</matrix>
      <rotational_axis id="spindle" direction="0 0 1" min="-99999" max="99999" value="0" initial="0">
        <held_tool id="tool" stl="tool.stl" holder_visible="true" arbor_visible="true" cutting_visible="true" non_cutting_visible="false"/>
      </rotational_axis>
      <work_piece id="part" stl="part.stl"/>
    </coordinate_transform>
  </kinematics>
  <magazine>
    <module id="head1">
      <kinematics>
        <translational_axis id="quill" direction="0 0 1" min="0" max="120" value="5" initial="0"/>
      </kinematics>
    </module>
  </magazine>
  <collision_checks>
    <pair name="tool_vs_part">
      <group name="g1"><object id="tool"/></group>
      <group name="g2"><object id="part"/></group>
    </pair>
  </collision_checks>
  <preprocessors>
    <preprocessor file="pre.lua" variable="v1" type="modifier"/>
  </preprocessors>
</machine_definition>
"#;

    #[test]
    fn test_read_current_version_machine() {
        let (machine, lost) = read_machine_string(SMALL_MACHINE, Units::Metric).unwrap();
        assert!(lost.is_empty());
        assert_eq!(machine.machine_name(), "mill_3ax");
        assert_eq!(machine.controller_name(), "ctrl-7");
        assert!(!machine.write_stl());
        assert!((machine.xml_version() - 1.7).abs() < 1e-4);

        let base = machine.get_object_by_name("base", None).unwrap();
        assert!(approx_eq(
            base.local_matrix(),
            DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0))
        ));
        // Matrix of the parent propagated into the tool.
        let tool = machine.get_object_by_name("tool", None).unwrap();
        assert!(approx_eq(
            tool.propagated_matrix(),
            DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0))
        ));
        assert!(!tool.held_tool_state().unwrap().non_cutting_visible());

        let quill = machine.get_object_by_name("quill", None).unwrap();
        assert_eq!(quill.axis_state().unwrap().value(), 5.0);
        assert_eq!(machine.kinematic_module_containing("quill"), Some("head1"));
        assert!(machine.collision_checks().contains_key("tool_vs_part"));
        assert_eq!(machine.preprocessors().len(), 1);
    }

    #[test]
    fn test_round_trip_through_writer() {
        let (machine, _) = read_machine_string(SMALL_MACHINE, Units::Metric).unwrap();
        let xml = write_machine_string(&machine).unwrap();
        let (reloaded, lost) = read_machine_string(&xml, Units::Metric).unwrap();
        assert!(lost.is_empty());

        assert_eq!(reloaded.machine_name(), machine.machine_name());
        assert_eq!(reloaded.primary_tree().len(), machine.primary_tree().len());
        assert_eq!(reloaded.magazine().len(), 1);
        for name in ["base", "spindle", "tool", "part"] {
            let a = machine.get_object_by_name(name, None).unwrap();
            let b = reloaded.get_object_by_name(name, None).unwrap();
            assert_eq!(a.node_type(), b.node_type());
            assert!(approx_eq(a.propagated_matrix(), b.propagated_matrix()));
        }
        assert_eq!(
            reloaded.collision_checks()["tool_vs_part"],
            machine.collision_checks()["tool_vs_part"]
        );
        assert_eq!(reloaded.preprocessors(), machine.preprocessors());
    }

    #[test]
    fn test_reset_positions_restores_loaded_matrices() {
        let (mut machine, _) = read_machine_string(SMALL_MACHINE, Units::Metric).unwrap();
        machine.set_axis_value("spindle", 45.0).unwrap();
        machine.reset_positions();

        // Loaded matrices are the reset baseline, not identity.
        let base = machine.get_object_by_name("base", None).unwrap();
        assert!(approx_eq(
            base.local_matrix(),
            DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0))
        ));
        let spindle = machine.get_object_by_name("spindle", None).unwrap();
        assert_eq!(spindle.axis_state().unwrap().value(), 0.0);
        let tool = machine.get_object_by_name("tool", None).unwrap();
        assert!(approx_eq(
            tool.propagated_matrix(),
            DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0))
        ));
    }

    #[test]
    fn test_newer_version_rejected() {
        let xml = SMALL_MACHINE.replace("xmlVersion=\"1.7\"", "xmlVersion=\"2.0\"");
        let err = read_machine_string(&xml, Units::Metric).unwrap_err();
        assert!(matches!(err, XmlReadError::UnsupportedVersion { .. }));
        assert_eq!(err.error_code(), 102);
    }

    #[test]
    fn test_old_version_fixups_reported() {
        let xml = r#"<machine_definition xmlVersion="1.1" unit="metric">
  <machine_data>
    <name>old_mill</name>
  </machine_data>
  <kinematics>
    <coordinate_transform id="base">
      <rotational_axis id="c" direction="0 0 0" value="0"/>
    </coordinate_transform>
  </kinematics>
</machine_definition>
"#;
        let (machine, lost) = read_machine_string(xml, Units::Metric).unwrap();
        let codes: Vec<LostDataCode> = lost.iter().map(|l| l.code).collect();
        assert!(codes.contains(&LostDataCode::ViewTransformDefaulted));
        assert!(codes.contains(&LostDataCode::AxisLimitsDefaulted));
        assert!(codes.contains(&LostDataCode::AxisInitialValueDefaulted));
        assert!(codes.contains(&LostDataCode::AxisDirectionAdjustedToZ));

        let axis = machine.get_axis_by_name("c").unwrap();
        let state = axis.axis_state().unwrap();
        assert_eq!(state.direction(), DVec3::Z);
        assert_eq!(state.min_limit(), f64::NEG_INFINITY);
        assert!((machine.xml_version() - 1.1).abs() < 1e-4);
    }

    #[test]
    fn test_missing_view_matrix_is_error_at_current_version() {
        let xml = r#"<machine_definition xmlVersion="1.7" unit="metric">
  <machine_data>
    <name>m</name>
  </machine_data>
  <kinematics/>
</machine_definition>
"#;
        let err = read_machine_string(xml, Units::Metric).unwrap_err();
        assert!(matches!(
            err,
            XmlReadError::MissingElement { element: "view_matrix", .. }
        ));
    }

    #[test]
    fn test_unknown_collision_member_pruned_with_lost_data() {
        let xml = r#"<machine_definition xmlVersion="1.7" unit="metric">
  <machine_data write_stl="false">
    <name>m</name>
    <controller>c</controller>
    <view_matrix>1 0 0 0 0 1 0 0 0 0 1 0 0 0 0 1</view_matrix>
  </machine_data>
  <kinematics>
    <coordinate_transform id="base"/>
  </kinematics>
  <collision_checks>
    <pair name="p">
      <group name="g1"><object id="base"/><object id="ghost"/></group>
      <group name="g2"><object id="base"/></group>
    </pair>
  </collision_checks>
</machine_definition>
"#;
        let (machine, lost) = read_machine_string(xml, Units::Metric).unwrap();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].code, LostDataCode::CollisionObjectPruned);
        assert!(!machine.collision_checks()["p"].is_object_defined("ghost"));
        assert!(machine.collision_checks()["p"].is_object_defined("base"));
    }

    #[test]
    fn test_duplicate_object_id_aborts_load() {
        let xml = r#"<machine_definition xmlVersion="1.7" unit="metric">
  <machine_data write_stl="false">
    <name>m</name>
    <controller>c</controller>
    <view_matrix>1 0 0 0 0 1 0 0 0 0 1 0 0 0 0 1</view_matrix>
  </machine_data>
  <kinematics>
    <coordinate_transform id="base"/>
    <coordinate_transform id="base"/>
  </kinematics>
</machine_definition>
"#;
        let err = read_machine_string(xml, Units::Metric).unwrap_err();
        assert!(matches!(err, XmlReadError::Machine(_)));
        assert_eq!(err.error_code(), 109);
    }

    #[test]
    fn test_target_units_conversion_on_load() {
        let (machine, _) = read_machine_string(SMALL_MACHINE, Units::Inch).unwrap();
        assert_eq!(machine.units(), Units::Inch);
        let base = machine.get_object_by_name("base", None).unwrap();
        assert!(approx_eq(
            base.local_matrix(),
            DMat4::from_translation(DVec3::new(10.0 / 25.4, 0.0, 0.0))
        ));
        // Ledger is clean after a load.
        assert!(machine.scene_changes().is_empty());
    }

    #[test]
    fn test_read_machine_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SMALL_MACHINE.as_bytes()).unwrap();
        let (machine, _) = read_machine_file(file.path(), Units::Metric).unwrap();
        assert_eq!(machine.machine_name(), "mill_3ax");
        assert_eq!(
            machine.first_object_of_type(None, NodeType::WorkPiece),
            Some("part".to_string())
        );
    }
}
