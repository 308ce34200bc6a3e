//! Machine definition XML writer
//!
//! Builds the document as a string, section by section. The full current
//! schema is always written, whatever version the machine was loaded
//! from. Mounted modules cannot be saved; unmount first so the magazine
//! section round-trips.

use std::fs;
use std::path::Path;

use glam::{DMat4, DVec3};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::io::xml::CURRENT_XML_VERSION;
use crate::machine::MachineDefinition;
use crate::node::{KinematicObject, NodeKind};
use crate::tree::KinematicTree;

#[derive(Debug, Error)]
pub enum XmlWriteError {
    #[error("kinematic module '{0}' is mounted; unmount it before saving")]
    ModuleMounted(String),
    #[error("failed to write machine definition file")]
    Io(#[from] std::io::Error),
}

/// Serialize a machine definition to an XML string.
pub fn write_machine_string(machine: &MachineDefinition) -> Result<String, XmlWriteError> {
    for (id, module) in machine.magazine() {
        if module.is_mounted() {
            return Err(XmlWriteError::ModuleMounted(id.clone()));
        }
    }

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<machine_definition xmlVersion=\"{}\" unit=\"{}\">\n",
        CURRENT_XML_VERSION,
        machine.units()
    ));

    xml.push_str(&format!(
        "  <machine_data write_stl=\"{}\">\n",
        machine.write_stl()
    ));
    xml.push_str(&format!(
        "    <name>{}</name>\n",
        xml_escape(machine.machine_name())
    ));
    xml.push_str(&format!(
        "    <controller>{}</controller>\n",
        xml_escape(machine.controller_name())
    ));
    xml.push_str(&format!(
        "    <view_matrix>{}</view_matrix>\n",
        fmt_matrix(machine.view_transform())
    ));
    xml.push_str("  </machine_data>\n");

    xml.push_str("  <kinematics>\n");
    write_tree(&mut xml, machine.primary_tree(), 2);
    xml.push_str("  </kinematics>\n");

    if !machine.magazine().is_empty() {
        xml.push_str("  <magazine>\n");
        for (id, module) in machine.magazine() {
            xml.push_str(&format!("    <module id=\"{}\">\n", xml_escape(id)));
            xml.push_str("      <kinematics>\n");
            write_tree(&mut xml, module.tree(), 4);
            xml.push_str("      </kinematics>\n");
            xml.push_str("    </module>\n");
        }
        xml.push_str("  </magazine>\n");
    }

    if !machine.collision_checks().is_empty() {
        xml.push_str("  <collision_checks>\n");
        for pair in machine.collision_checks().values() {
            xml.push_str(&format!("    <pair name=\"{}\">\n", xml_escape(pair.name())));
            for group in [pair.group1(), pair.group2()] {
                xml.push_str(&format!(
                    "      <group name=\"{}\">\n",
                    xml_escape(group.name())
                ));
                for member in group.members() {
                    xml.push_str(&format!("        <object id=\"{}\"/>\n", xml_escape(member)));
                }
                xml.push_str("      </group>\n");
            }
            xml.push_str("    </pair>\n");
        }
        xml.push_str("  </collision_checks>\n");
    }

    if !machine.preprocessors().is_empty() {
        xml.push_str("  <preprocessors>\n");
        for pre in machine.preprocessors() {
            xml.push_str(&format!(
                "    <preprocessor file=\"{}\" variable=\"{}\" type=\"{}\"/>\n",
                xml_escape(&pre.file),
                xml_escape(&pre.instance_variable),
                pre.kind
            ));
        }
        xml.push_str("  </preprocessors>\n");
    }

    xml.push_str("</machine_definition>\n");
    Ok(xml)
}

/// Serialize a machine definition to a file.
pub fn write_machine_file(
    machine: &MachineDefinition,
    path: &Path,
) -> Result<(), XmlWriteError> {
    let xml = write_machine_string(machine)?;
    fs::write(path, xml)?;
    debug!(path = %path.display(), "machine definition written");
    Ok(())
}

fn write_tree(xml: &mut String, tree: &KinematicTree, depth: usize) {
    for root in tree.roots() {
        write_node_recursive(xml, tree, *root, depth + 1);
    }
}

fn write_node_recursive(xml: &mut String, tree: &KinematicTree, id: Uuid, depth: usize) {
    let Some(node) = tree.get(id) else {
        return;
    };
    let indent = "  ".repeat(depth);
    let tag = node.node_type().xml_tag();
    let children = tree.children(id);
    // The local matrix of an axis is derived from its value; identity
    // matrices elsewhere are implied.
    let write_matrix = !node.is_axis() && node.local_matrix() != DMat4::IDENTITY;
    let has_body = !children.is_empty() || write_matrix;

    xml.push_str(&format!(
        "{}<{} id=\"{}\"{}",
        indent,
        tag,
        xml_escape(node.name()),
        node_attributes(node)
    ));
    if !has_body {
        xml.push_str("/>\n");
        return;
    }
    xml.push_str(">\n");

    if write_matrix {
        xml.push_str(&format!(
            "{}  <matrix>{}</matrix>\n",
            indent,
            fmt_matrix(node.local_matrix())
        ));
    }
    for child in children {
        write_node_recursive(xml, tree, *child, depth + 1);
    }
    xml.push_str(&format!("{}</{}>\n", indent, tag));
}

fn node_attributes(node: &KinematicObject) -> String {
    let mut attrs = String::new();
    match node.kind() {
        NodeKind::CoordinateTransform(_) | NodeKind::RevolvingSet(_) => {}
        NodeKind::RotationalAxis(axis) | NodeKind::TranslationalAxis(axis) => {
            attrs.push_str(&format!(" direction=\"{}\"", fmt_vec3(axis.direction())));
            if axis.min_limit().is_finite() {
                attrs.push_str(&format!(" min=\"{}\"", axis.min_limit()));
            }
            if axis.max_limit().is_finite() {
                attrs.push_str(&format!(" max=\"{}\"", axis.max_limit()));
            }
            attrs.push_str(&format!(" value=\"{}\"", axis.value()));
            attrs.push_str(&format!(" initial=\"{}\"", axis.initial_value()));
            if axis.center_point() != DVec3::ZERO {
                attrs.push_str(&format!(" center=\"{}\"", fmt_vec3(axis.center_point())));
            }
            match axis.validator() {
                Some(crate::discrete::DiscreteValidator::List(values)) => {
                    let list: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                    attrs.push_str(&format!(" discrete_values=\"{}\"", list.join(" ")));
                }
                Some(crate::discrete::DiscreteValidator::Stepping { start, step }) => {
                    attrs.push_str(&format!(
                        " discrete_start=\"{}\" discrete_step=\"{}\"",
                        start, step
                    ));
                }
                None => {}
            }
        }
        NodeKind::HeldTool(tool) => {
            if !tool.geometry().stl_filename().is_empty() {
                attrs.push_str(&format!(
                    " stl=\"{}\"",
                    xml_escape(tool.geometry().stl_filename())
                ));
            }
            attrs.push_str(&format!(
                " holder_visible=\"{}\" arbor_visible=\"{}\" cutting_visible=\"{}\" non_cutting_visible=\"{}\"",
                tool.holder_visible(),
                tool.arbor_visible(),
                tool.cutting_visible(),
                tool.non_cutting_visible()
            ));
        }
        NodeKind::WorkPiece(g)
        | NodeKind::Fixture(g)
        | NodeKind::StockGeometry(g)
        | NodeKind::InitialStock(g)
        | NodeKind::TailStock(g)
        | NodeKind::WireEdmHead(g)
        | NodeKind::MountAdapter(g)
        | NodeKind::ToolpathGeometry(g) => {
            if !g.stl_filename().is_empty() {
                attrs.push_str(&format!(" stl=\"{}\"", xml_escape(g.stl_filename())));
            }
        }
    }
    attrs
}

/// 16 row-major floats, space separated.
fn fmt_matrix(m: DMat4) -> String {
    let values: Vec<String> = m
        .transpose()
        .to_cols_array()
        .iter()
        .map(|v| v.to_string())
        .collect();
    values.join(" ")
}

fn fmt_vec3(v: DVec3) -> String {
    format!("{} {} {}", v.x, v.y, v.z)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{CollisionPair, ObjectGroup, Preprocessor, PreprocessorKind};
    use crate::node::{AxisState, GeometryState};
    use crate::units::Units;
    use glam::DVec3;

    fn small_machine() -> MachineDefinition {
        let mut machine = MachineDefinition::new(Units::Metric);
        machine.set_machine_name("lathe");
        machine.set_controller_name("ctrl-7");
        machine
            .add_object(
                KinematicObject::coordinate_transform("base", Units::Metric),
                None,
                None,
            )
            .unwrap();
        machine
            .add_object(
                KinematicObject::rotational_axis(
                    "c_axis",
                    AxisState::new(DVec3::Z).with_limits(-360.0, 360.0),
                    Units::Metric,
                ),
                Some("base"),
                None,
            )
            .unwrap();
        machine
            .add_object(
                KinematicObject::work_piece("part", GeometryState::new("part.stl"), Units::Metric),
                Some("c_axis"),
                None,
            )
            .unwrap();
        machine
    }

    #[test]
    fn test_writer_emits_current_schema() {
        let machine = small_machine();
        let xml = write_machine_string(&machine).unwrap();
        assert!(xml.contains("xmlVersion=\"1.7\""));
        assert!(xml.contains("unit=\"metric\""));
        assert!(xml.contains("<name>lathe</name>"));
        assert!(xml.contains("<rotational_axis id=\"c_axis\""));
        assert!(xml.contains("direction=\"0 0 1\""));
        assert!(xml.contains("<work_piece id=\"part\" stl=\"part.stl\"/>"));
    }

    #[test]
    fn test_writer_includes_collision_and_preprocessors() {
        let mut machine = small_machine();
        let mut g1 = ObjectGroup::new("g1");
        g1.insert_member("part");
        let mut g2 = ObjectGroup::new("g2");
        g2.insert_member("base");
        machine
            .add_coll_check(CollisionPair::new("p1", g1, g2), false)
            .unwrap();
        machine.add_preprocessor(Preprocessor::new(
            "pre.lua",
            "var1",
            PreprocessorKind::Inserter,
        ));

        let xml = write_machine_string(&machine).unwrap();
        assert!(xml.contains("<pair name=\"p1\">"));
        assert!(xml.contains("<object id=\"part\"/>"));
        assert!(xml.contains("type=\"inserter\""));
    }

    #[test]
    fn test_writer_rejects_mounted_module() {
        let mut machine = small_machine();
        machine.add_kinematic_module("head").unwrap();
        machine
            .add_object(
                KinematicObject::coordinate_transform("head_base", Units::Metric),
                None,
                Some("head"),
            )
            .unwrap();
        machine.mount_kinematic_module("base", "head").unwrap();

        let err = write_machine_string(&machine).unwrap_err();
        assert!(matches!(err, XmlWriteError::ModuleMounted(id) if id == "head"));
    }

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(xml_escape("a<b&c>\"d\""), "a&lt;b&amp;c&gt;&quot;d&quot;");
    }
}
