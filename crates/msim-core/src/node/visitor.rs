//! Visitor dispatch over the closed node kind set
//!
//! Two parallel traits, one mutating and one read-only. Every per-kind
//! method defaults to the required `visit_object` fallback, so a visitor
//! implements only the kinds it cares about while the dispatch in
//! `accept` stays exhaustive: a new kind fails to compile until every
//! match arm and trait method exists.
//!
//! `set_current_parent` is called by the tree walk before each node so
//! visitors that need the parent handle (simulation feedback, exporters)
//! can track it without their own traversal.

use uuid::Uuid;

use crate::node::{KinematicObject, NodeType};

/// Mutating visitor over kinematic objects
pub trait KinematicVisitor {
    /// Fallback for every kind without a dedicated override.
    fn visit_object(&mut self, node: &mut KinematicObject);

    /// Parent handle of the node about to be visited, `None` for roots.
    fn set_current_parent(&mut self, _parent: Option<Uuid>) {}

    fn visit_coordinate_transform(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_revolving_set(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_rotational_axis(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_translational_axis(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_work_piece(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_fixture(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_stock_geometry(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_initial_stock(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_tail_stock(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_wire_edm_head(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_mount_adapter(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_toolpath_geometry(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
    fn visit_held_tool(&mut self, node: &mut KinematicObject) {
        self.visit_object(node);
    }
}

/// Read-only visitor over kinematic objects
pub trait KinematicConstVisitor {
    /// Fallback for every kind without a dedicated override.
    fn visit_object(&mut self, node: &KinematicObject);

    /// Parent handle of the node about to be visited, `None` for roots.
    fn set_current_parent(&mut self, _parent: Option<Uuid>) {}

    fn visit_coordinate_transform(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_revolving_set(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_rotational_axis(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_translational_axis(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_work_piece(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_fixture(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_stock_geometry(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_initial_stock(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_tail_stock(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_wire_edm_head(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_mount_adapter(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_toolpath_geometry(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
    fn visit_held_tool(&mut self, node: &KinematicObject) {
        self.visit_object(node);
    }
}

impl KinematicObject {
    /// Dispatch to the visitor method matching this node's kind.
    pub fn accept(&mut self, visitor: &mut dyn KinematicVisitor) {
        match self.node_type() {
            NodeType::CoordinateTransform => visitor.visit_coordinate_transform(self),
            NodeType::RevolvingSet => visitor.visit_revolving_set(self),
            NodeType::RotationalAxis => visitor.visit_rotational_axis(self),
            NodeType::TranslationalAxis => visitor.visit_translational_axis(self),
            NodeType::WorkPiece => visitor.visit_work_piece(self),
            NodeType::Fixture => visitor.visit_fixture(self),
            NodeType::StockGeometry => visitor.visit_stock_geometry(self),
            NodeType::InitialStock => visitor.visit_initial_stock(self),
            NodeType::TailStock => visitor.visit_tail_stock(self),
            NodeType::WireEdmHead => visitor.visit_wire_edm_head(self),
            NodeType::MountAdapter => visitor.visit_mount_adapter(self),
            NodeType::ToolpathGeometry => visitor.visit_toolpath_geometry(self),
            NodeType::HeldTool => visitor.visit_held_tool(self),
        }
    }

    /// Dispatch to the read-only visitor method matching this node's kind.
    pub fn accept_const(&self, visitor: &mut dyn KinematicConstVisitor) {
        match self.node_type() {
            NodeType::CoordinateTransform => visitor.visit_coordinate_transform(self),
            NodeType::RevolvingSet => visitor.visit_revolving_set(self),
            NodeType::RotationalAxis => visitor.visit_rotational_axis(self),
            NodeType::TranslationalAxis => visitor.visit_translational_axis(self),
            NodeType::WorkPiece => visitor.visit_work_piece(self),
            NodeType::Fixture => visitor.visit_fixture(self),
            NodeType::StockGeometry => visitor.visit_stock_geometry(self),
            NodeType::InitialStock => visitor.visit_initial_stock(self),
            NodeType::TailStock => visitor.visit_tail_stock(self),
            NodeType::WireEdmHead => visitor.visit_wire_edm_head(self),
            NodeType::MountAdapter => visitor.visit_mount_adapter(self),
            NodeType::ToolpathGeometry => visitor.visit_toolpath_geometry(self),
            NodeType::HeldTool => visitor.visit_held_tool(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{AxisState, GeometryState};
    use crate::units::Units;
    use glam::DVec3;

    #[derive(Default)]
    struct NameCollector {
        axes: Vec<String>,
        others: Vec<String>,
    }

    impl KinematicConstVisitor for NameCollector {
        fn visit_object(&mut self, node: &KinematicObject) {
            self.others.push(node.name().to_string());
        }

        fn visit_rotational_axis(&mut self, node: &KinematicObject) {
            self.axes.push(node.name().to_string());
        }

        fn visit_translational_axis(&mut self, node: &KinematicObject) {
            self.axes.push(node.name().to_string());
        }
    }

    #[test]
    fn test_overridden_methods_bypass_fallback() {
        let transform = KinematicObject::coordinate_transform("base", Units::Metric);
        let axis = KinematicObject::rotational_axis("c", AxisState::new(DVec3::Z), Units::Metric);
        let fixture =
            KinematicObject::fixture("vise", GeometryState::new("vise.stl"), Units::Metric);

        let mut collector = NameCollector::default();
        transform.accept_const(&mut collector);
        axis.accept_const(&mut collector);
        fixture.accept_const(&mut collector);

        assert_eq!(collector.axes, vec!["c"]);
        assert_eq!(collector.others, vec!["base", "vise"]);
    }

    struct Renamer;

    impl KinematicVisitor for Renamer {
        fn visit_object(&mut self, _node: &mut KinematicObject) {}

        fn visit_work_piece(&mut self, node: &mut KinematicObject) {
            node.set_name("renamed");
        }
    }

    #[test]
    fn test_mutating_visitor_changes_only_matching_kind() {
        let mut part =
            KinematicObject::work_piece("part", GeometryState::new("part.stl"), Units::Metric);
        let mut table =
            KinematicObject::fixture("table", GeometryState::new("table.stl"), Units::Metric);

        let mut renamer = Renamer;
        part.accept(&mut renamer);
        table.accept(&mut renamer);

        assert_eq!(part.name(), "renamed");
        assert_eq!(table.name(), "table");
    }
}
