//! Kinematic objects
//!
//! A `KinematicObject` is one node of a machine's kinematic tree: a name,
//! a unit of measure, a local matrix, the propagated node-to-root matrix
//! and one of thirteen concrete kinds. The kind set is closed; both the
//! visitor traits and the dispatch in [`visitor`] match it exhaustively,
//! so adding a kind is a compile-time event for every consumer.

pub mod axis;
pub mod geometry;
pub mod visitor;

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use glam::DMat4;
use serde::{Deserialize, Serialize};

use crate::units::Units;

pub use axis::{AxisError, AxisState};
pub use geometry::{GeometryState, HeldToolState};

/// Opaque shared handle to host-owned data (mesh, appearance, tool
/// definition, simulator proxy). The model never inspects the payload.
#[derive(Clone)]
pub struct ExternalRef(Arc<dyn Any + Send + Sync>);

impl ExternalRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the payload back as its concrete type, if it matches.
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Whether two handles share the same payload.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExternalRef(..)")
    }
}

/// Kind tag for a kinematic object, one per concrete variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    CoordinateTransform,
    RevolvingSet,
    RotationalAxis,
    TranslationalAxis,
    WorkPiece,
    Fixture,
    StockGeometry,
    InitialStock,
    TailStock,
    WireEdmHead,
    MountAdapter,
    ToolpathGeometry,
    HeldTool,
}

impl NodeType {
    /// The XML element tag this node type is persisted as.
    pub fn xml_tag(&self) -> &'static str {
        match self {
            Self::CoordinateTransform => "coordinate_transform",
            Self::RevolvingSet => "revolving_set",
            Self::RotationalAxis => "rotational_axis",
            Self::TranslationalAxis => "translational_axis",
            Self::WorkPiece => "work_piece",
            Self::Fixture => "fixture",
            Self::StockGeometry => "stock_geometry",
            Self::InitialStock => "initial_stock",
            Self::TailStock => "tail_stock",
            Self::WireEdmHead => "wire_edm_head",
            Self::MountAdapter => "mount_adapter",
            Self::ToolpathGeometry => "toolpath_geometry",
            Self::HeldTool => "held_tool",
        }
    }

    /// Whether this type may carry children in a kinematic tree.
    pub fn can_have_children(&self) -> bool {
        matches!(
            self,
            Self::CoordinateTransform
                | Self::RevolvingSet
                | Self::RotationalAxis
                | Self::TranslationalAxis
        )
    }

    pub fn is_axis(&self) -> bool {
        matches!(self, Self::RotationalAxis | Self::TranslationalAxis)
    }

    pub fn is_geometry(&self) -> bool {
        matches!(
            self,
            Self::WorkPiece
                | Self::Fixture
                | Self::StockGeometry
                | Self::InitialStock
                | Self::TailStock
                | Self::WireEdmHead
                | Self::MountAdapter
                | Self::ToolpathGeometry
                | Self::HeldTool
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.xml_tag())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinate_transform" => Ok(Self::CoordinateTransform),
            "revolving_set" => Ok(Self::RevolvingSet),
            "rotational_axis" => Ok(Self::RotationalAxis),
            "translational_axis" => Ok(Self::TranslationalAxis),
            "work_piece" => Ok(Self::WorkPiece),
            "fixture" => Ok(Self::Fixture),
            "stock_geometry" => Ok(Self::StockGeometry),
            "initial_stock" => Ok(Self::InitialStock),
            "tail_stock" => Ok(Self::TailStock),
            "wire_edm_head" => Ok(Self::WireEdmHead),
            "mount_adapter" => Ok(Self::MountAdapter),
            "toolpath_geometry" => Ok(Self::ToolpathGeometry),
            "held_tool" => Ok(Self::HeldTool),
            _ => Err(format!("Unknown node type: {}", s)),
        }
    }
}

/// Baseline state of a pure transform node
#[derive(Debug, Clone, PartialEq)]
pub struct TransformState {
    initial_matrix: DMat4,
}

impl Default for TransformState {
    fn default() -> Self {
        Self {
            initial_matrix: DMat4::IDENTITY,
        }
    }
}

impl TransformState {
    pub fn initial_matrix(&self) -> DMat4 {
        self.initial_matrix
    }

    pub fn set_initial_matrix(&mut self, matrix: DMat4) {
        self.initial_matrix = matrix;
    }
}

/// Closed set of concrete kinematic object kinds
#[derive(Debug, Clone)]
pub enum NodeKind {
    CoordinateTransform(TransformState),
    RevolvingSet(TransformState),
    RotationalAxis(AxisState),
    TranslationalAxis(AxisState),
    WorkPiece(GeometryState),
    Fixture(GeometryState),
    StockGeometry(GeometryState),
    InitialStock(GeometryState),
    TailStock(GeometryState),
    WireEdmHead(GeometryState),
    MountAdapter(GeometryState),
    ToolpathGeometry(GeometryState),
    HeldTool(HeldToolState),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            Self::CoordinateTransform(_) => NodeType::CoordinateTransform,
            Self::RevolvingSet(_) => NodeType::RevolvingSet,
            Self::RotationalAxis(_) => NodeType::RotationalAxis,
            Self::TranslationalAxis(_) => NodeType::TranslationalAxis,
            Self::WorkPiece(_) => NodeType::WorkPiece,
            Self::Fixture(_) => NodeType::Fixture,
            Self::StockGeometry(_) => NodeType::StockGeometry,
            Self::InitialStock(_) => NodeType::InitialStock,
            Self::TailStock(_) => NodeType::TailStock,
            Self::WireEdmHead(_) => NodeType::WireEdmHead,
            Self::MountAdapter(_) => NodeType::MountAdapter,
            Self::ToolpathGeometry(_) => NodeType::ToolpathGeometry,
            Self::HeldTool(_) => NodeType::HeldTool,
        }
    }
}

/// One node of a kinematic tree
#[derive(Debug, Clone)]
pub struct KinematicObject {
    name: String,
    units: Units,
    local_matrix: DMat4,
    propagated_matrix: DMat4,
    proxy: Option<ExternalRef>,
    kind: NodeKind,
}

impl KinematicObject {
    fn new(name: impl Into<String>, units: Units, kind: NodeKind) -> Self {
        let local_matrix = match &kind {
            NodeKind::RotationalAxis(axis) => axis.value_matrix(true),
            NodeKind::TranslationalAxis(axis) => axis.value_matrix(false),
            _ => DMat4::IDENTITY,
        };
        Self {
            name: name.into(),
            units,
            local_matrix,
            propagated_matrix: local_matrix,
            proxy: None,
            kind,
        }
    }

    pub fn coordinate_transform(name: impl Into<String>, units: Units) -> Self {
        Self::new(
            name,
            units,
            NodeKind::CoordinateTransform(TransformState::default()),
        )
    }

    pub fn revolving_set(name: impl Into<String>, units: Units) -> Self {
        Self::new(name, units, NodeKind::RevolvingSet(TransformState::default()))
    }

    pub fn rotational_axis(name: impl Into<String>, axis: AxisState, units: Units) -> Self {
        Self::new(name, units, NodeKind::RotationalAxis(axis))
    }

    pub fn translational_axis(name: impl Into<String>, axis: AxisState, units: Units) -> Self {
        Self::new(name, units, NodeKind::TranslationalAxis(axis))
    }

    pub fn work_piece(name: impl Into<String>, geometry: GeometryState, units: Units) -> Self {
        Self::new(name, units, NodeKind::WorkPiece(geometry))
    }

    pub fn fixture(name: impl Into<String>, geometry: GeometryState, units: Units) -> Self {
        Self::new(name, units, NodeKind::Fixture(geometry))
    }

    pub fn stock_geometry(name: impl Into<String>, geometry: GeometryState, units: Units) -> Self {
        Self::new(name, units, NodeKind::StockGeometry(geometry))
    }

    pub fn initial_stock(name: impl Into<String>, geometry: GeometryState, units: Units) -> Self {
        Self::new(name, units, NodeKind::InitialStock(geometry))
    }

    pub fn tail_stock(name: impl Into<String>, geometry: GeometryState, units: Units) -> Self {
        Self::new(name, units, NodeKind::TailStock(geometry))
    }

    pub fn wire_edm_head(name: impl Into<String>, geometry: GeometryState, units: Units) -> Self {
        Self::new(name, units, NodeKind::WireEdmHead(geometry))
    }

    pub fn mount_adapter(name: impl Into<String>, geometry: GeometryState, units: Units) -> Self {
        Self::new(name, units, NodeKind::MountAdapter(geometry))
    }

    pub fn toolpath_geometry(
        name: impl Into<String>,
        geometry: GeometryState,
        units: Units,
    ) -> Self {
        Self::new(name, units, NodeKind::ToolpathGeometry(geometry))
    }

    pub fn held_tool(name: impl Into<String>, tool: HeldToolState, units: Units) -> Self {
        Self::new(name, units, NodeKind::HeldTool(tool))
    }

    pub fn with_local_matrix(mut self, matrix: DMat4) -> Self {
        self.local_matrix = matrix;
        self.propagated_matrix = matrix;
        if let NodeKind::CoordinateTransform(t) | NodeKind::RevolvingSet(t) = &mut self.kind {
            t.set_initial_matrix(matrix);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn local_matrix(&self) -> DMat4 {
        self.local_matrix
    }

    /// The node-to-root matrix as of the last propagation pass.
    pub fn propagated_matrix(&self) -> DMat4 {
        self.propagated_matrix
    }

    pub(crate) fn set_local_matrix(&mut self, matrix: DMat4) {
        self.local_matrix = matrix;
    }

    /// Make `matrix` the reset baseline of a transform node.
    pub(crate) fn set_initial_matrix(&mut self, matrix: DMat4) {
        if let NodeKind::CoordinateTransform(t) | NodeKind::RevolvingSet(t) = &mut self.kind {
            t.set_initial_matrix(matrix);
        }
    }

    pub(crate) fn set_propagated_matrix(&mut self, matrix: DMat4) {
        self.propagated_matrix = matrix;
    }

    pub fn proxy(&self) -> Option<&ExternalRef> {
        self.proxy.as_ref()
    }

    pub fn set_proxy(&mut self, proxy: Option<ExternalRef>) {
        self.proxy = proxy;
    }

    pub fn is_axis(&self) -> bool {
        self.node_type().is_axis()
    }

    pub fn can_have_children(&self) -> bool {
        self.node_type().can_have_children()
    }

    pub fn transform_state(&self) -> Option<&TransformState> {
        match &self.kind {
            NodeKind::CoordinateTransform(t) | NodeKind::RevolvingSet(t) => Some(t),
            _ => None,
        }
    }

    pub fn axis_state(&self) -> Option<&AxisState> {
        match &self.kind {
            NodeKind::RotationalAxis(a) | NodeKind::TranslationalAxis(a) => Some(a),
            _ => None,
        }
    }

    pub fn geometry_state(&self) -> Option<&GeometryState> {
        match &self.kind {
            NodeKind::WorkPiece(g)
            | NodeKind::Fixture(g)
            | NodeKind::StockGeometry(g)
            | NodeKind::InitialStock(g)
            | NodeKind::TailStock(g)
            | NodeKind::WireEdmHead(g)
            | NodeKind::MountAdapter(g)
            | NodeKind::ToolpathGeometry(g) => Some(g),
            NodeKind::HeldTool(t) => Some(t.geometry()),
            _ => None,
        }
    }

    pub fn geometry_state_mut(&mut self) -> Option<&mut GeometryState> {
        match &mut self.kind {
            NodeKind::WorkPiece(g)
            | NodeKind::Fixture(g)
            | NodeKind::StockGeometry(g)
            | NodeKind::InitialStock(g)
            | NodeKind::TailStock(g)
            | NodeKind::WireEdmHead(g)
            | NodeKind::MountAdapter(g)
            | NodeKind::ToolpathGeometry(g) => Some(g),
            NodeKind::HeldTool(t) => Some(t.geometry_mut()),
            _ => None,
        }
    }

    pub fn held_tool_state(&self) -> Option<&HeldToolState> {
        match &self.kind {
            NodeKind::HeldTool(t) => Some(t),
            _ => None,
        }
    }

    pub fn held_tool_state_mut(&mut self) -> Option<&mut HeldToolState> {
        match &mut self.kind {
            NodeKind::HeldTool(t) => Some(t),
            _ => None,
        }
    }

    /// Drive an axis node and refresh its local matrix.
    ///
    /// Callers check `is_axis()` first; non-axis nodes are left alone.
    pub(crate) fn apply_axis_value(&mut self, value: f64) -> Result<(), AxisError> {
        match &mut self.kind {
            NodeKind::RotationalAxis(axis) => {
                axis.set_value(value)?;
                self.local_matrix = axis.value_matrix(true);
            }
            NodeKind::TranslationalAxis(axis) => {
                axis.set_value(value)?;
                self.local_matrix = axis.value_matrix(false);
            }
            _ => {}
        }
        Ok(())
    }

    /// Restore the baseline local state of this node.
    pub(crate) fn reset_to_initial(&mut self) {
        match &mut self.kind {
            NodeKind::CoordinateTransform(t) | NodeKind::RevolvingSet(t) => {
                self.local_matrix = t.initial_matrix();
            }
            NodeKind::RotationalAxis(axis) => {
                axis.reset();
                self.local_matrix = axis.value_matrix(true);
            }
            NodeKind::TranslationalAxis(axis) => {
                axis.reset();
                self.local_matrix = axis.value_matrix(false);
            }
            _ => {}
        }
    }

    /// Convert every length-valued field of this node to `target` units.
    ///
    /// Translation components of matrices scale; rotational angles do not.
    /// Mesh payloads are host-owned and are not touched here.
    pub(crate) fn scale(&mut self, target: Units) {
        let factor = self.units.scale_factor_to(target);
        self.units = target;
        if factor == 1.0 {
            return;
        }
        scale_matrix_translation(&mut self.local_matrix, factor);
        scale_matrix_translation(&mut self.propagated_matrix, factor);
        match &mut self.kind {
            NodeKind::CoordinateTransform(t) | NodeKind::RevolvingSet(t) => {
                let mut m = t.initial_matrix();
                scale_matrix_translation(&mut m, factor);
                t.set_initial_matrix(m);
            }
            NodeKind::RotationalAxis(axis) => axis.scale_rotational(factor),
            NodeKind::TranslationalAxis(axis) => axis.scale_translational(factor),
            _ => {}
        }
    }

    /// Deep copy; with `just_kinematic_relevant_info` the heavy display
    /// payloads (mesh and appearance handles, STL filenames, proxies) are
    /// dropped while the kinematic state is kept intact.
    pub fn clone_node(&self, just_kinematic_relevant_info: bool) -> Self {
        if !just_kinematic_relevant_info {
            return self.clone();
        }
        let kind = match &self.kind {
            NodeKind::CoordinateTransform(t) => NodeKind::CoordinateTransform(t.clone()),
            NodeKind::RevolvingSet(t) => NodeKind::RevolvingSet(t.clone()),
            NodeKind::RotationalAxis(a) => NodeKind::RotationalAxis(a.clone()),
            NodeKind::TranslationalAxis(a) => NodeKind::TranslationalAxis(a.clone()),
            NodeKind::WorkPiece(g) => NodeKind::WorkPiece(g.clone_kinematic()),
            NodeKind::Fixture(g) => NodeKind::Fixture(g.clone_kinematic()),
            NodeKind::StockGeometry(g) => NodeKind::StockGeometry(g.clone_kinematic()),
            NodeKind::InitialStock(g) => NodeKind::InitialStock(g.clone_kinematic()),
            NodeKind::TailStock(g) => NodeKind::TailStock(g.clone_kinematic()),
            NodeKind::WireEdmHead(g) => NodeKind::WireEdmHead(g.clone_kinematic()),
            NodeKind::MountAdapter(g) => NodeKind::MountAdapter(g.clone_kinematic()),
            NodeKind::ToolpathGeometry(g) => NodeKind::ToolpathGeometry(g.clone_kinematic()),
            NodeKind::HeldTool(t) => NodeKind::HeldTool(t.clone_kinematic()),
        };
        Self {
            name: self.name.clone(),
            units: self.units,
            local_matrix: self.local_matrix,
            propagated_matrix: self.propagated_matrix,
            proxy: None,
            kind,
        }
    }
}

/// Multiply the translation column of `m` by `factor` in place.
pub(crate) fn scale_matrix_translation(m: &mut DMat4, factor: f64) {
    m.w_axis.x *= factor;
    m.w_axis.y *= factor;
    m.w_axis.z *= factor;
}
