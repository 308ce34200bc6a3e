//! Geometry-carrying node state
//!
//! The model never inspects mesh data. Geometry nodes record the STL
//! filename they were defined with and optionally hold opaque handles to
//! the mesh and appearance objects a host loaded for them.

use crate::node::ExternalRef;

/// State shared by all polygonal geometry nodes
#[derive(Debug, Clone, Default)]
pub struct GeometryState {
    stl_filename: String,
    mesh: Option<ExternalRef>,
    appearance: Option<ExternalRef>,
}

impl GeometryState {
    pub fn new(stl_filename: impl Into<String>) -> Self {
        Self {
            stl_filename: stl_filename.into(),
            mesh: None,
            appearance: None,
        }
    }

    pub fn stl_filename(&self) -> &str {
        &self.stl_filename
    }

    pub fn set_stl_filename(&mut self, filename: impl Into<String>) {
        self.stl_filename = filename.into();
    }

    pub fn mesh(&self) -> Option<&ExternalRef> {
        self.mesh.as_ref()
    }

    pub fn set_mesh(&mut self, mesh: Option<ExternalRef>) {
        self.mesh = mesh;
    }

    pub fn appearance(&self) -> Option<&ExternalRef> {
        self.appearance.as_ref()
    }

    pub fn set_appearance(&mut self, appearance: Option<ExternalRef>) {
        self.appearance = appearance;
    }

    /// Copy without the heavy payloads (mesh handle, appearance, filename).
    pub(crate) fn clone_kinematic(&self) -> Self {
        Self::default()
    }
}

/// State of a tool held in a spindle or turret station
///
/// The tool definition itself belongs to the host; the model only keeps
/// an opaque handle plus per-part visibility used by simulation display.
#[derive(Debug, Clone)]
pub struct HeldToolState {
    geometry: GeometryState,
    tool: Option<ExternalRef>,
    holder_visible: bool,
    arbor_visible: bool,
    cutting_visible: bool,
    non_cutting_visible: bool,
}

impl Default for HeldToolState {
    fn default() -> Self {
        Self {
            geometry: GeometryState::default(),
            tool: None,
            holder_visible: true,
            arbor_visible: true,
            cutting_visible: true,
            non_cutting_visible: true,
        }
    }
}

impl HeldToolState {
    pub fn new(tool: Option<ExternalRef>) -> Self {
        Self {
            tool,
            ..Self::default()
        }
    }

    pub fn geometry(&self) -> &GeometryState {
        &self.geometry
    }

    pub fn geometry_mut(&mut self) -> &mut GeometryState {
        &mut self.geometry
    }

    pub fn tool(&self) -> Option<&ExternalRef> {
        self.tool.as_ref()
    }

    pub fn set_tool(&mut self, tool: Option<ExternalRef>) {
        self.tool = tool;
    }

    pub fn holder_visible(&self) -> bool {
        self.holder_visible
    }

    pub fn set_holder_visible(&mut self, visible: bool) {
        self.holder_visible = visible;
    }

    pub fn arbor_visible(&self) -> bool {
        self.arbor_visible
    }

    pub fn set_arbor_visible(&mut self, visible: bool) {
        self.arbor_visible = visible;
    }

    pub fn cutting_visible(&self) -> bool {
        self.cutting_visible
    }

    pub fn set_cutting_visible(&mut self, visible: bool) {
        self.cutting_visible = visible;
    }

    pub fn non_cutting_visible(&self) -> bool {
        self.non_cutting_visible
    }

    pub fn set_non_cutting_visible(&mut self, visible: bool) {
        self.non_cutting_visible = visible;
    }

    /// Copy keeping the tool handle but dropping display payloads.
    pub(crate) fn clone_kinematic(&self) -> Self {
        Self {
            geometry: self.geometry.clone_kinematic(),
            tool: self.tool.clone(),
            holder_visible: self.holder_visible,
            arbor_visible: self.arbor_visible,
            cutting_visible: self.cutting_visible,
            non_cutting_visible: self.non_cutting_visible,
        }
    }
}
