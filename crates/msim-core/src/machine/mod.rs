//! Machine definition
//!
//! `MachineDefinition` aggregates the primary kinematic tree, the
//! magazine of mountable modules, the collision check map and the
//! preprocessor list, together with machine metadata. A global registry
//! maps every object id to its tree and handle; object ids are unique
//! across the primary tree and all magazine modules.

pub mod collision;
pub mod preprocessor;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use glam::DMat4;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::node::visitor::{KinematicConstVisitor, KinematicVisitor};
use crate::node::{scale_matrix_translation, KinematicObject, NodeType};
use crate::tree::{KinematicTree, SceneChange, TreeError};
use crate::units::Units;

pub use collision::{CollisionPair, ObjectGroup};
pub use preprocessor::{Preprocessor, PreprocessorKind};

/// Errors from machine-level operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MachineError {
    #[error("an object with id '{0}' is already defined in the machine")]
    DuplicateObjectId(String),
    #[error("object '{0}' was not found")]
    ObjectNotFound(String),
    #[error("no {kind} sibling found for '{name}'")]
    SiblingNotFound { kind: NodeType, name: String },
    #[error("object '{name}' is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },
    #[error("kinematic module '{0}' was not found")]
    UnknownModule(String),
    #[error("a kinematic module named '{0}' already exists")]
    DuplicateModule(String),
    #[error("kinematic module '{0}' is currently mounted")]
    ModuleMounted(String),
    #[error("kinematic module '{0}' is not mounted")]
    ModuleNotMounted(String),
    #[error("mount target '{0}' is not a transform")]
    MountTargetNotTransform(String),
    #[error("collision group '{group}' references unknown object '{object}'")]
    CollisionReference { group: String, object: String },
    #[error("a collision check named '{0}' already exists")]
    DuplicateCollisionCheck(String),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Where an object id lives: which tree, under which handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub node_type: NodeType,
    /// `None` for the primary tree, module id for a magazine tree.
    pub tree_id: Option<String>,
    pub handle: Uuid,
}

#[derive(Debug, Clone)]
struct MountRecord {
    transform: String,
    root_names: Vec<String>,
}

/// A mountable sub-machine kept in the magazine
#[derive(Debug, Clone, Default)]
pub struct KinematicModule {
    tree: KinematicTree,
    mount: Option<MountRecord>,
}

impl KinematicModule {
    pub fn tree(&self) -> &KinematicTree {
        &self.tree
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_some()
    }

    /// Name of the transform this module is mounted on, if any.
    pub fn mounted_at(&self) -> Option<&str> {
        self.mount.as_ref().map(|m| m.transform.as_str())
    }
}

/// The complete kinematic model of one machine
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    machine_name: String,
    controller_name: String,
    units: Units,
    view_transform: DMat4,
    xml_version: f32,
    write_stl: bool,
    tree: KinematicTree,
    magazine: BTreeMap<String, KinematicModule>,
    registry: HashMap<String, RegistryEntry>,
    collision_checks: BTreeMap<String, CollisionPair>,
    preprocessors: Vec<Preprocessor>,
    file_dependencies: Vec<PathBuf>,
}

impl Default for MachineDefinition {
    fn default() -> Self {
        Self::new(Units::Metric)
    }
}

impl MachineDefinition {
    pub fn new(units: Units) -> Self {
        Self {
            machine_name: String::new(),
            controller_name: String::new(),
            units,
            view_transform: DMat4::IDENTITY,
            xml_version: crate::io::xml::CURRENT_XML_VERSION,
            write_stl: false,
            tree: KinematicTree::new(),
            magazine: BTreeMap::new(),
            registry: HashMap::new(),
            collision_checks: BTreeMap::new(),
            preprocessors: Vec::new(),
            file_dependencies: Vec::new(),
        }
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    pub fn set_machine_name(&mut self, name: impl Into<String>) {
        self.machine_name = name.into();
    }

    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    pub fn set_controller_name(&mut self, name: impl Into<String>) {
        self.controller_name = name.into();
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn view_transform(&self) -> DMat4 {
        self.view_transform
    }

    pub fn set_view_transform(&mut self, matrix: DMat4) {
        self.view_transform = matrix;
    }

    /// Schema version of the file this machine was loaded from.
    pub fn xml_version(&self) -> f32 {
        self.xml_version
    }

    pub(crate) fn set_xml_version(&mut self, version: f32) {
        self.xml_version = version;
    }

    pub fn write_stl(&self) -> bool {
        self.write_stl
    }

    pub fn set_write_stl(&mut self, write_stl: bool) {
        self.write_stl = write_stl;
    }

    pub fn file_dependencies(&self) -> &[PathBuf] {
        &self.file_dependencies
    }

    pub fn add_file_dependency(&mut self, path: PathBuf) {
        if !self.file_dependencies.contains(&path) {
            self.file_dependencies.push(path);
        }
    }

    pub fn primary_tree(&self) -> &KinematicTree {
        &self.tree
    }

    pub fn magazine(&self) -> &BTreeMap<String, KinematicModule> {
        &self.magazine
    }

    pub fn kinematic_module(&self, module_id: &str) -> Option<&KinematicModule> {
        self.magazine.get(module_id)
    }

    pub fn registry_entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.registry.get(name)
    }

    fn tree_ref(&self, tree_id: Option<&str>) -> Result<&KinematicTree, MachineError> {
        match tree_id {
            None => Ok(&self.tree),
            Some(id) => self
                .magazine
                .get(id)
                .map(|m| &m.tree)
                .ok_or_else(|| MachineError::UnknownModule(id.to_string())),
        }
    }

    fn tree_mut(&mut self, tree_id: Option<&str>) -> Result<&mut KinematicTree, MachineError> {
        match tree_id {
            None => Ok(&mut self.tree),
            Some(id) => {
                let module = self
                    .magazine
                    .get_mut(id)
                    .ok_or_else(|| MachineError::UnknownModule(id.to_string()))?;
                if module.mount.is_some() {
                    return Err(MachineError::ModuleMounted(id.to_string()));
                }
                Ok(&mut module.tree)
            }
        }
    }

    /// Add an object to the primary tree (`tree_id` `None`) or a magazine
    /// module, as last child of `parent`. The object id must be unique
    /// across the whole machine, magazine included.
    pub fn add_object(
        &mut self,
        node: KinematicObject,
        parent: Option<&str>,
        tree_id: Option<&str>,
    ) -> Result<Uuid, MachineError> {
        let name = node.name().to_string();
        if self.registry.contains_key(&name) {
            return Err(MachineError::DuplicateObjectId(name));
        }
        let node_type = node.node_type();
        let owned_tree_id = tree_id.map(str::to_string);
        let tree = self.tree_mut(tree_id)?;
        let parent_handle = match parent {
            Some(p) => Some(
                tree.find_by_name(p)
                    .ok_or_else(|| MachineError::ObjectNotFound(p.to_string()))?,
            ),
            None => None,
        };
        let handle = tree.insert_object(node, parent_handle)?;
        self.registry.insert(
            name,
            RegistryEntry {
                node_type,
                tree_id: owned_tree_id,
                handle,
            },
        );
        Ok(handle)
    }

    /// Remove an object and its subtree; registry entries and collision
    /// group memberships of all removed objects go with it.
    pub fn remove_object(&mut self, name: &str, tree_id: Option<&str>) -> Result<(), MachineError> {
        let tree = self.tree_mut(tree_id)?;
        let handle = tree
            .find_by_name(name)
            .ok_or_else(|| MachineError::ObjectNotFound(name.to_string()))?;
        let removed: Vec<String> = tree
            .subtree_ids(handle)
            .iter()
            .filter_map(|id| tree.get(*id).map(|n| n.name().to_string()))
            .collect();
        tree.remove_object(handle);
        for removed_name in &removed {
            self.registry.remove(removed_name);
            for pair in self.collision_checks.values_mut() {
                pair.prune_member(removed_name);
            }
        }
        Ok(())
    }

    pub fn add_kinematic_module(&mut self, module_id: &str) -> Result<(), MachineError> {
        if self.magazine.contains_key(module_id) {
            return Err(MachineError::DuplicateModule(module_id.to_string()));
        }
        self.magazine
            .insert(module_id.to_string(), KinematicModule::default());
        Ok(())
    }

    /// Remove a stand-alone module and all its objects from scope.
    pub fn remove_kinematic_module(&mut self, module_id: &str) -> Result<(), MachineError> {
        let module = self
            .magazine
            .get(module_id)
            .ok_or_else(|| MachineError::UnknownModule(module_id.to_string()))?;
        if module.mount.is_some() {
            return Err(MachineError::ModuleMounted(module_id.to_string()));
        }
        let names: Vec<String> = module
            .tree
            .iter()
            .map(|(_, n)| n.name().to_string())
            .collect();
        self.magazine.remove(module_id);
        for name in &names {
            self.registry.remove(name);
            for pair in self.collision_checks.values_mut() {
                pair.prune_member(name);
            }
        }
        Ok(())
    }

    /// Graft a module's trees under the named transform of the primary
    /// tree. The module stays listed in the magazine, marked mounted, and
    /// its objects become addressable as primary-tree objects.
    pub fn mount_kinematic_module(
        &mut self,
        transform_name: &str,
        module_id: &str,
    ) -> Result<(), MachineError> {
        let target = self
            .tree
            .find_by_name(transform_name)
            .ok_or_else(|| MachineError::ObjectNotFound(transform_name.to_string()))?;
        let target_ok = self
            .tree
            .get(target)
            .map(|n| n.can_have_children())
            .unwrap_or(false);
        if !target_ok {
            return Err(MachineError::MountTargetNotTransform(
                transform_name.to_string(),
            ));
        }
        let module = self
            .magazine
            .get_mut(module_id)
            .ok_or_else(|| MachineError::UnknownModule(module_id.to_string()))?;
        if module.mount.is_some() {
            return Err(MachineError::ModuleMounted(module_id.to_string()));
        }
        let mut module_tree = std::mem::take(&mut module.tree);
        let root_names: Vec<String> = module_tree
            .roots()
            .iter()
            .filter_map(|r| module_tree.get(*r).map(|n| n.name().to_string()))
            .collect();
        let member_names: Vec<String> = module_tree
            .iter()
            .map(|(_, n)| n.name().to_string())
            .collect();
        debug!(module = module_id, target = transform_name, "mounting kinematic module");

        let was_repositioning = self.tree.repositioning_mode();
        self.tree.set_repositioning_mode(true);
        for root in module_tree.roots().to_vec() {
            // Ids are globally unique and the target was validated, so
            // adoption cannot fail here.
            if let Err(err) = self.tree.adopt_subtree(&mut module_tree, root, Some(target)) {
                warn!(module = module_id, error = %err, "module subtree adoption failed");
            }
        }
        self.tree.set_repositioning_mode(was_repositioning);

        for name in &member_names {
            if let Some(entry) = self.registry.get_mut(name) {
                entry.tree_id = None;
            }
        }
        if let Some(module) = self.magazine.get_mut(module_id) {
            module.mount = Some(MountRecord {
                transform: transform_name.to_string(),
                root_names,
            });
        }
        Ok(())
    }

    /// Detach a mounted module from the primary tree and restore it to
    /// its stand-alone magazine state.
    pub fn unmount_kinematic_module(&mut self, module_id: &str) -> Result<(), MachineError> {
        let module = self
            .magazine
            .get_mut(module_id)
            .ok_or_else(|| MachineError::UnknownModule(module_id.to_string()))?;
        let record = module
            .mount
            .take()
            .ok_or_else(|| MachineError::ModuleNotMounted(module_id.to_string()))?;
        let mut module_tree = std::mem::take(&mut module.tree);
        debug!(module = module_id, "unmounting kinematic module");

        let was_repositioning = self.tree.repositioning_mode();
        self.tree.set_repositioning_mode(true);
        module_tree.set_repositioning_mode(true);
        for root_name in &record.root_names {
            match self.tree.find_by_name(root_name) {
                Some(handle) => {
                    if let Err(err) = module_tree.adopt_subtree(&mut self.tree, handle, None) {
                        warn!(module = module_id, error = %err, "module root detach failed");
                    }
                }
                None => warn!(module = module_id, root = root_name.as_str(), "module root vanished"),
            }
        }
        self.tree.set_repositioning_mode(was_repositioning);
        module_tree.set_repositioning_mode(false);

        let member_names: Vec<String> = module_tree
            .iter()
            .map(|(_, n)| n.name().to_string())
            .collect();
        for name in &member_names {
            if let Some(entry) = self.registry.get_mut(name) {
                entry.tree_id = Some(module_id.to_string());
            }
        }
        if let Some(module) = self.magazine.get_mut(module_id) {
            module.tree = module_tree;
        }
        Ok(())
    }

    /// Look an object up; `tree_id` `None` searches the whole machine.
    pub fn find_object_by_name(
        &self,
        name: &str,
        tree_id: Option<&str>,
    ) -> Option<&KinematicObject> {
        match tree_id {
            Some(_) => {
                let tree = self.tree_ref(tree_id).ok()?;
                tree.find_by_name(name).and_then(|h| tree.get(h))
            }
            None => {
                let entry = self.registry.get(name)?;
                let tree = self.tree_ref(entry.tree_id.as_deref()).ok()?;
                tree.get(entry.handle)
            }
        }
    }

    pub fn get_object_by_name(
        &self,
        name: &str,
        tree_id: Option<&str>,
    ) -> Result<&KinematicObject, MachineError> {
        self.find_object_by_name(name, tree_id)
            .ok_or_else(|| MachineError::ObjectNotFound(name.to_string()))
    }

    pub fn get_axis_by_name(&self, name: &str) -> Result<&KinematicObject, MachineError> {
        let node = self.get_object_by_name(name, None)?;
        if !node.is_axis() {
            return Err(MachineError::TypeMismatch {
                name: name.to_string(),
                expected: "axis",
            });
        }
        Ok(node)
    }

    pub fn get_transform_by_name(&self, name: &str) -> Result<&KinematicObject, MachineError> {
        let node = self.get_object_by_name(name, None)?;
        if !node.can_have_children() {
            return Err(MachineError::TypeMismatch {
                name: name.to_string(),
                expected: "transform",
            });
        }
        Ok(node)
    }

    pub fn get_workpiece(&self, name: &str) -> Result<&KinematicObject, MachineError> {
        let node = self.get_object_by_name(name, None)?;
        if node.node_type() != NodeType::WorkPiece {
            return Err(MachineError::TypeMismatch {
                name: name.to_string(),
                expected: "work piece",
            });
        }
        Ok(node)
    }

    fn sibling_of_type(
        &self,
        name: &str,
        kind: NodeType,
    ) -> Result<&KinematicObject, MachineError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| MachineError::ObjectNotFound(name.to_string()))?;
        let tree = self.tree_ref(entry.tree_id.as_deref())?;
        let siblings = match tree.parent(entry.handle) {
            Some(p) => tree.children(p),
            None => tree.roots(),
        };
        siblings
            .iter()
            .filter(|s| **s != entry.handle)
            .filter_map(|s| tree.get(*s))
            .find(|n| n.node_type() == kind)
            .ok_or_else(|| MachineError::SiblingNotFound {
                kind,
                name: name.to_string(),
            })
    }

    /// The stock geometry mounted next to the given workpiece.
    pub fn get_stock(&self, workpiece_name: &str) -> Result<&KinematicObject, MachineError> {
        self.sibling_of_type(workpiece_name, NodeType::StockGeometry)
    }

    /// The initial stock snapshot next to the given stock geometry.
    pub fn get_initial_stock(&self, stock_name: &str) -> Result<&KinematicObject, MachineError> {
        self.sibling_of_type(stock_name, NodeType::InitialStock)
    }

    /// First object of `node_type` in tree order, whole tree.
    pub fn first_object_of_type(
        &self,
        tree_id: Option<&str>,
        node_type: NodeType,
    ) -> Option<String> {
        let tree = self.tree_ref(tree_id).ok()?;
        for root in tree.roots() {
            for id in tree.subtree_ids(*root) {
                if let Some(node) = tree.get(id) {
                    if node.node_type() == node_type {
                        return Some(node.name().to_string());
                    }
                }
            }
        }
        None
    }

    /// First object of `node_type` strictly below the named parent.
    pub fn first_object_of_type_under(
        &self,
        parent_name: &str,
        tree_id: Option<&str>,
        node_type: NodeType,
    ) -> Option<String> {
        let tree = self.tree_ref(tree_id).ok()?;
        let parent = tree.find_by_name(parent_name)?;
        tree.subtree_ids(parent)
            .into_iter()
            .filter(|id| *id != parent)
            .filter_map(|id| tree.get(id))
            .find(|n| n.node_type() == node_type)
            .map(|n| n.name().to_string())
    }

    /// Which magazine module holds this object, if it is not in the
    /// primary tree.
    pub fn kinematic_module_containing(&self, name: &str) -> Option<&str> {
        self.registry.get(name)?.tree_id.as_deref()
    }

    pub fn is_object_defined(&self, name: &str, tree_id: Option<&str>) -> bool {
        self.tree_ref(tree_id)
            .map(|t| t.find_by_name(name).is_some())
            .unwrap_or(false)
    }

    pub fn is_object_defined_in_any_tree(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    pub fn is_object_defined_only_in_magazine(&self, name: &str) -> bool {
        self.registry
            .get(name)
            .map(|e| e.tree_id.is_some())
            .unwrap_or(false)
    }

    /// Drive an axis anywhere in the machine by object id.
    pub fn set_axis_value(&mut self, name: &str, value: f64) -> Result<(), MachineError> {
        let (tree_id, handle) = self.locate(name)?;
        let tree = self.tree_mut(tree_id.as_deref())?;
        tree.set_axis_value(handle, value)?;
        Ok(())
    }

    /// Replace the local matrix of any object and propagate.
    pub fn set_coordinate_system(
        &mut self,
        name: &str,
        matrix: DMat4,
    ) -> Result<(), MachineError> {
        let (tree_id, handle) = self.locate(name)?;
        let tree = self.tree_mut(tree_id.as_deref())?;
        tree.set_coordinate_system(handle, matrix)?;
        Ok(())
    }

    /// Install a loaded matrix as both the current local matrix and the
    /// reset baseline of a transform node.
    pub(crate) fn set_initial_coordinate_system(
        &mut self,
        name: &str,
        matrix: DMat4,
    ) -> Result<(), MachineError> {
        let (tree_id, handle) = self.locate(name)?;
        let tree = self.tree_mut(tree_id.as_deref())?;
        if let Some(node) = tree.get_mut(handle) {
            node.set_initial_matrix(matrix);
        }
        tree.set_coordinate_system(handle, matrix)?;
        Ok(())
    }

    fn locate(&self, name: &str) -> Result<(Option<String>, Uuid), MachineError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| MachineError::ObjectNotFound(name.to_string()))?;
        Ok((entry.tree_id.clone(), entry.handle))
    }

    /// Scene-change ledger of the primary tree.
    pub fn scene_changes(&self) -> &HashMap<Uuid, SceneChange> {
        self.tree.scene_changes()
    }

    pub fn reset_scene_change(&mut self) {
        self.tree.reset_scene_change();
    }

    /// Clear the ledger of the primary tree and every magazine module.
    pub(crate) fn reset_all_scene_changes(&mut self) {
        self.tree.reset_scene_change();
        for module in self.magazine.values_mut() {
            module.tree.reset_scene_change();
        }
    }

    pub fn enable_matrix_change_feedback(&mut self, enabled: bool) {
        self.tree.enable_matrix_change_feedback(enabled);
    }

    pub fn toggle_repositioning_mode(&mut self) {
        self.tree.toggle_repositioning_mode();
    }

    /// Restore every tree to its initial positions.
    pub fn reset_positions(&mut self) {
        self.tree.reset_positions();
        for module in self.magazine.values_mut() {
            module.tree.reset_positions();
        }
    }

    /// Register a collision check. Unless `do_not_verify` is set, every
    /// object id referenced by either group must exist somewhere in the
    /// machine.
    pub fn add_coll_check(
        &mut self,
        pair: CollisionPair,
        do_not_verify: bool,
    ) -> Result<(), MachineError> {
        if self.collision_checks.contains_key(pair.name()) {
            return Err(MachineError::DuplicateCollisionCheck(pair.name().to_string()));
        }
        if !do_not_verify {
            for group in [pair.group1(), pair.group2()] {
                for member in group.members() {
                    if !self.is_object_defined_in_any_tree(member) {
                        return Err(MachineError::CollisionReference {
                            group: group.name().to_string(),
                            object: member.to_string(),
                        });
                    }
                }
            }
        }
        self.collision_checks.insert(pair.name().to_string(), pair);
        Ok(())
    }

    /// Drop a collision check. Removing an unknown name is a no-op.
    pub fn remove_coll_check(&mut self, name: &str) -> bool {
        self.collision_checks.remove(name).is_some()
    }

    pub fn collision_checks(&self) -> &BTreeMap<String, CollisionPair> {
        &self.collision_checks
    }

    pub fn add_preprocessor(&mut self, preprocessor: Preprocessor) {
        self.preprocessors.push(preprocessor);
    }

    pub fn preprocessors(&self) -> &[Preprocessor] {
        &self.preprocessors
    }

    /// Drive a mutating visitor over one tree.
    pub fn visit_tree(
        &mut self,
        visitor: &mut dyn KinematicVisitor,
        tree_id: Option<&str>,
    ) -> Result<(), MachineError> {
        self.tree_mut(tree_id)?.visit_depth_first(visitor);
        Ok(())
    }

    /// Drive a read-only visitor over one tree.
    pub fn visit_tree_const(
        &self,
        visitor: &mut dyn KinematicConstVisitor,
        tree_id: Option<&str>,
    ) -> Result<(), MachineError> {
        self.tree_ref(tree_id)?.visit_depth_first_const(visitor);
        Ok(())
    }

    /// Drive a mutating visitor over every tree, primary first, then
    /// magazine modules in id order.
    pub fn visit_kinematic_objects(&mut self, visitor: &mut dyn KinematicVisitor) {
        self.tree.visit_depth_first(visitor);
        for module in self.magazine.values_mut() {
            module.tree.visit_depth_first(visitor);
        }
    }

    /// Read-only variant of [`visit_kinematic_objects`].
    ///
    /// [`visit_kinematic_objects`]: Self::visit_kinematic_objects
    pub fn visit_kinematic_objects_const(&self, visitor: &mut dyn KinematicConstVisitor) {
        self.tree.visit_depth_first_const(visitor);
        for module in self.magazine.values() {
            module.tree.visit_depth_first_const(visitor);
        }
    }

    /// Convert the whole machine to `target` units in one pass.
    pub fn scale(&mut self, target: Units) {
        if target == self.units {
            return;
        }
        let factor = self.units.scale_factor_to(target);
        debug!(from = %self.units, to = %target, factor, "scaling machine");
        scale_matrix_translation(&mut self.view_transform, factor);
        self.tree.scale(target);
        for module in self.magazine.values_mut() {
            module.tree.scale(target);
        }
        self.units = target;
    }

    /// Rename an object everywhere: tree, registry, collision groups.
    pub fn replace_object_name(
        &mut self,
        old: &str,
        new: &str,
        tree_id: Option<&str>,
    ) -> Result<(), MachineError> {
        if self.registry.contains_key(new) {
            return Err(MachineError::DuplicateObjectId(new.to_string()));
        }
        let tree = self.tree_mut(tree_id)?;
        let handle = tree
            .find_by_name(old)
            .ok_or_else(|| MachineError::ObjectNotFound(old.to_string()))?;
        tree.rename(handle, new)?;
        if let Some(entry) = self.registry.remove(old) {
            self.registry.insert(new.to_string(), entry);
        }
        for pair in self.collision_checks.values_mut() {
            pair.rename_member(old, new);
        }
        Ok(())
    }

    pub fn replace_kinematic_module_name(
        &mut self,
        old: &str,
        new: &str,
    ) -> Result<(), MachineError> {
        if self.magazine.contains_key(new) {
            return Err(MachineError::DuplicateModule(new.to_string()));
        }
        let module = self
            .magazine
            .remove(old)
            .ok_or_else(|| MachineError::UnknownModule(old.to_string()))?;
        self.magazine.insert(new.to_string(), module);
        for entry in self.registry.values_mut() {
            if entry.tree_id.as_deref() == Some(old) {
                entry.tree_id = Some(new.to_string());
            }
        }
        Ok(())
    }

    /// Deep clone; with `just_kinematic_relevant_info` every node sheds
    /// its display payloads. Handles are fresh, the registry is rebuilt.
    pub fn clone_machine(&self, just_kinematic_relevant_info: bool) -> Self {
        let mut copy = Self {
            machine_name: self.machine_name.clone(),
            controller_name: self.controller_name.clone(),
            units: self.units,
            view_transform: self.view_transform,
            xml_version: self.xml_version,
            write_stl: self.write_stl,
            tree: self.tree.clone_tree(just_kinematic_relevant_info),
            magazine: self
                .magazine
                .iter()
                .map(|(id, module)| {
                    (
                        id.clone(),
                        KinematicModule {
                            tree: module.tree.clone_tree(just_kinematic_relevant_info),
                            mount: module.mount.clone(),
                        },
                    )
                })
                .collect(),
            registry: HashMap::new(),
            collision_checks: self.collision_checks.clone(),
            preprocessors: self.preprocessors.clone(),
            file_dependencies: self.file_dependencies.clone(),
        };
        copy.rebuild_registry();
        copy
    }

    fn rebuild_registry(&mut self) {
        self.registry.clear();
        for (handle, node) in self.tree.iter() {
            self.registry.insert(
                node.name().to_string(),
                RegistryEntry {
                    node_type: node.node_type(),
                    tree_id: None,
                    handle,
                },
            );
        }
        let module_entries: Vec<(String, RegistryEntry)> = self
            .magazine
            .iter()
            .flat_map(|(id, module)| {
                module.tree.iter().map(move |(handle, node)| {
                    (
                        node.name().to_string(),
                        RegistryEntry {
                            node_type: node.node_type(),
                            tree_id: Some(id.clone()),
                            handle,
                        },
                    )
                })
            })
            .collect();
        self.registry.extend(module_entries);
    }

    /// Drop everything back to an empty machine, keeping the unit.
    pub fn clear(&mut self) {
        self.machine_name.clear();
        self.controller_name.clear();
        self.view_transform = DMat4::IDENTITY;
        self.xml_version = crate::io::xml::CURRENT_XML_VERSION;
        self.write_stl = false;
        self.tree.reset();
        self.magazine.clear();
        self.registry.clear();
        self.collision_checks.clear();
        self.preprocessors.clear();
        self.file_dependencies.clear();
    }
}
