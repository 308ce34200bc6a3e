//! Kinematic tree
//!
//! Arena storage for kinematic objects: nodes are keyed by `Uuid`
//! handles, parent/child structure lives in side maps and sibling order
//! is preserved. Mutations that move anything propagate matrices to all
//! descendants synchronously before returning, recording per-node
//! scene changes into a ledger bounded by the node count.

use std::collections::HashMap;

use glam::DMat4;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::node::visitor::{KinematicConstVisitor, KinematicVisitor};
use crate::node::{AxisError, KinematicObject};

/// Errors from tree structure and drive operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeError {
    #[error("an object named '{0}' already exists in this tree")]
    DuplicateName(String),
    #[error("unknown object handle {0}")]
    UnknownHandle(Uuid),
    #[error("unknown parent handle {0}")]
    UnknownParent(Uuid),
    #[error("object '{0}' cannot carry children")]
    ParentNotTransform(String),
    #[error("object '{0}' is not an axis")]
    NotAnAxis(String),
    #[error(transparent)]
    Axis(#[from] AxisError),
}

/// Accumulated movement of one node since the last ledger reset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneChange {
    /// Propagated matrix before the first recorded movement.
    pub start_matrix: DMat4,
    /// Propagated matrix after the latest recorded movement.
    pub end_matrix: DMat4,
    /// How many propagation passes touched this node since the reset.
    pub change_count: u32,
}

/// A tree of kinematic objects with synchronous matrix propagation
#[derive(Debug, Clone)]
pub struct KinematicTree {
    nodes: HashMap<Uuid, KinematicObject>,
    children: HashMap<Uuid, Vec<Uuid>>,
    parent: HashMap<Uuid, Uuid>,
    roots: Vec<Uuid>,
    name_index: HashMap<String, Uuid>,
    scene_changes: HashMap<Uuid, SceneChange>,
    feedback_enabled: bool,
    repositioning: bool,
}

impl Default for KinematicTree {
    fn default() -> Self {
        Self::new()
    }
}

impl KinematicTree {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
            parent: HashMap::new(),
            roots: Vec::new(),
            name_index: HashMap::new(),
            scene_changes: HashMap::new(),
            feedback_enabled: true,
            repositioning: false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[Uuid] {
        &self.roots
    }

    pub fn children(&self, id: Uuid) -> &[Uuid] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parent(&self, id: Uuid) -> Option<Uuid> {
        self.parent.get(&id).copied()
    }

    pub fn get(&self, id: Uuid) -> Option<&KinematicObject> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: Uuid) -> Option<&mut KinematicObject> {
        self.nodes.get_mut(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Uuid> {
        self.name_index.get(name).copied()
    }

    /// Iterate all nodes in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (Uuid, &KinematicObject)> {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    /// Insert `node` as the last child of `parent` (or as a new root).
    ///
    /// The propagated matrix is computed immediately; insertion itself is
    /// structural and writes no scene-change entry.
    pub fn insert_object(
        &mut self,
        node: KinematicObject,
        parent: Option<Uuid>,
    ) -> Result<Uuid, TreeError> {
        if self.name_index.contains_key(node.name()) {
            return Err(TreeError::DuplicateName(node.name().to_string()));
        }
        let parent_matrix = match parent {
            Some(pid) => {
                let parent_node = self.nodes.get(&pid).ok_or(TreeError::UnknownParent(pid))?;
                if !parent_node.can_have_children() {
                    return Err(TreeError::ParentNotTransform(parent_node.name().to_string()));
                }
                parent_node.propagated_matrix()
            }
            None => DMat4::IDENTITY,
        };

        let id = Uuid::new_v4();
        let mut node = node;
        node.set_propagated_matrix(parent_matrix * node.local_matrix());
        self.name_index.insert(node.name().to_string(), id);
        self.nodes.insert(id, node);
        match parent {
            Some(pid) => {
                self.children.entry(pid).or_default().push(id);
                self.parent.insert(id, pid);
            }
            None => self.roots.push(id),
        }
        Ok(id)
    }

    /// Remove the node and its entire subtree.
    ///
    /// A missing handle is a silent no-op.
    pub fn remove_object(&mut self, id: Uuid) {
        if !self.nodes.contains_key(&id) {
            return;
        }
        let subtree = self.subtree_ids(id);
        debug!(count = subtree.len(), "removing subtree");
        match self.parent.remove(&id) {
            Some(pid) => {
                if let Some(siblings) = self.children.get_mut(&pid) {
                    siblings.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
        for sid in subtree {
            if let Some(node) = self.nodes.remove(&sid) {
                self.name_index.remove(node.name());
            }
            self.children.remove(&sid);
            self.parent.remove(&sid);
            self.scene_changes.remove(&sid);
        }
    }

    /// Handles of `id` and all its descendants, depth-first.
    pub fn subtree_ids(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !self.nodes.contains_key(&current) {
                continue;
            }
            out.push(current);
            if let Some(kids) = self.children.get(&current) {
                stack.extend(kids.iter().rev().copied());
            }
        }
        out
    }

    /// Rename a node, keeping the name index consistent.
    pub fn rename(&mut self, id: Uuid, new_name: &str) -> Result<(), TreeError> {
        if let Some(existing) = self.name_index.get(new_name) {
            if *existing != id {
                return Err(TreeError::DuplicateName(new_name.to_string()));
            }
            return Ok(());
        }
        let node = self.nodes.get_mut(&id).ok_or(TreeError::UnknownHandle(id))?;
        self.name_index.remove(node.name());
        node.set_name(new_name);
        self.name_index.insert(new_name.to_string(), id);
        Ok(())
    }

    /// Replace the local matrix of a node and propagate to descendants.
    pub fn set_coordinate_system(&mut self, id: Uuid, matrix: DMat4) -> Result<(), TreeError> {
        let node = self.nodes.get_mut(&id).ok_or(TreeError::UnknownHandle(id))?;
        node.set_local_matrix(matrix);
        self.propagate_subtree(id);
        Ok(())
    }

    /// Drive an axis node and propagate the resulting movement.
    ///
    /// On a rejected value nothing moves and no ledger entry is written.
    pub fn set_axis_value(&mut self, id: Uuid, value: f64) -> Result<(), TreeError> {
        let node = self.nodes.get_mut(&id).ok_or(TreeError::UnknownHandle(id))?;
        if !node.is_axis() {
            return Err(TreeError::NotAnAxis(node.name().to_string()));
        }
        node.apply_axis_value(value)?;
        self.propagate_subtree(id);
        Ok(())
    }

    /// Restore every node to its initial local state and re-propagate.
    pub fn reset_positions(&mut self) {
        for node in self.nodes.values_mut() {
            node.reset_to_initial();
        }
        for root in self.roots.clone() {
            self.propagate_subtree(root);
        }
    }

    fn parent_propagated(&self, id: Uuid) -> DMat4 {
        self.parent
            .get(&id)
            .and_then(|pid| self.nodes.get(pid))
            .map(|n| n.propagated_matrix())
            .unwrap_or(DMat4::IDENTITY)
    }

    /// Recompute propagated matrices for `root` and all descendants:
    /// `child.propagated = parent.propagated * child.local`, depth-first.
    fn propagate_subtree(&mut self, root: Uuid) {
        let mut stack = vec![(root, self.parent_propagated(root))];
        while let Some((id, parent_matrix)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let old = node.propagated_matrix();
            let new = parent_matrix * node.local_matrix();
            node.set_propagated_matrix(new);
            if self.feedback_enabled && !self.repositioning {
                self.record_change(id, old, new);
            }
            if let Some(kids) = self.children.get(&id) {
                for &child in kids {
                    stack.push((child, new));
                }
            }
        }
    }

    fn record_change(&mut self, id: Uuid, old: DMat4, new: DMat4) {
        self.scene_changes
            .entry(id)
            .and_modify(|entry| {
                entry.end_matrix = new;
                entry.change_count += 1;
            })
            .or_insert(SceneChange {
                start_matrix: old,
                end_matrix: new,
                change_count: 1,
            });
    }

    /// The scene-change ledger accumulated since the last reset.
    pub fn scene_changes(&self) -> &HashMap<Uuid, SceneChange> {
        &self.scene_changes
    }

    pub fn reset_scene_change(&mut self) {
        self.scene_changes.clear();
    }

    /// When disabled, propagation still runs but writes no ledger entries.
    pub fn enable_matrix_change_feedback(&mut self, enabled: bool) {
        self.feedback_enabled = enabled;
    }

    pub fn matrix_change_feedback(&self) -> bool {
        self.feedback_enabled
    }

    /// Repositioning mode suppresses ledger writes while the machine is
    /// re-based (mounting, unit conversion). Structure still propagates.
    pub fn set_repositioning_mode(&mut self, repositioning: bool) {
        self.repositioning = repositioning;
    }

    pub fn toggle_repositioning_mode(&mut self) {
        self.repositioning = !self.repositioning;
    }

    pub fn repositioning_mode(&self) -> bool {
        self.repositioning
    }

    /// Depth-first order of `(node, parent)` pairs over the whole tree.
    fn traversal_order(&self) -> Vec<(Uuid, Option<Uuid>)> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(Uuid, Option<Uuid>)> =
            self.roots.iter().rev().map(|r| (*r, None)).collect();
        while let Some((id, parent)) = stack.pop() {
            order.push((id, parent));
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().rev().map(|c| (*c, Some(id))));
            }
        }
        order
    }

    /// Drive a mutating visitor depth-first, threading the parent handle.
    pub fn visit_depth_first(&mut self, visitor: &mut dyn KinematicVisitor) {
        for (id, parent) in self.traversal_order() {
            visitor.set_current_parent(parent);
            if let Some(node) = self.nodes.get_mut(&id) {
                node.accept(visitor);
            }
        }
    }

    /// Drive a read-only visitor depth-first, threading the parent handle.
    pub fn visit_depth_first_const(&self, visitor: &mut dyn KinematicConstVisitor) {
        for (id, parent) in self.traversal_order() {
            visitor.set_current_parent(parent);
            if let Some(node) = self.nodes.get(&id) {
                node.accept_const(visitor);
            }
        }
    }

    /// Deep copy with fresh handles. With `just_kinematic_relevant_info`
    /// heavy display payloads are dropped from every node. The ledger of
    /// the copy starts empty.
    pub fn clone_tree(&self, just_kinematic_relevant_info: bool) -> Self {
        let mut copy = Self::new();
        copy.feedback_enabled = self.feedback_enabled;
        copy.repositioning = self.repositioning;
        let mut handle_map: HashMap<Uuid, Uuid> = HashMap::new();
        for (id, parent) in self.traversal_order() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let new_parent = parent.and_then(|p| handle_map.get(&p).copied());
            // Names are unique by construction, so this cannot fail.
            if let Ok(new_id) =
                copy.insert_object(node.clone_node(just_kinematic_relevant_info), new_parent)
            {
                handle_map.insert(id, new_id);
            }
        }
        copy
    }

    /// Clear all nodes, structure and the ledger.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.children.clear();
        self.parent.clear();
        self.roots.clear();
        self.name_index.clear();
        self.scene_changes.clear();
    }

    /// Convert every node to `target` units and re-propagate quietly.
    pub(crate) fn scale(&mut self, target: crate::units::Units) {
        for node in self.nodes.values_mut() {
            node.scale(target);
        }
        let was_repositioning = self.repositioning;
        self.repositioning = true;
        for root in self.roots.clone() {
            self.propagate_subtree(root);
        }
        self.repositioning = was_repositioning;
    }

    /// Move the subtree rooted at `root` out of `source` into this tree,
    /// keeping handles, names and sibling order. The subtree is attached
    /// under `parent` (or as a new root) and re-propagated here.
    pub(crate) fn adopt_subtree(
        &mut self,
        source: &mut KinematicTree,
        root: Uuid,
        parent: Option<Uuid>,
    ) -> Result<(), TreeError> {
        if !source.nodes.contains_key(&root) {
            return Err(TreeError::UnknownHandle(root));
        }
        if let Some(pid) = parent {
            let parent_node = self.nodes.get(&pid).ok_or(TreeError::UnknownParent(pid))?;
            if !parent_node.can_have_children() {
                return Err(TreeError::ParentNotTransform(parent_node.name().to_string()));
            }
        }
        let subtree = source.subtree_ids(root);
        for sid in &subtree {
            if let Some(node) = source.nodes.get(sid) {
                if self.name_index.contains_key(node.name()) {
                    return Err(TreeError::DuplicateName(node.name().to_string()));
                }
            }
        }

        // Detach the root from its place in the source tree.
        match source.parent.remove(&root) {
            Some(pid) => {
                if let Some(siblings) = source.children.get_mut(&pid) {
                    siblings.retain(|c| *c != root);
                }
            }
            None => source.roots.retain(|r| *r != root),
        }
        for sid in &subtree {
            if let Some(node) = source.nodes.remove(sid) {
                source.name_index.remove(node.name());
                self.name_index.insert(node.name().to_string(), *sid);
                self.nodes.insert(*sid, node);
            }
            if let Some(kids) = source.children.remove(sid) {
                self.children.insert(*sid, kids);
            }
            if *sid != root {
                if let Some(pid) = source.parent.remove(sid) {
                    self.parent.insert(*sid, pid);
                }
            }
            source.scene_changes.remove(sid);
        }
        match parent {
            Some(pid) => {
                self.children.entry(pid).or_default().push(root);
                self.parent.insert(root, pid);
            }
            None => self.roots.push(root),
        }
        self.propagate_subtree(root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{AxisState, GeometryState, HeldToolState};
    use crate::units::Units;
    use glam::DVec3;

    fn translation(x: f64, y: f64, z: f64) -> DMat4 {
        DMat4::from_translation(DVec3::new(x, y, z))
    }

    fn approx_eq(a: DMat4, b: DMat4) -> bool {
        a.to_cols_array()
            .iter()
            .zip(b.to_cols_array().iter())
            .all(|(x, y)| (x - y).abs() < 1e-9)
    }

    /// base -> spindle (rotational) -> tool
    fn spindle_tree() -> (KinematicTree, Uuid, Uuid, Uuid) {
        let mut tree = KinematicTree::new();
        let base = tree
            .insert_object(
                KinematicObject::coordinate_transform("base", Units::Metric),
                None,
            )
            .unwrap();
        let spindle = tree
            .insert_object(
                KinematicObject::rotational_axis(
                    "spindle",
                    AxisState::new(DVec3::Z).with_limits(-99999.0, 99999.0),
                    Units::Metric,
                ),
                Some(base),
            )
            .unwrap();
        let tool = tree
            .insert_object(
                KinematicObject::held_tool("tool", HeldToolState::default(), Units::Metric),
                Some(spindle),
            )
            .unwrap();
        (tree, base, spindle, tool)
    }

    #[test]
    fn test_propagation_composes_down_the_chain() {
        let (mut tree, base, spindle, tool) = spindle_tree();
        tree.set_coordinate_system(base, translation(10.0, 0.0, 0.0))
            .unwrap();
        tree.set_axis_value(spindle, 0.0).unwrap();

        let expected = translation(10.0, 0.0, 0.0);
        assert!(approx_eq(tree.get(tool).unwrap().propagated_matrix(), expected));
    }

    #[test]
    fn test_scene_change_ledger_per_mutation() {
        let (mut tree, base, spindle, tool) = spindle_tree();

        tree.set_coordinate_system(base, translation(0.0, 5.0, 0.0))
            .unwrap();
        let changes = tree.scene_changes();
        assert_eq!(changes.get(&spindle).map(|c| c.change_count), Some(1));
        assert_eq!(changes.get(&tool).map(|c| c.change_count), Some(1));

        tree.reset_scene_change();
        tree.set_axis_value(spindle, 90.0).unwrap();
        let changes = tree.scene_changes();
        assert!(!changes.contains_key(&base));
        assert_eq!(changes.get(&spindle).map(|c| c.change_count), Some(1));
        assert_eq!(changes.get(&tool).map(|c| c.change_count), Some(1));
    }

    #[test]
    fn test_ledger_entries_overwrite_not_append() {
        let (mut tree, _base, spindle, tool) = spindle_tree();
        tree.reset_scene_change();

        let start = tree.get(tool).unwrap().propagated_matrix();
        tree.set_axis_value(spindle, 45.0).unwrap();
        tree.set_axis_value(spindle, 90.0).unwrap();

        let changes = tree.scene_changes();
        // One entry per node, counting both touches.
        assert_eq!(changes.len(), 2);
        let entry = changes.get(&tool).unwrap();
        assert_eq!(entry.change_count, 2);
        assert!(approx_eq(entry.start_matrix, start));
        assert!(approx_eq(
            entry.end_matrix,
            tree.get(tool).unwrap().propagated_matrix()
        ));
    }

    #[test]
    fn test_feedback_disabled_suppresses_ledger() {
        let (mut tree, base, _spindle, _tool) = spindle_tree();
        tree.enable_matrix_change_feedback(false);
        tree.set_coordinate_system(base, translation(1.0, 2.0, 3.0))
            .unwrap();
        assert!(tree.scene_changes().is_empty());
        // Propagation still happened.
        let base_m = tree.get(base).unwrap().propagated_matrix();
        assert!(approx_eq(base_m, translation(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_rejected_axis_value_moves_nothing() {
        let mut tree = KinematicTree::new();
        let axis = tree
            .insert_object(
                KinematicObject::translational_axis(
                    "x",
                    AxisState::new(DVec3::X).with_limits(-10.0, 10.0),
                    Units::Metric,
                ),
                None,
            )
            .unwrap();
        tree.set_axis_value(axis, 5.0).unwrap();
        tree.reset_scene_change();

        let err = tree.set_axis_value(axis, 50.0).unwrap_err();
        assert!(matches!(
            err,
            TreeError::Axis(AxisError::Overflow { .. })
        ));
        assert!(tree.scene_changes().is_empty());
        assert_eq!(tree.get(axis).unwrap().axis_state().unwrap().value(), 5.0);
    }

    #[test]
    fn test_set_axis_value_on_non_axis_fails() {
        let (mut tree, base, _spindle, _tool) = spindle_tree();
        let err = tree.set_axis_value(base, 1.0).unwrap_err();
        assert_eq!(err, TreeError::NotAnAxis("base".to_string()));
    }

    #[test]
    fn test_remove_subtree_and_silent_noop() {
        let (mut tree, _base, spindle, tool) = spindle_tree();
        tree.remove_object(spindle);
        assert_eq!(tree.len(), 1);
        assert!(tree.get(tool).is_none());
        assert!(tree.find_by_name("spindle").is_none());

        // Removing again is a no-op.
        tree.remove_object(spindle);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut tree = KinematicTree::new();
        tree.insert_object(
            KinematicObject::coordinate_transform("base", Units::Metric),
            None,
        )
        .unwrap();
        let err = tree
            .insert_object(
                KinematicObject::coordinate_transform("base", Units::Metric),
                None,
            )
            .unwrap_err();
        assert_eq!(err, TreeError::DuplicateName("base".to_string()));
    }

    #[test]
    fn test_geometry_cannot_parent() {
        let mut tree = KinematicTree::new();
        let part = tree
            .insert_object(
                KinematicObject::work_piece("part", GeometryState::new("part.stl"), Units::Metric),
                None,
            )
            .unwrap();
        let err = tree
            .insert_object(
                KinematicObject::coordinate_transform("t", Units::Metric),
                Some(part),
            )
            .unwrap_err();
        assert_eq!(err, TreeError::ParentNotTransform("part".to_string()));
    }

    #[test]
    fn test_clone_tree_is_deep_with_fresh_handles() {
        let (mut tree, base, _spindle, _tool) = spindle_tree();
        tree.set_coordinate_system(base, translation(7.0, 0.0, 0.0))
            .unwrap();

        let copy = tree.clone_tree(false);
        assert_eq!(copy.len(), 3);
        assert!(copy.get(base).is_none());
        let copy_base = copy.find_by_name("base").unwrap();
        assert!(approx_eq(
            copy.get(copy_base).unwrap().propagated_matrix(),
            translation(7.0, 0.0, 0.0)
        ));
        assert!(copy.scene_changes().is_empty());

        // Mutating the copy leaves the original alone.
        let mut copy = copy;
        copy.remove_object(copy_base);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_reset_positions_restores_baseline() {
        let (mut tree, base, spindle, tool) = spindle_tree();
        tree.set_coordinate_system(base, translation(3.0, 0.0, 0.0))
            .unwrap();
        tree.set_axis_value(spindle, 90.0).unwrap();
        tree.reset_positions();

        // Initial baseline for this tree is all-identity.
        assert!(approx_eq(
            tree.get(tool).unwrap().propagated_matrix(),
            DMat4::IDENTITY
        ));
        assert_eq!(tree.get(spindle).unwrap().axis_state().unwrap().value(), 0.0);
    }

    #[test]
    fn test_adopt_subtree_moves_nodes_between_trees() {
        let (mut main, base, _spindle, _tool) = spindle_tree();
        let mut other = KinematicTree::new();
        let head = other
            .insert_object(
                KinematicObject::coordinate_transform("head", Units::Metric),
                None,
            )
            .unwrap();
        other
            .insert_object(
                KinematicObject::fixture("clamp", GeometryState::new("clamp.stl"), Units::Metric),
                Some(head),
            )
            .unwrap();

        main.adopt_subtree(&mut other, head, Some(base)).unwrap();
        assert!(other.is_empty());
        assert_eq!(main.len(), 5);
        assert_eq!(main.parent(head), Some(base));
        assert!(main.find_by_name("clamp").is_some());

        // And back out again.
        let mut restored = KinematicTree::new();
        restored.adopt_subtree(&mut main, head, None).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(main.len(), 3);
        assert!(main.find_by_name("clamp").is_none());
    }
}
