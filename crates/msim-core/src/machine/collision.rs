//! Collision check groups
//!
//! A collision check pairs two named groups of object ids. Membership is
//! plain names; validation against the machine registry happens where a
//! check is added, never silently.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named set of object ids checked against another group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGroup {
    name: String,
    members: BTreeSet<String>,
}

impl ObjectGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert_member(&mut self, object_id: impl Into<String>) {
        self.members.insert(object_id.into());
    }

    pub fn remove_member(&mut self, object_id: &str) -> bool {
        self.members.remove(object_id)
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.members.contains(object_id)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn rename_member(&mut self, old: &str, new: &str) {
        if self.members.remove(old) {
            self.members.insert(new.to_string());
        }
    }
}

/// One collision check: two groups tested against each other
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionPair {
    name: String,
    group1: ObjectGroup,
    group2: ObjectGroup,
}

impl CollisionPair {
    pub fn new(name: impl Into<String>, group1: ObjectGroup, group2: ObjectGroup) -> Self {
        Self {
            name: name.into(),
            group1,
            group2,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group1(&self) -> &ObjectGroup {
        &self.group1
    }

    pub fn group2(&self) -> &ObjectGroup {
        &self.group2
    }

    /// Whether either group references `object_id`.
    pub fn is_object_defined(&self, object_id: &str) -> bool {
        self.group1.contains(object_id) || self.group2.contains(object_id)
    }

    pub(crate) fn rename_member(&mut self, old: &str, new: &str) {
        self.group1.rename_member(old, new);
        self.group2.rename_member(old, new);
    }

    pub(crate) fn prune_member(&mut self, object_id: &str) {
        self.group1.remove_member(object_id);
        self.group2.remove_member(object_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> CollisionPair {
        let mut g1 = ObjectGroup::new("g1");
        g1.insert_member("table");
        let mut g2 = ObjectGroup::new("g2");
        g2.insert_member("head");
        g2.insert_member("spindle");
        CollisionPair::new("table_vs_head", g1, g2)
    }

    #[test]
    fn test_membership_spans_both_groups() {
        let p = pair();
        assert!(p.is_object_defined("table"));
        assert!(p.is_object_defined("spindle"));
        assert!(!p.is_object_defined("tool"));
    }

    #[test]
    fn test_rename_member_updates_both_groups() {
        let mut p = pair();
        p.rename_member("head", "milling_head");
        assert!(!p.is_object_defined("head"));
        assert!(p.is_object_defined("milling_head"));
    }
}
