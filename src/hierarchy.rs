// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parent/child entity graph, independent of archetype storage.
//!
//! Nodes live in a [`slotmap::SlotMap`] arena instead of the raw
//! self-referential pointers a C-family implementation would use for this -
//! parent and children are plain [`NodeKey`]s into the arena, so there is no
//! pointer-patching pass needed outside of deserialization.

use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{new_key_type, SlotMap};
use tinyvec::TinyVec;

use crate::entity::Entity;
use crate::error::{EcsError, Result};

/// Number of children a node stores inline before spilling to the heap.
pub const HIERARCHY_INLINE_CHILDREN: usize = 4;

new_key_type! {
    struct NodeKey;
}

struct Node {
    entity: Entity,
    parent: Option<NodeKey>,
    children: TinyVec<[NodeKey; HIERARCHY_INLINE_CHILDREN]>,
}

/// Independent parent/child graph keyed by [`Entity`].
pub struct EntityHierarchy {
    nodes: SlotMap<NodeKey, Node>,
    by_entity: FxHashMap<Entity, NodeKey>,
    roots: FxHashSet<Entity>,
}

impl Default for EntityHierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityHierarchy {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            by_entity: FxHashMap::default(),
            roots: FxHashSet::default(),
        }
    }

    #[inline]
    pub fn exists(&self, entity: Entity) -> bool {
        self.by_entity.contains_key(&entity)
    }

    #[inline]
    pub fn is_root(&self, entity: Entity) -> bool {
        self.roots.contains(&entity)
    }

    fn key_of(&self, entity: Entity) -> NodeKey {
        match self.by_entity.get(&entity) {
            Some(&key) => key,
            None => crate::error::crash(format!("hierarchy: entity {:?} has no node", entity)),
        }
    }

    /// Insert `child` as a new node under `parent`, or as a root if
    /// `parent == Entity::INVALID`.
    pub fn add_entry(&mut self, parent: Entity, child: Entity) {
        crate::ecs_assert!(!self.exists(child), "hierarchy: entity {:?} already has a node", child);

        let parent_key = if parent.is_invalid() {
            None
        } else {
            Some(self.key_of(parent))
        };

        let child_key = self.nodes.insert(Node {
            entity: child,
            parent: parent_key,
            children: TinyVec::new(),
        });
        self.by_entity.insert(child, child_key);

        match parent_key {
            None => {
                self.roots.insert(child);
            }
            Some(parent_key) => {
                self.nodes[parent_key].children.push(child_key);
            }
        }
    }

    /// Swap-back remove `child` from `parent`'s children list.
    pub fn remove_child_from_node(&mut self, parent: Entity, child: Entity) {
        let parent_key = self.key_of(parent);
        let child_key = self.key_of(child);
        let children = &mut self.nodes[parent_key].children;
        let position = children
            .iter()
            .position(|&k| k == child_key)
            .unwrap_or_else(|| crate::error::crash(format!("hierarchy: {:?} is not a child of {:?}", child, parent)));
        children.swap_remove(position);
    }

    fn detach(&mut self, entity: Entity) {
        let key = self.key_of(entity);
        match self.nodes[key].parent {
            Some(parent_key) => {
                let parent_entity = self.nodes[parent_key].entity;
                self.remove_child_from_node(parent_entity, entity);
            }
            None => {
                self.roots.remove(&entity);
            }
        }
    }

    /// Detach `child` from its current parent (or the roots set) and
    /// attach it under `new_parent` (or as a root, if invalid).
    ///
    /// Rejects re-parenting a node onto itself or onto one of its own
    /// descendants, either of which would turn the arena into a cycle.
    pub fn change_parent(&mut self, new_parent: Entity, child: Entity) -> Result<()> {
        if !new_parent.is_invalid() {
            if new_parent == child {
                return Err(EcsError::HierarchyError(format!(
                    "cannot re-parent {child:?} onto itself"
                )));
            }
            if self.get_all_children(child).contains(&new_parent) {
                return Err(EcsError::HierarchyError(format!(
                    "cannot re-parent {child:?} onto its own descendant {new_parent:?}"
                )));
            }
        }

        self.detach(child);
        let child_key = self.key_of(child);
        if new_parent.is_invalid() {
            self.nodes[child_key].parent = None;
            self.roots.insert(child);
        } else {
            let new_parent_key = self.key_of(new_parent);
            self.nodes[child_key].parent = Some(new_parent_key);
            self.nodes[new_parent_key].children.push(child_key);
        }
        Ok(())
    }

    /// Recursively remove `entity` and every descendant.
    pub fn remove_entry(&mut self, entity: Entity) {
        if !self.exists(entity) {
            return;
        }
        self.detach(entity);
        self.remove_subtree(entity);
    }

    fn remove_subtree(&mut self, entity: Entity) {
        let key = self.key_of(entity);
        let children: Vec<Entity> = self.nodes[key]
            .children
            .iter()
            .map(|&k| self.nodes[k].entity)
            .collect();
        for child in children {
            self.remove_subtree(child);
        }
        self.by_entity.remove(&entity);
        self.roots.remove(&entity);
        self.nodes.remove(key);
    }

    /// Direct children of `entity`, in insertion/swap-back order.
    pub fn get_children(&self, entity: Entity) -> Vec<Entity> {
        let key = self.key_of(entity);
        self.nodes[key].children.iter().map(|&k| self.nodes[k].entity).collect()
    }

    /// Every descendant of `entity`, breadth-first.
    pub fn get_all_children(&self, entity: Entity) -> Vec<Entity> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self.key_of(entity));
        while let Some(key) = queue.pop_front() {
            for &child_key in &self.nodes[key].children {
                out.push(self.nodes[child_key].entity);
                queue.push_back(child_key);
            }
        }
        out
    }

    pub fn get_parent(&self, entity: Entity) -> Option<Entity> {
        let key = self.key_of(entity);
        self.nodes[key].parent.map(|k| self.nodes[k].entity)
    }

    /// Walk up to the root ancestor of `entity` (itself, if already a root).
    pub fn get_root_from_entity(&self, entity: Entity) -> Entity {
        let mut key = self.key_of(entity);
        while let Some(parent_key) = self.nodes[key].parent {
            key = parent_key;
        }
        self.nodes[key].entity
    }

    /// Deep clone every node of `other` into `self`, under the same
    /// entity keys. Two passes: first create every node with no
    /// relations, then rewrite parent/children using the freshly created
    /// keys so no pointer-patching is needed across hierarchies either.
    pub fn copy_other(&mut self, other: &EntityHierarchy) {
        self.nodes.clear();
        self.by_entity.clear();
        self.roots.clear();

        for node in other.nodes.values() {
            let key = self.nodes.insert(Node {
                entity: node.entity,
                parent: None,
                children: TinyVec::new(),
            });
            self.by_entity.insert(node.entity, key);
        }

        for node in other.nodes.values() {
            let key = self.by_entity[&node.entity];
            match node.parent {
                Some(parent_key) => {
                    let parent_entity = other.nodes[parent_key].entity;
                    self.nodes[key].parent = Some(self.by_entity[&parent_entity]);
                }
                None => {
                    self.roots.insert(node.entity);
                }
            }
            let children: TinyVec<[NodeKey; HIERARCHY_INLINE_CHILDREN]> = node
                .children
                .iter()
                .map(|&child_key| self.by_entity[&other.nodes[child_key].entity])
                .collect();
            self.nodes[key].children = children;
        }
    }

    /// Write the binary layout described by the serialization format:
    /// `{ version, node_count, root_count }` followed by one record per
    /// node `{ entity, parent_entity, child_count, children... }`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.roots.len() as u32).to_le_bytes());
        for node in self.nodes.values() {
            out.extend_from_slice(&node.entity.0.to_le_bytes());
            let parent_entity = node.parent.map(|k| self.nodes[k].entity).unwrap_or(Entity::INVALID);
            out.extend_from_slice(&parent_entity.0.to_le_bytes());
            out.extend_from_slice(&(node.children.len() as u32).to_le_bytes());
            for &child_key in &node.children {
                out.extend_from_slice(&self.nodes[child_key].entity.0.to_le_bytes());
            }
        }
        out
    }

    /// Parse the layout written by [`Self::serialize`]. Parent/child
    /// entity values are resolved into node keys in a second pass, once
    /// every node exists.
    pub fn deserialize(bytes: &[u8]) -> Result<EntityHierarchy> {
        let mut cursor = 0usize;
        let mut read_u32 = |bytes: &[u8], cursor: &mut usize| -> Result<u32> {
            let end = *cursor + 4;
            let slice = bytes.get(*cursor..end).ok_or(EcsError::SerializationError("truncated hierarchy buffer".into()))?;
            *cursor = end;
            Ok(u32::from_le_bytes(slice.try_into().unwrap()))
        };
        let mut read_u64 = |bytes: &[u8], cursor: &mut usize| -> Result<u64> {
            let end = *cursor + 8;
            let slice = bytes.get(*cursor..end).ok_or(EcsError::SerializationError("truncated hierarchy buffer".into()))?;
            *cursor = end;
            Ok(u64::from_le_bytes(slice.try_into().unwrap()))
        };

        let version = read_u32(bytes, &mut cursor)?;
        if version != 1 {
            return Err(EcsError::VersionMismatch { expected: 1, found: version });
        }
        let node_count = read_u32(bytes, &mut cursor)? as usize;
        let _root_count = read_u32(bytes, &mut cursor)?;

        let mut hierarchy = EntityHierarchy::new();
        hierarchy.nodes.reserve(node_count);
        hierarchy.by_entity.reserve(node_count);

        struct Pending {
            key: NodeKey,
            parent_entity: Entity,
            child_entities: Vec<Entity>,
        }
        let mut pending = Vec::with_capacity(node_count);

        for _ in 0..node_count {
            let entity = Entity(read_u64(bytes, &mut cursor)?);
            let parent_entity = Entity(read_u64(bytes, &mut cursor)?);
            let child_count = read_u32(bytes, &mut cursor)? as usize;
            let mut child_entities = Vec::with_capacity(child_count);
            for _ in 0..child_count {
                child_entities.push(Entity(read_u64(bytes, &mut cursor)?));
            }
            let key = hierarchy.nodes.insert(Node {
                entity,
                parent: None,
                children: TinyVec::new(),
            });
            hierarchy.by_entity.insert(entity, key);
            pending.push(Pending {
                key,
                parent_entity,
                child_entities,
            });
        }

        for entry in &pending {
            if entry.parent_entity.is_invalid() {
                hierarchy.roots.insert(hierarchy.nodes[entry.key].entity);
            } else {
                let parent_key = *hierarchy
                    .by_entity
                    .get(&entry.parent_entity)
                    .ok_or(EcsError::SerializationError("truncated hierarchy buffer".into()))?;
                hierarchy.nodes[entry.key].parent = Some(parent_key);
            }
            let children: Result<TinyVec<[NodeKey; HIERARCHY_INLINE_CHILDREN]>> = entry
                .child_entities
                .iter()
                .map(|child_entity| {
                    hierarchy
                        .by_entity
                        .get(child_entity)
                        .copied()
                        .ok_or(EcsError::SerializationError("unresolved entity reference".into()))
                })
                .collect();
            hierarchy.nodes[entry.key].children = children?;
        }

        Ok(hierarchy)
    }

    /// Diff `self` (the "before" state) against `after`, producing the
    /// set of removed entities and the set of entities whose parent
    /// changed (including to/from a root).
    pub fn determine_change_set(&self, after: &EntityHierarchy) -> ChangeSet {
        let mut removed = Vec::new();
        let mut changed_parents = Vec::new();

        for entity in self.by_entity.keys() {
            if !after.exists(*entity) {
                removed.push(*entity);
            }
        }
        for entity in after.by_entity.keys() {
            let before_parent = self.exists(*entity).then(|| self.get_parent(*entity)).flatten();
            let after_parent = after.get_parent(*entity);
            // An entity absent from `self` is a new entity added since the
            // "before" snapshot, not just a reparent - it still needs a
            // changed_parents entry so `apply_change_set`'s add-on-missing
            // branch can reconstruct it.
            if !self.exists(*entity) || before_parent != after_parent {
                changed_parents.push((*entity, after_parent.unwrap_or(Entity::INVALID)));
            }
        }
        ChangeSet { removed, changed_parents }
    }

    /// Apply a previously computed [`ChangeSet`]: process removals first,
    /// then re-parent (creating a missing new parent as a root) or insert
    /// each changed entity.
    pub fn apply_change_set(&mut self, change_set: &ChangeSet) {
        for &entity in &change_set.removed {
            self.remove_entry(entity);
        }
        for &(child, new_parent) in &change_set.changed_parents {
            if !new_parent.is_invalid() && !self.exists(new_parent) {
                self.add_entry(Entity::INVALID, new_parent);
            }
            if self.exists(child) {
                if let Err(err) = self.change_parent(new_parent, child) {
                    crate::error::crash(format!("apply_change_set produced a cyclic re-parent: {err}"));
                }
            } else {
                self.add_entry(new_parent, child);
            }
        }
    }
}

/// Result of [`EntityHierarchy::determine_change_set`]: entities removed
/// outright, and entities whose parent changed (to `(child, new_parent)`,
/// with `new_parent == Entity::INVALID` meaning "became a root").
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub removed: Vec<Entity>,
    pub changed_parents: Vec<(Entity, Entity)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(index: u32) -> Entity {
        Entity::new(index, 1, 0, 0)
    }

    #[test]
    fn round_trip_preserves_roots_parents_and_children() {
        let mut hierarchy = EntityHierarchy::new();
        let root = e(1);
        let child1 = e(2);
        let child2 = e(3);
        let grandchild = e(4);
        hierarchy.add_entry(Entity::INVALID, root);
        hierarchy.add_entry(root, child1);
        hierarchy.add_entry(root, child2);
        hierarchy.add_entry(child1, grandchild);

        let bytes = hierarchy.serialize();
        let restored = EntityHierarchy::deserialize(&bytes).unwrap();

        let mut children = restored.get_children(root);
        children.sort_by_key(|e| e.0);
        let mut expected = vec![child1, child2];
        expected.sort_by_key(|e| e.0);
        assert_eq!(children, expected);
        assert_eq!(restored.get_parent(grandchild), Some(child1));
        assert_eq!(restored.get_root_from_entity(grandchild), root);
        assert!(restored.is_root(root));
        assert!(!restored.is_root(child1));
    }

    #[test]
    fn deserialize_rejects_version_mismatch() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        let err = EntityHierarchy::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, EcsError::VersionMismatch { expected: 1, found: 99 }));
    }

    fn build_s5() -> (EntityHierarchy, Entity, Entity, Entity, Entity) {
        let mut hierarchy = EntityHierarchy::new();
        let root = e(1);
        let child1 = e(2);
        let child2 = e(3);
        let grandchild = e(4);
        hierarchy.add_entry(Entity::INVALID, root);
        hierarchy.add_entry(root, child1);
        hierarchy.add_entry(root, child2);
        hierarchy.add_entry(child1, grandchild);
        (hierarchy, root, child1, child2, grandchild)
    }

    #[test]
    fn change_set_reflects_reparent_and_removal() {
        let (before, root, _child1, child2, grandchild) = build_s5();
        let mut after = EntityHierarchy::new();
        after.copy_other(&before);
        after.change_parent(root, grandchild).unwrap();
        after.remove_entry(child2);

        let change_set = before.determine_change_set(&after);
        assert_eq!(change_set.removed, vec![child2]);
        assert_eq!(change_set.changed_parents, vec![(grandchild, root)]);
    }

    #[test]
    fn change_set_captures_an_entity_added_after_the_before_snapshot() {
        let (before, root, _child1, _child2, _grandchild) = build_s5();
        let mut after = EntityHierarchy::new();
        after.copy_other(&before);
        let new_child = e(5);
        after.add_entry(root, new_child);

        let change_set = before.determine_change_set(&after);
        assert!(change_set.changed_parents.contains(&(new_child, root)));

        let mut applied = EntityHierarchy::new();
        applied.copy_other(&before);
        applied.apply_change_set(&change_set);
        assert!(applied.exists(new_child));
        assert_eq!(applied.get_parent(new_child), Some(root));
    }

    #[test]
    fn change_parent_rejects_self_and_cycles() {
        let (mut hierarchy, root, child1, _child2, grandchild) = build_s5();
        assert!(matches!(
            hierarchy.change_parent(child1, child1),
            Err(EcsError::HierarchyError(_))
        ));
        assert!(matches!(
            hierarchy.change_parent(grandchild, root),
            Err(EcsError::HierarchyError(_))
        ));
        // unaffected by the rejected attempts
        assert_eq!(hierarchy.get_parent(root), None);
        assert_eq!(hierarchy.get_parent(child1), Some(root));
    }

    #[test]
    fn apply_change_set_reconstructs_target_hierarchy() {
        let (before, root, child1, child2, grandchild) = build_s5();
        let mut after = EntityHierarchy::new();
        after.copy_other(&before);
        after.change_parent(root, grandchild).unwrap();
        after.remove_entry(child2);

        let change_set = before.determine_change_set(&after);
        let mut applied = EntityHierarchy::new();
        applied.copy_other(&before);
        applied.apply_change_set(&change_set);

        assert!(!applied.exists(child2));
        assert_eq!(applied.get_parent(grandchild), Some(root));
        assert_eq!(applied.get_parent(child1), Some(root));
    }
}
