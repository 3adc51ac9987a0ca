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

//! An archetype: a fixed unique/shared component signature, holding many
//! [`ArchetypeBase`]s, one per distinct shared-instance tuple.
//!
//! Entities with the same unique components but different shared values
//! (e.g. two meshes sharing a `Transform`/`Velocity` signature but
//! pointing at different `Material` instances) live in different bases
//! of the same archetype, so shared data is stored once per base instead
//! of once per entity.

use smallvec::SmallVec;

use crate::component::ComponentTable;
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::signature::{
    Component, ComponentSignature, SharedInstance, SharedInstanceSignature, VectorComponentSignature,
    MAX_COMPONENTS,
};
use crate::storage::ArchetypeBase;

struct BaseEntry {
    base: ArchetypeBase,
    shared_instances: SharedInstanceSignature,
    vector_instances: VectorComponentSignature,
}

/// Owns every base that shares one unique/shared component signature.
pub struct Archetype {
    unique_components: ComponentSignature,
    shared_components: ComponentSignature,
    vector_unique: VectorComponentSignature,
    vector_shared: VectorComponentSignature,
    /// Positions (into `unique_components`) of components that carry a
    /// non-trivial [`crate::component::ComponentLifecycle`]. Hoisted once
    /// at construction so whole-archetype teardown doesn't need to probe
    /// the component table column by column.
    user_defined_components: SmallVec<[u8; MAX_COMPONENTS]>,
    bases: Vec<BaseEntry>,
}

impl Archetype {
    pub fn new(unique_components: ComponentSignature, shared_components: ComponentSignature, table: &ComponentTable) -> Self {
        crate::ecs_assert!(
            unique_components.len() + shared_components.len() <= MAX_COMPONENTS,
            "archetype has {} unique + {} shared components, maximum combined is {MAX_COMPONENTS}",
            unique_components.len(),
            shared_components.len()
        );
        let vector_unique = VectorComponentSignature::from_components(&unique_components);
        let vector_shared = VectorComponentSignature::from_components(&shared_components);
        let user_defined_components = unique_components
            .iter()
            .enumerate()
            .filter_map(|(i, &component)| {
                table
                    .get(component)
                    .filter(|info| info.has_lifecycle())
                    .map(|_| i as u8)
            })
            .collect();

        Self {
            unique_components,
            shared_components,
            vector_unique,
            vector_shared,
            user_defined_components,
            bases: Vec::new(),
        }
    }

    pub fn unique_components(&self) -> &[Component] {
        &self.unique_components
    }

    pub fn shared_components(&self) -> &[Component] {
        &self.shared_components
    }

    pub fn vector_components(&self) -> &VectorComponentSignature {
        &self.vector_unique
    }

    pub fn vector_shared_components(&self) -> &VectorComponentSignature {
        &self.vector_shared
    }

    pub fn user_defined_components(&self) -> &[u8] {
        &self.user_defined_components
    }

    pub fn base_count(&self) -> usize {
        self.bases.len()
    }

    pub fn base(&self, index: usize) -> &ArchetypeBase {
        &self.bases[index].base
    }

    pub fn base_mut(&mut self, index: usize) -> &mut ArchetypeBase {
        &mut self.bases[index].base
    }

    pub fn shared_instances(&self, index: usize) -> &[SharedInstance] {
        &self.bases[index].shared_instances
    }

    /// Create a new base with the given shared-instance tuple, returning
    /// its index. `shared_instances` must have exactly as many entries as
    /// `shared_components`.
    pub fn create_base(&mut self, shared_instances: SharedInstanceSignature) -> Result<usize> {
        if shared_instances.len() != self.shared_components.len() {
            return Err(EcsError::SharedSignatureMismatch {
                expected: self.shared_components.len(),
                got: shared_instances.len(),
            });
        }
        let vector_instances = VectorComponentSignature::from_instances(&shared_instances);
        let index = self.bases.len();
        self.bases.push(BaseEntry {
            base: ArchetypeBase::new(self.unique_components.clone()),
            shared_instances,
            vector_instances,
        });
        Ok(index)
    }

    /// Linear search for the base carrying exactly `shared_instances`.
    pub fn find_base(&self, shared_instances: &[SharedInstance]) -> Option<usize> {
        self.bases
            .iter()
            .position(|entry| entry.shared_instances.as_slice() == shared_instances)
    }

    /// Same lookup, against an already-packed vector form.
    pub fn find_base_vector(&self, shared_instances_vector: &VectorComponentSignature) -> Option<usize> {
        self.bases
            .iter()
            .position(|entry| &entry.vector_instances == shared_instances_vector)
    }

    /// True if this archetype's shared-instance tuple at `base_index`
    /// satisfies `query_components`/`query_instances` (see
    /// [`VectorComponentSignature::shared_has_instances`]).
    pub fn base_has_instances(
        &self,
        base_index: usize,
        query_components: &VectorComponentSignature,
        query_instances: &VectorComponentSignature,
    ) -> bool {
        VectorComponentSignature::shared_has_instances(
            &self.vector_shared,
            &self.bases[base_index].vector_instances,
            query_components,
            query_instances,
        )
    }

    /// Remove an empty base, swapping the last base down into its slot.
    /// Returns the previous index of the base that now occupies
    /// `base_index`, or `None` if no swap was needed (it was already
    /// last). Callers must patch any entity/query-cache references from
    /// the returned previous index down to `base_index`.
    pub fn destroy_base(&mut self, base_index: usize) -> Option<usize> {
        crate::ecs_assert!(
            base_index < self.bases.len(),
            "destroy_base: index {base_index} out of range ({} bases)",
            self.bases.len()
        );
        crate::ecs_assert!(
            self.bases[base_index].base.row_count() == 0,
            "destroy_base: base {base_index} still holds {} live entities",
            self.bases[base_index].base.row_count()
        );
        let last = self.bases.len() - 1;
        self.bases.swap_remove(base_index);
        if base_index != last {
            Some(last)
        } else {
            None
        }
    }

    /// Entities currently stored in `base_index`, in row order.
    pub fn base_entities(&self, base_index: usize) -> &[Entity] {
        self.bases[base_index].base.entities()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentInfo;

    fn table() -> ComponentTable {
        let mut table = ComponentTable::new();
        table.register(Component(1), ComponentInfo::trivial(4));
        table.register(Component(2), ComponentInfo::trivial(8));
        table
    }

    fn unique(ids: &[u16]) -> ComponentSignature {
        ids.iter().map(|&id| Component(id)).collect()
    }

    fn shared_instances(ids: &[u16]) -> SharedInstanceSignature {
        ids.iter().map(|&id| SharedInstance(id)).collect()
    }

    #[test]
    fn create_and_find_base_by_shared_instances() {
        let table = table();
        let mut archetype = Archetype::new(unique(&[1]), unique(&[2]), &table);
        let instances = shared_instances(&[100]);
        let index = archetype.create_base(instances.clone()).unwrap();
        assert_eq!(archetype.find_base(&instances), Some(index));
        assert_eq!(archetype.find_base(&shared_instances(&[101])), None);
    }

    #[test]
    fn create_base_rejects_wrong_shared_signature_length() {
        let table = table();
        let mut archetype = Archetype::new(unique(&[1]), unique(&[2]), &table);
        let err = archetype.create_base(shared_instances(&[1, 2])).unwrap_err();
        assert!(matches!(err, EcsError::SharedSignatureMismatch { expected: 1, got: 2 }));
    }

    #[test]
    fn destroy_base_swaps_last_base_down_and_reports_previous_index() {
        let table = table();
        let mut archetype = Archetype::new(unique(&[1]), unique(&[2]), &table);
        let a = archetype.create_base(shared_instances(&[1])).unwrap();
        let _b = archetype.create_base(shared_instances(&[2])).unwrap();
        let c = archetype.create_base(shared_instances(&[3])).unwrap();

        let moved_from = archetype.destroy_base(a);
        assert_eq!(moved_from, Some(c));
        assert_eq!(archetype.base_count(), 2);
        assert_eq!(archetype.find_base(&shared_instances(&[3])), Some(a));
    }

    #[test]
    fn destroying_last_base_reports_no_swap() {
        let table = table();
        let mut archetype = Archetype::new(unique(&[1]), unique(&[2]), &table);
        let a = archetype.create_base(shared_instances(&[1])).unwrap();
        assert_eq!(archetype.destroy_base(a), None);
        assert_eq!(archetype.base_count(), 0);
    }

    #[test]
    fn base_has_instances_matches_shared_values_at_matching_positions() {
        let table = table();
        let mut archetype = Archetype::new(unique(&[1]), unique(&[2]), &table);
        let base = archetype.create_base(shared_instances(&[42])).unwrap();

        let query_components = VectorComponentSignature::from_components(&unique(&[2]));
        let matching = VectorComponentSignature::from_instances(&shared_instances(&[42]));
        let mismatching = VectorComponentSignature::from_instances(&shared_instances(&[7]));

        assert!(archetype.base_has_instances(base, &query_components, &matching));
        assert!(!archetype.base_has_instances(base, &query_components, &mismatching));
    }
}
