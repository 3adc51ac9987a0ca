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

//! `EntityManager`: the composition root gluing the entity pool, archetype
//! list, query cache, hierarchy and component table together.
//!
//! This is the minimal glue needed to exercise the rest of the crate; it
//! does not grow into a scene graph, task manager or renderer. Structural
//! mutation (spawn/despawn, base creation/destruction) happens here
//! because it is the one place that can see every collaborator at once and
//! keep their cross-references (`EntityInfo` ↔ archetype/base/row) in sync.

use bumpalo::Bump;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::Archetype;
use crate::component::{ComponentInfo, ComponentTable};
use crate::entity::{Entity, EntityPool, DEFAULT_CHUNK_POWER};
use crate::error::Result;
use crate::hierarchy::EntityHierarchy;
use crate::query::ArchetypeQueryCache;
use crate::signature::{Component, ComponentSignature, SharedInstanceSignature};

/// Sizes the entity manager's construction accepts in lieu of CLI flags or
/// a config file - programmatic-only configuration, per design.
#[derive(Clone, Copy, Debug)]
pub struct EntityManagerConfig {
    /// `log2` of the entity pool's chunk size.
    pub entity_pool_chunk_power: u32,
    /// Bytes reserved up front in the per-dispatch scratch allocator.
    pub scratch_capacity: usize,
    /// Queries are rare enough in practice that this is mostly documentary.
    pub initial_query_capacity: usize,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self {
            entity_pool_chunk_power: DEFAULT_CHUNK_POWER,
            scratch_capacity: 64 * 1024,
            initial_query_capacity: 16,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ArchetypeKey {
    unique: ComponentSignature,
    shared: ComponentSignature,
}

/// Owns every entity, archetype, the standing query cache, the parent/
/// child hierarchy and the component-info table.
pub struct EntityManager {
    pool: EntityPool,
    archetypes: Vec<Archetype>,
    archetype_index: FxHashMap<ArchetypeKey, usize>,
    query_cache: ArchetypeQueryCache,
    hierarchy: EntityHierarchy,
    components: ComponentTable,
    scratch: Mutex<Bump>,
    config: EntityManagerConfig,
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityManager {
    pub fn new() -> Self {
        Self::with_config(EntityManagerConfig::default())
    }

    pub fn with_config(config: EntityManagerConfig) -> Self {
        Self {
            pool: EntityPool::new(config.entity_pool_chunk_power),
            archetypes: Vec::new(),
            archetype_index: FxHashMap::default(),
            query_cache: ArchetypeQueryCache::new(),
            hierarchy: EntityHierarchy::new(),
            components: ComponentTable::new(),
            scratch: Mutex::new(Bump::with_capacity(config.scratch_capacity)),
            config,
        }
    }

    pub fn config(&self) -> &EntityManagerConfig {
        &self.config
    }

    pub fn register_component(&mut self, component: Component, info: ComponentInfo) {
        self.components.register(component, info);
    }

    pub fn component_table(&self) -> &ComponentTable {
        &self.components
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn archetype(&self, index: usize) -> &Archetype {
        &self.archetypes[index]
    }

    pub fn query_cache(&self) -> &ArchetypeQueryCache {
        &self.query_cache
    }

    pub fn hierarchy(&self) -> &EntityHierarchy {
        &self.hierarchy
    }

    pub fn hierarchy_mut(&mut self) -> &mut EntityHierarchy {
        &mut self.hierarchy
    }

    pub fn entity_pool(&self) -> &EntityPool {
        &self.pool
    }

    pub fn is_valid(&self, entity: Entity) -> bool {
        self.pool.is_valid(entity)
    }

    /// Lock the per-dispatch scratch allocator. The dispatcher acquires
    /// this once, performs every allocation it needs for a dispatch, and
    /// releases it before submitting work to the thread pool.
    pub fn lock_scratch(&self) -> parking_lot::MutexGuard<'_, Bump> {
        self.scratch.lock()
    }

    /// Reset the scratch allocator, reclaiming every allocation made
    /// through [`Self::lock_scratch`] since the last reset.
    pub fn reset_scratch(&self) {
        self.scratch.lock().reset();
    }

    fn get_or_create_archetype(&mut self, unique: ComponentSignature, shared: ComponentSignature) -> usize {
        let key = ArchetypeKey {
            unique: unique.clone(),
            shared: shared.clone(),
        };
        if let Some(&index) = self.archetype_index.get(&key) {
            return index;
        }
        #[cfg(feature = "profiling")]
        let _span = info_span!("entity_manager.create_archetype", unique = unique.len(), shared = shared.len()).entered();

        let archetype = Archetype::new(unique, shared, &self.components);
        let index = self.archetypes.len();
        self.archetypes.push(archetype);
        self.archetype_index.insert(key, index);
        index
    }

    fn get_or_create_base(&mut self, archetype_index: usize, shared_instances: SharedInstanceSignature) -> Result<usize> {
        if let Some(base_index) = self.archetypes[archetype_index].find_base(&shared_instances) {
            return Ok(base_index);
        }
        let base_index = self.archetypes[archetype_index].create_base(shared_instances)?;
        self.query_cache
            .update_add(archetype_index as u16, base_index as u16, &self.archetypes);
        Ok(base_index)
    }

    /// Create an entity with the given unique/shared component set and
    /// shared-instance tuple, in a zero-initialized row. Callers write
    /// component bytes afterward via [`Self::component_ptr_mut`].
    pub fn spawn(
        &mut self,
        unique_components: ComponentSignature,
        shared_components: ComponentSignature,
        shared_instances: SharedInstanceSignature,
    ) -> Result<Entity> {
        #[cfg(feature = "profiling")]
        let _span = info_span!("entity_manager.spawn").entered();

        let archetype_index = self.get_or_create_archetype(unique_components, shared_components);
        let base_index = self.get_or_create_base(archetype_index, shared_instances)?;

        let entity = self.pool.allocate();
        let row = self.archetypes[archetype_index]
            .base_mut(base_index)
            .add_entity(entity, &self.components);
        self.pool
            .set_location(entity, archetype_index as u16, base_index as u16, row as u32);
        Ok(entity)
    }

    /// Mutable pointer to `entity`'s instance of `component`, or `None` if
    /// the entity's archetype does not carry it.
    pub fn component_ptr_mut(&mut self, entity: Entity, component: Component) -> Option<*mut u8> {
        let info = *self.pool.get_info(entity);
        let archetype = &mut self.archetypes[info.main_archetype as usize];
        let base = archetype.base_mut(info.base_archetype as usize);
        let column = base.column_index_of(component)?;
        Some(base.component_ptr_mut(info.stream_index as usize, column, &self.components))
    }

    /// Remove `entity` from its archetype base, running deallocate hooks
    /// on every owned column, patch whichever entity got swapped into its
    /// row, and destroy the base if it is now empty (patching whichever
    /// base got swapped into its slot, and the query cache, in turn).
    pub fn despawn(&mut self, entity: Entity) -> Result<()> {
        #[cfg(feature = "profiling")]
        let _span = info_span!("entity_manager.despawn").entered();

        let info = *self.pool.get_info(entity);
        let archetype_index = info.main_archetype as usize;
        let base_index = info.base_archetype as usize;

        let swapped_entity = self.archetypes[archetype_index]
            .base_mut(base_index)
            .remove_swap_back(info.stream_index as usize, &self.components);
        if let Some(swapped_entity) = swapped_entity {
            self.pool
                .set_location(swapped_entity, archetype_index as u16, base_index as u16, info.stream_index);
        }

        if self.archetypes[archetype_index].base(base_index).row_count() == 0 {
            if let Some(swapped_from) = self.archetypes[archetype_index].destroy_base(base_index) {
                for &moved_entity in self.archetypes[archetype_index].base_entities(base_index) {
                    self.pool.get_info_mut(moved_entity).base_archetype = base_index as u16;
                }
                self.query_cache
                    .update_remove(archetype_index as u16, base_index as u16, Some(swapped_from as u16));
            } else {
                self.query_cache.update_remove(archetype_index as u16, base_index as u16, None);
            }
        }

        self.pool.deallocate(entity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SharedInstance;

    fn table_entry(manager: &mut EntityManager, id: u16, size: usize) {
        manager.register_component(Component(id), ComponentInfo::trivial(size));
    }

    fn sig(ids: &[u16]) -> ComponentSignature {
        ids.iter().map(|&id| Component(id)).collect()
    }

    #[test]
    fn spawn_places_entity_at_row_zero_of_a_fresh_archetype() {
        let mut manager = EntityManager::new();
        table_entry(&mut manager, 1, 4);
        let entity = manager.spawn(sig(&[1]), ComponentSignature::new(), SharedInstanceSignature::new()).unwrap();
        let info = manager.entity_pool().get_info(entity);
        assert_eq!(info.main_archetype, 0);
        assert_eq!(info.base_archetype, 0);
        assert_eq!(info.stream_index, 0);
    }

    #[test]
    fn spawning_twice_with_same_signature_reuses_the_archetype_and_base() {
        let mut manager = EntityManager::new();
        table_entry(&mut manager, 1, 4);
        let e1 = manager.spawn(sig(&[1]), ComponentSignature::new(), SharedInstanceSignature::new()).unwrap();
        let e2 = manager.spawn(sig(&[1]), ComponentSignature::new(), SharedInstanceSignature::new()).unwrap();
        let i1 = manager.entity_pool().get_info(e1);
        let i2 = manager.entity_pool().get_info(e2);
        assert_eq!(i1.main_archetype, i2.main_archetype);
        assert_eq!(i1.base_archetype, i2.base_archetype);
        assert_eq!(i2.stream_index, 1);
        assert_eq!(manager.archetypes().len(), 1);
    }

    #[test]
    fn despawn_patches_the_swapped_in_entity_location() {
        let mut manager = EntityManager::new();
        table_entry(&mut manager, 1, 4);
        let e1 = manager.spawn(sig(&[1]), ComponentSignature::new(), SharedInstanceSignature::new()).unwrap();
        let e2 = manager.spawn(sig(&[1]), ComponentSignature::new(), SharedInstanceSignature::new()).unwrap();
        manager.despawn(e1).unwrap();
        let info = manager.entity_pool().get_info(e2);
        assert_eq!(info.stream_index, 0);
    }

    #[test]
    fn despawning_the_last_entity_destroys_the_base_and_updates_query_cache() {
        let mut manager = EntityManager::new();
        table_entry(&mut manager, 1, 4);
        let handle = manager.query_cache().add_query(
            crate::query::QueryDescription {
                components: vec![Component(1)],
                optional_components: Vec::new(),
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            manager.archetypes(),
        );
        let e1 = manager.spawn(sig(&[1]), ComponentSignature::new(), SharedInstanceSignature::new()).unwrap();
        assert_eq!(manager.query_cache().get_results(handle).len(), 1);
        manager.despawn(e1).unwrap();
        assert_eq!(manager.archetypes()[0].base_count(), 0);
        assert_eq!(manager.query_cache().get_results(handle).len(), 0);
    }

    #[test]
    fn s1_archetype_creation_and_lookup_scenario() {
        let mut manager = EntityManager::new();
        table_entry(&mut manager, 1, 4); // A
        table_entry(&mut manager, 2, 8); // B
        manager.register_component(Component(3), ComponentInfo::trivial(2)); // shared S

        let entity = manager
            .spawn(sig(&[1, 2]), sig(&[3]), [SharedInstance(7)].into_iter().collect())
            .unwrap();

        let info = manager.entity_pool().get_info(entity);
        assert_eq!((info.main_archetype, info.base_archetype, info.stream_index), (0, 0, 0));

        unsafe {
            let a_ptr = manager.component_ptr_mut(entity, Component(1)).unwrap() as *mut u32;
            *a_ptr = 0x1111_1111;
            let b_ptr = manager.component_ptr_mut(entity, Component(2)).unwrap() as *mut u64;
            *b_ptr = 0x2222_2222_2222_2222;
        }

        let archetype = manager.archetype(0);
        let base = archetype.base(0);
        let table = manager.component_table();
        unsafe {
            let a = *(base.component_ptr(0, base.column_index_of(Component(1)).unwrap(), table) as *const u32);
            let b = *(base.component_ptr(0, base.column_index_of(Component(2)).unwrap(), table) as *const u64);
            assert_eq!(a, 0x1111_1111);
            assert_eq!(b, 0x2222_2222_2222_2222);
        }
    }
}
