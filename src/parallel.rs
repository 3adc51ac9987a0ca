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

//! The for-each dispatcher: fans a functor out over every entity matching
//! a query, or over a caller-supplied selection of entities, across the
//! thread pool when the `parallel` feature is enabled.
//!
//! Unlike the teacher's old system scheduler, a dispatch never needs
//! exclusive access to the entity manager: every task only reads
//! archetype columns and writes through its own deferred [`CommandBuffer`],
//! so worker closures hold nothing but shared references. Writing to a
//! query's declared write-access columns still goes through
//! [`crate::storage::ArchetypeBase::component_ptr_raw`], which is where
//! the unchecked-aliasing contract lives.

use crossbeam::queue::SegQueue;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::Archetype;
use crate::command::CommandBuffer;
use crate::component::ComponentTable;
use crate::entity::Entity;
use crate::query::{ComponentPositions, MatchedBase, QueryHandle};
use crate::signature::{Component, SharedInstance, MISSING};
use crate::storage::ArchetypeBase;
use crate::world::EntityManager;

const DEFAULT_BATCH_SIZE: usize = 256;

/// Per-entity view handed to a query-based for-each functor: the matched
/// component pointers plus enough identity to post a command.
pub struct ForEachContext<'a> {
    pub entity: Entity,
    pub archetype_index: u16,
    pub base_index: u16,
    pub row: usize,
    positions: &'a ComponentPositions,
    base: &'a ArchetypeBase,
    table: &'a ComponentTable,
}

impl<'a> ForEachContext<'a> {
    /// Read-only pointer to the component bound at `query_lane`, or `None`
    /// if that lane was declared optional and this base does not carry it.
    pub fn component(&self, query_lane: usize) -> Option<*const u8> {
        let column = self.positions[query_lane];
        if column == MISSING {
            None
        } else {
            Some(self.base.component_ptr(self.row, column as usize, self.table))
        }
    }

    /// Mutable pointer to the component bound at `query_lane`.
    ///
    /// # Safety
    /// `query_lane` must be a column the query declared write-access for;
    /// the caller must not read or write it from anywhere else while this
    /// dispatch is in flight.
    pub unsafe fn component_mut(&self, query_lane: usize) -> Option<*mut u8> {
        let column = self.positions[query_lane];
        if column == MISSING {
            None
        } else {
            Some(self.base.component_ptr_raw(self.row, column as usize, self.table))
        }
    }
}

/// Iterate every entity matched by `query`, dispatching in batches of
/// `batch_size` rows. Falls back to running every batch on the calling
/// thread when the `parallel` feature is disabled.
///
/// Returns the merged deferred commands from every task, in archetype
/// match order and batch order; apply them with [`crate::command::apply`]
/// once the dispatch has fully joined.
pub fn for_each<F>(manager: &EntityManager, query: QueryHandle, batch_size: usize, functor: F) -> CommandBuffer
where
    F: Fn(&ForEachContext, &mut CommandBuffer) + Sync,
{
    let batch_size = if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size };

    #[cfg(feature = "profiling")]
    let _span = info_span!("dispatcher.for_each", batch_size).entered();

    let (matches, positions) = manager.query_cache().get_results_and_positions(query);
    let merged = SegQueue::new();

    let dispatch_one = |(matched, pos): (&MatchedBase, &ComponentPositions)| {
        dispatch_base(manager, matched, pos, batch_size, &functor, &merged);
    };

    #[cfg(feature = "parallel")]
    matches.par_iter().zip(positions.par_iter()).for_each(dispatch_one);
    #[cfg(not(feature = "parallel"))]
    matches.iter().zip(positions.iter()).for_each(dispatch_one);

    drain_merged(merged)
}

fn dispatch_base<F>(
    manager: &EntityManager,
    matched: &MatchedBase,
    positions: &ComponentPositions,
    batch_size: usize,
    functor: &F,
    merged: &SegQueue<CommandBuffer>,
) where
    F: Fn(&ForEachContext, &mut CommandBuffer) + Sync,
{
    let archetype: &Archetype = manager.archetype(matched.archetype_index as usize);
    let base = archetype.base(matched.base_index as usize);
    let row_count = base.row_count();
    if row_count == 0 {
        return;
    }
    let table = manager.component_table();
    let batch_count = row_count.div_ceil(batch_size);

    let run_batch = |batch_index: usize| {
        let start = batch_index * batch_size;
        let end = (start + batch_size).min(row_count);
        let mut commands = CommandBuffer::with_capacity(end - start);
        for row in start..end {
            let context = ForEachContext {
                entity: base.entities()[row],
                archetype_index: matched.archetype_index,
                base_index: matched.base_index,
                row,
                positions,
                base,
                table,
            };
            functor(&context, &mut commands);
        }
        if !commands.is_empty() {
            merged.push(commands);
        }
    };

    #[cfg(feature = "parallel")]
    (0..batch_count).into_par_iter().for_each(run_batch);
    #[cfg(not(feature = "parallel"))]
    (0..batch_count).for_each(run_batch);
}

fn drain_merged(queue: SegQueue<CommandBuffer>) -> CommandBuffer {
    let mut out = CommandBuffer::new();
    while let Some(buffer) = queue.pop() {
        out.extend(buffer);
    }
    out
}

/// Per-entity view for the selection variants: component lookups go
/// through the entity's own archetype rather than a cached column map,
/// since a selection may span several archetypes.
pub struct SelectionContext<'a> {
    pub entity: Entity,
    manager: &'a EntityManager,
}

impl<'a> SelectionContext<'a> {
    fn locate(&self, component: Component) -> Option<*const u8> {
        let info = self.manager.entity_pool().try_get_info(self.entity)?;
        let archetype = self.manager.archetype(info.main_archetype as usize);
        let base = archetype.base(info.base_archetype as usize);
        let column = base.column_index_of(component)?;
        Some(base.component_ptr(info.stream_index as usize, column, self.manager.component_table()))
    }

    /// Fatal if `entity` does not currently carry `component`.
    pub fn get_component(&self, component: Component) -> *const u8 {
        self.try_get_component(component).unwrap_or_else(|| {
            crate::error::crash(format!(
                "selection entity {:?} is missing component {:?}",
                self.entity, component
            ))
        })
    }

    pub fn try_get_component(&self, component: Component) -> Option<*const u8> {
        self.locate(component)
    }
}

/// Run `functor` over a caller-supplied selection of entities, batched
/// across the thread pool the same way as [`for_each`]. The entity slice
/// is assumed already stable; callers iterating a structure that can
/// reallocate under them should materialize it into a `Vec` first (the
/// entity manager's scratch allocator, locked via
/// [`EntityManager::lock_scratch`], exists for exactly this).
pub fn for_each_selection<F>(manager: &EntityManager, entities: &[Entity], batch_size: usize, functor: F) -> CommandBuffer
where
    F: Fn(usize, &SelectionContext, &mut CommandBuffer) + Sync,
{
    let batch_size = if batch_size == 0 { DEFAULT_BATCH_SIZE } else { batch_size };
    let merged = SegQueue::new();
    let batch_count = entities.len().div_ceil(batch_size.max(1));

    let run_batch = |batch_index: usize| {
        let start = batch_index * batch_size;
        let end = (start + batch_size).min(entities.len());
        let mut commands = CommandBuffer::with_capacity(end - start);
        for index in start..end {
            let context = SelectionContext {
                entity: entities[index],
                manager,
            };
            functor(index, &context, &mut commands);
        }
        if !commands.is_empty() {
            merged.push(commands);
        }
    };

    #[cfg(feature = "parallel")]
    (0..batch_count).into_par_iter().for_each(run_batch);
    #[cfg(not(feature = "parallel"))]
    (0..batch_count).for_each(run_batch);

    drain_merged(merged)
}

/// Group a selection by the value of `shared_component` and run
/// `initialize`/`finalize` around each group's entity loop; a group whose
/// `initialize` returns `false` is skipped entirely. Groups run on the
/// calling thread in first-seen order (the bracketing functors are not
/// required to be `Sync`); the entities within a group are dispatched the
/// same way as [`for_each_selection`].
pub fn for_each_selection_grouped<F, I, Fin>(
    manager: &EntityManager,
    entities: &[Entity],
    shared_component: Component,
    batch_size: usize,
    mut initialize: I,
    functor: F,
    mut finalize: Fin,
) -> CommandBuffer
where
    F: Fn(usize, &SelectionContext, &mut CommandBuffer) + Sync,
    I: FnMut(SharedInstance) -> bool,
    Fin: FnMut(SharedInstance),
{
    let mut order: Vec<SharedInstance> = Vec::new();
    let mut groups: rustc_hash::FxHashMap<SharedInstance, Vec<Entity>> = rustc_hash::FxHashMap::default();

    for &entity in entities {
        let Some(info) = manager.entity_pool().try_get_info(entity) else {
            continue;
        };
        let archetype = manager.archetype(info.main_archetype as usize);
        let Some(position) = archetype.shared_components().iter().position(|&c| c == shared_component) else {
            continue;
        };
        let instance = archetype.shared_instances(info.base_archetype as usize)[position];
        groups.entry(instance).or_insert_with(|| {
            order.push(instance);
            Vec::new()
        });
        groups.get_mut(&instance).unwrap().push(entity);
    }

    let mut merged = CommandBuffer::new();
    for instance in order {
        if !initialize(instance) {
            continue;
        }
        let group = &groups[&instance];
        merged.extend(for_each_selection(manager, group, batch_size, &functor));
        finalize(instance);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentInfo;
    use crate::query::QueryDescription;
    use crate::signature::ComponentSignature;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn manager_with_counters(count: usize) -> (EntityManager, Vec<Entity>) {
        let mut manager = EntityManager::new();
        manager.register_component(Component(1), ComponentInfo::trivial(4));
        let mut entities = Vec::new();
        for i in 0..count {
            let entity = manager
                .spawn([Component(1)].into_iter().collect(), ComponentSignature::new(), Default::default())
                .unwrap();
            unsafe {
                let ptr = manager.component_ptr_mut(entity, Component(1)).unwrap() as *mut u32;
                *ptr = i as u32;
            }
            entities.push(entity);
        }
        (manager, entities)
    }

    #[test]
    fn for_each_visits_every_matched_entity_exactly_once() {
        let (manager, entities) = manager_with_counters(10);
        let handle = manager.query_cache().add_query(
            QueryDescription {
                components: vec![Component(1)],
                optional_components: Vec::new(),
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            manager.archetypes(),
        );

        let visited = Arc::new(AtomicU32::new(0));
        let counter = visited.clone();
        let commands = for_each(&manager, handle, 3, move |ctx, _cmds| {
            counter.fetch_add(1, Ordering::Relaxed);
            let value = unsafe { *(ctx.component(0).unwrap() as *const u32) };
            assert!((value as usize) < entities.len());
        });

        assert_eq!(visited.load(Ordering::Relaxed), 10);
        assert!(commands.is_empty());
    }

    #[test]
    fn for_each_collects_deferred_despawns_without_mutating_during_dispatch() {
        let (manager, _entities) = manager_with_counters(4);
        let handle = manager.query_cache().add_query(
            QueryDescription {
                components: vec![Component(1)],
                optional_components: Vec::new(),
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            manager.archetypes(),
        );

        let mut commands = for_each(&manager, handle, 2, |ctx, cmds| {
            cmds.despawn(ctx.entity);
        });

        assert_eq!(commands.len(), 4);
        let mut manager = manager;
        crate::command::apply(&mut commands, &mut manager).unwrap();
        assert_eq!(manager.archetypes()[0].base_count(), 0);
    }

    #[test]
    fn selection_grouped_skips_groups_that_fail_initialize() {
        let mut manager = EntityManager::new();
        manager.register_component(Component(1), ComponentInfo::trivial(4));
        manager.register_component(Component(9), ComponentInfo::trivial(2));
        let shared: ComponentSignature = [Component(9)].into_iter().collect();

        let a = manager
            .spawn(
                [Component(1)].into_iter().collect(),
                shared.clone(),
                [SharedInstance(1)].into_iter().collect(),
            )
            .unwrap();
        let b = manager
            .spawn([Component(1)].into_iter().collect(), shared, [SharedInstance(2)].into_iter().collect())
            .unwrap();

        let visited = Arc::new(std::sync::Mutex::new(Vec::new()));
        let visited_clone = visited.clone();
        let commands = for_each_selection_grouped(
            &manager,
            &[a, b],
            Component(9),
            4,
            |instance| instance == SharedInstance(1),
            move |_, ctx, _cmds| {
                visited_clone.lock().unwrap().push(ctx.entity);
            },
            |_instance| {},
        );

        assert!(commands.is_empty());
        assert_eq!(*visited.lock().unwrap(), vec![a]);
    }
}
