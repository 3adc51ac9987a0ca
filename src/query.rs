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

//! The archetype query cache: two thread-safe tables of standing queries,
//! incrementally maintained as archetypes and bases come and go.
//!
//! A query that only requires components lives in the include table; one
//! that also excludes components lives in the exclude table. Splitting
//! them keeps the common "no exclude" case free of an extra check, and
//! mirrors the handle encoding below (the high bit selects the table).
//! Each table entry stores its matched `(archetype, base)` pairs *and* a
//! parallel array of precomputed column positions, so the for-each
//! dispatcher never has to re-run [`VectorComponentSignature::find`] at
//! iteration time.

#[cfg(feature = "profiling")]
use tracing::info_span;

use parking_lot::Mutex;

use crate::archetype::Archetype;
use crate::signature::{
    Component, SharedInstance, VectorComponentSignature, MISSING, SIGNATURE_LANES,
};

/// Bit distinguishing an exclude-table handle from an include-table one.
pub const EXCLUDE_HANDLE_BIT: u32 = 0x8000_0000;

/// Sentinel returned instead of a handle when a query cannot be added -
/// mirrors the original `-1` convention, reinterpreted as unsigned.
pub const INVALID_QUERY_HANDLE: u32 = u32::MAX;

/// Opaque handle to a standing query, returned by [`ArchetypeQueryCache::add_query`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct QueryHandle(u32);

impl QueryHandle {
    pub const INVALID: QueryHandle = QueryHandle(INVALID_QUERY_HANDLE);

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != INVALID_QUERY_HANDLE
    }

    #[inline]
    fn is_exclude(&self) -> bool {
        self.0 & EXCLUDE_HANDLE_BIT != 0
    }

    #[inline]
    fn table_index(&self) -> usize {
        (self.0 & !EXCLUDE_HANDLE_BIT) as usize
    }
}

/// One archetype base matched by a standing query.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MatchedBase {
    pub archetype_index: u16,
    pub base_index: u16,
}

/// Column positions of a query's required components inside the matched
/// archetype's unique-component signature, parallel to a [`MatchedBase`].
pub type ComponentPositions = [u8; SIGNATURE_LANES];

struct QueryEntry {
    query_components: VectorComponentSignature,
    optional_components: VectorComponentSignature,
    exclude_components: Option<VectorComponentSignature>,
    shared_components: VectorComponentSignature,
    shared_instances: VectorComponentSignature,
    matches: Vec<MatchedBase>,
    positions: Vec<ComponentPositions>,
}

impl QueryEntry {
    /// If `(archetype, base_index)` satisfies this entry, return the
    /// column positions to cache alongside the match. Required lanes fill
    /// `positions[0..required_count]`; optional lanes (present or not)
    /// fill the lanes immediately after, in declaration order - see
    /// [`crate::parallel::ForEachContext::component`].
    fn matches_base(&self, archetype: &Archetype, base_index: usize) -> Option<ComponentPositions> {
        let vector_unique = archetype.vector_components();
        if !vector_unique.has_components(&self.query_components) {
            return None;
        }
        if let Some(exclude) = &self.exclude_components {
            if !vector_unique.excludes_components(exclude) {
                return None;
            }
        }
        if self.shared_components.count() > 0
            && !archetype.base_has_instances(base_index, &self.shared_components, &self.shared_instances)
        {
            return None;
        }
        let mut positions = [MISSING; SIGNATURE_LANES];
        vector_unique.find(&self.query_components, &mut positions);
        if self.optional_components.count() > 0 {
            let mut optional_positions = [MISSING; SIGNATURE_LANES];
            vector_unique.find(&self.optional_components, &mut optional_positions);
            let required_count = self.query_components.count();
            for (i, &value) in optional_positions.iter().take(self.optional_components.count()).enumerate() {
                positions[required_count + i] = value;
            }
        }
        Some(positions)
    }

    fn rebuild(&mut self, archetypes: &[Archetype]) {
        self.matches.clear();
        self.positions.clear();
        for (archetype_index, archetype) in archetypes.iter().enumerate() {
            for base_index in 0..archetype.base_count() {
                if let Some(positions) = self.matches_base(archetype, base_index) {
                    self.matches.push(MatchedBase {
                        archetype_index: archetype_index as u16,
                        base_index: base_index as u16,
                    });
                    self.positions.push(positions);
                }
            }
        }
    }
}

/// A description of a query's component requirements, used by both
/// [`ArchetypeQueryCache::add_query`] and `add_query_exclude`.
///
/// `optional_components` lanes never gate a match (an archetype missing
/// one is still matched); the dispatcher sees [`crate::signature::MISSING`]
/// at that lane instead of a column index.
#[derive(Clone, Default)]
pub struct QueryDescription {
    pub components: Vec<Component>,
    pub optional_components: Vec<Component>,
    pub shared_components: Vec<Component>,
    pub shared_instances: Vec<SharedInstance>,
}

#[derive(Default)]
struct Table {
    entries: Vec<QueryEntry>,
}

/// Two thread-safe SoA tables of standing queries (include / exclude),
/// each guarded by its own lock so a query in one table never contends
/// with work on the other.
pub struct ArchetypeQueryCache {
    include: Mutex<Table>,
    exclude: Mutex<Table>,
}

impl Default for ArchetypeQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchetypeQueryCache {
    pub fn new() -> Self {
        Self {
            include: Mutex::new(Table::default()),
            exclude: Mutex::new(Table::default()),
        }
    }

    /// Register a query with no exclusions, snapshotting its matches
    /// against the archetypes that exist right now. Returns the existing
    /// handle if an equal query was already registered.
    pub fn add_query(&self, description: QueryDescription, archetypes: &[Archetype]) -> QueryHandle {
        #[cfg(feature = "profiling")]
        let _span = info_span!("query_cache.add_query").entered();

        let query_components = VectorComponentSignature::from_components(&description.components);
        let optional_components = VectorComponentSignature::from_components(&description.optional_components);
        let shared_components = VectorComponentSignature::from_components(&description.shared_components);
        let shared_instances = VectorComponentSignature::from_instances(&description.shared_instances);
        crate::ecs_assert!(
            query_components.count() + optional_components.count() <= SIGNATURE_LANES,
            "query has {} required + {} optional components, exceeding the {SIGNATURE_LANES}-lane position map",
            query_components.count(),
            optional_components.count()
        );

        let mut table = self.include.lock();
        if let Some(index) = table.entries.iter().position(|e| {
            e.exclude_components.is_none()
                && e.query_components == query_components
                && e.optional_components == optional_components
                && e.shared_components == shared_components
                && e.shared_instances == shared_instances
        }) {
            return QueryHandle(index as u32);
        }

        let mut entry = QueryEntry {
            query_components,
            optional_components,
            exclude_components: None,
            shared_components,
            shared_instances,
            matches: Vec::new(),
            positions: Vec::new(),
        };
        entry.rebuild(archetypes);
        let index = table.entries.len();
        table.entries.push(entry);
        QueryHandle(index as u32)
    }

    /// Register a query that additionally excludes `exclude_components`.
    /// Returns the existing handle if an equal query was already registered.
    pub fn add_query_exclude(
        &self,
        description: QueryDescription,
        exclude_components: Vec<Component>,
        archetypes: &[Archetype],
    ) -> QueryHandle {
        #[cfg(feature = "profiling")]
        let _span = info_span!("query_cache.add_query_exclude").entered();

        let query_components = VectorComponentSignature::from_components(&description.components);
        let optional_components = VectorComponentSignature::from_components(&description.optional_components);
        let exclude_components = VectorComponentSignature::from_components(&exclude_components);
        let shared_components = VectorComponentSignature::from_components(&description.shared_components);
        let shared_instances = VectorComponentSignature::from_instances(&description.shared_instances);
        crate::ecs_assert!(
            query_components.count() + optional_components.count() <= SIGNATURE_LANES,
            "query has {} required + {} optional components, exceeding the {SIGNATURE_LANES}-lane position map",
            query_components.count(),
            optional_components.count()
        );

        let mut table = self.exclude.lock();
        if let Some(index) = table.entries.iter().position(|e| {
            e.exclude_components.as_ref() == Some(&exclude_components)
                && e.query_components == query_components
                && e.optional_components == optional_components
                && e.shared_components == shared_components
                && e.shared_instances == shared_instances
        }) {
            return QueryHandle(index as u32 | EXCLUDE_HANDLE_BIT);
        }

        let mut entry = QueryEntry {
            query_components,
            optional_components,
            exclude_components: Some(exclude_components),
            shared_components,
            shared_instances,
            matches: Vec::new(),
            positions: Vec::new(),
        };
        entry.rebuild(archetypes);
        let index = table.entries.len();
        table.entries.push(entry);
        QueryHandle(index as u32 | EXCLUDE_HANDLE_BIT)
    }

    fn table_for(&self, handle: QueryHandle) -> &Mutex<Table> {
        crate::ecs_assert!(handle.is_valid(), "query_cache: invalid handle dereferenced");
        if handle.is_exclude() {
            &self.exclude
        } else {
            &self.include
        }
    }

    fn assert_in_range(table: &Table, index: usize) {
        crate::ecs_assert!(
            index < table.entries.len(),
            "query_cache: handle index {index} out of range ({} entries)",
            table.entries.len()
        );
    }

    /// Snapshot of the matched bases for `handle`.
    pub fn get_results(&self, handle: QueryHandle) -> Vec<MatchedBase> {
        let table = self.table_for(handle).lock();
        Self::assert_in_range(&table, handle.table_index());
        table.entries[handle.table_index()].matches.clone()
    }

    /// Snapshot of the cached column positions for `handle`, parallel to
    /// [`Self::get_results`].
    pub fn get_component_positions(&self, handle: QueryHandle) -> Vec<ComponentPositions> {
        let table = self.table_for(handle).lock();
        Self::assert_in_range(&table, handle.table_index());
        table.entries[handle.table_index()].positions.clone()
    }

    /// Both snapshots under a single lock acquisition.
    pub fn get_results_and_positions(&self, handle: QueryHandle) -> (Vec<MatchedBase>, Vec<ComponentPositions>) {
        let table = self.table_for(handle).lock();
        Self::assert_in_range(&table, handle.table_index());
        let entry = &table.entries[handle.table_index()];
        (entry.matches.clone(), entry.positions.clone())
    }

    /// A new base was created at `(archetype_index, base_index)`; add it
    /// to every query it now satisfies.
    pub fn update_add(&self, archetype_index: u16, base_index: u16, archetypes: &[Archetype]) {
        let archetype = &archetypes[archetype_index as usize];
        for table in [&self.include, &self.exclude] {
            let mut table = table.lock();
            for entry in table.entries.iter_mut() {
                if let Some(positions) = entry.matches_base(archetype, base_index as usize) {
                    entry.matches.push(MatchedBase {
                        archetype_index,
                        base_index,
                    });
                    entry.positions.push(positions);
                }
            }
        }
    }

    /// A base at `(archetype_index, removed_base_index)` was destroyed.
    /// Drop it from every query's matches; if `Archetype::destroy_base`
    /// swapped another base down from `swapped_from_index`, repoint any
    /// match referencing that old index down to `removed_base_index`.
    pub fn update_remove(
        &self,
        archetype_index: u16,
        removed_base_index: u16,
        swapped_from_index: Option<u16>,
    ) {
        for table in [&self.include, &self.exclude] {
            let mut table = table.lock();
            for entry in table.entries.iter_mut() {
                let mut write = 0;
                for read in 0..entry.matches.len() {
                    let matched = entry.matches[read];
                    if matched.archetype_index == archetype_index && matched.base_index == removed_base_index {
                        continue; // drop
                    }
                    let mut matched = matched;
                    if let Some(swapped_from) = swapped_from_index {
                        if matched.archetype_index == archetype_index && matched.base_index == swapped_from {
                            matched.base_index = removed_base_index;
                        }
                    }
                    entry.matches[write] = matched;
                    entry.positions[write] = entry.positions[read];
                    write += 1;
                }
                entry.matches.truncate(write);
                entry.positions.truncate(write);
            }
        }
    }

    /// Batched variant of [`Self::update_add`]: test every newly added
    /// base against every standing query, appending each match to the
    /// currently-iterated query's own result arrays.
    pub fn update(&self, new_bases: &[(u16, u16)], archetypes: &[Archetype]) {
        #[cfg(feature = "profiling")]
        let _span = info_span!("query_cache.update", new_bases = new_bases.len()).entered();

        for table in [&self.include, &self.exclude] {
            let mut table = table.lock();
            for entry in table.entries.iter_mut() {
                for &(archetype_index, base_index) in new_bases {
                    let archetype = &archetypes[archetype_index as usize];
                    if let Some(positions) = entry.matches_base(archetype, base_index as usize) {
                        entry.matches.push(MatchedBase {
                            archetype_index,
                            base_index,
                        });
                        entry.positions.push(positions);
                    }
                }
            }
        }
    }

    /// Drop every standing query. Used when the entity manager is being
    /// torn down wholesale rather than incrementally maintained.
    pub fn reset(&self) {
        self.include.lock().entries.clear();
        self.exclude.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentInfo, ComponentTable};
    use crate::signature::ComponentSignature;

    fn table() -> ComponentTable {
        let mut table = ComponentTable::new();
        table.register(Component(1), ComponentInfo::trivial(4));
        table.register(Component(2), ComponentInfo::trivial(4));
        table
    }

    fn unique(ids: &[u16]) -> ComponentSignature {
        ids.iter().map(|&id| Component(id)).collect()
    }

    fn make_archetype_with_base(table: &ComponentTable, unique_ids: &[u16]) -> Archetype {
        let mut archetype = Archetype::new(unique(unique_ids), ComponentSignature::new(), table);
        archetype.create_base(Default::default()).unwrap();
        archetype
    }

    #[test]
    fn add_query_snapshots_existing_matches() {
        let t = table();
        let archetypes = vec![make_archetype_with_base(&t, &[1]), make_archetype_with_base(&t, &[1, 2])];
        let cache = ArchetypeQueryCache::new();
        let handle = cache.add_query(
            QueryDescription {
                components: vec![Component(1)],
                optional_components: Vec::new(),
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            &archetypes,
        );
        let results = cache.get_results(handle);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn exclude_query_omits_archetypes_carrying_the_excluded_component() {
        let t = table();
        let archetypes = vec![make_archetype_with_base(&t, &[1]), make_archetype_with_base(&t, &[1, 2])];
        let cache = ArchetypeQueryCache::new();
        let handle = cache.add_query_exclude(
            QueryDescription {
                components: vec![Component(1)],
                optional_components: Vec::new(),
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            vec![Component(2)],
            &archetypes,
        );
        assert!(handle.is_exclude());
        let results = cache.get_results(handle);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].archetype_index, 0);
    }

    #[test]
    fn update_add_extends_matches_for_a_newly_created_base() {
        let t = table();
        let archetypes = vec![make_archetype_with_base(&t, &[1])];
        let cache = ArchetypeQueryCache::new();
        let handle = cache.add_query(
            QueryDescription {
                components: vec![Component(1)],
                optional_components: Vec::new(),
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            &archetypes,
        );
        assert_eq!(cache.get_results(handle).len(), 1);

        let mut archetypes = archetypes;
        let mut second = make_archetype_with_base(&t, &[1]);
        second.create_base(Default::default()).unwrap();
        archetypes.push(second);
        cache.update_add(1, 0, &archetypes);
        cache.update_add(1, 1, &archetypes);
        assert_eq!(cache.get_results(handle).len(), 3);
    }

    #[test]
    fn update_remove_repoints_swapped_base_and_drops_removed_entry() {
        let t = table();
        let mut archetype = make_archetype_with_base(&t, &[1]);
        archetype.create_base(Default::default()).unwrap(); // base 1, empty shared signature duplicate is fine for this test
        let archetypes = vec![archetype];

        let cache = ArchetypeQueryCache::new();
        let handle = cache.add_query(
            QueryDescription {
                components: vec![Component(1)],
                optional_components: Vec::new(),
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            &archetypes,
        );
        assert_eq!(cache.get_results(handle).len(), 2, "both bases carry the required component with an empty shared signature");

        // Simulate destroy_base(0) swapping base 1 down into slot 0.
        cache.update_remove(0, 0, Some(1));
        let results = cache.get_results(handle);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].base_index, 0);
    }

    #[test]
    fn optional_component_position_is_missing_when_the_base_lacks_it() {
        let t = table();
        // archetype 0 carries only the required component; archetype 1 carries both.
        let archetypes = vec![make_archetype_with_base(&t, &[1]), make_archetype_with_base(&t, &[1, 2])];
        let cache = ArchetypeQueryCache::new();
        let handle = cache.add_query(
            QueryDescription {
                components: vec![Component(1)],
                optional_components: vec![Component(2)],
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            &archetypes,
        );

        let (matches, positions) = cache.get_results_and_positions(handle);
        assert_eq!(matches.len(), 2);
        let without_optional = matches.iter().position(|m| m.archetype_index == 0).unwrap();
        let with_optional = matches.iter().position(|m| m.archetype_index == 1).unwrap();
        assert_ne!(positions[without_optional][0], MISSING, "required lane must always resolve");
        assert_eq!(positions[without_optional][1], MISSING, "archetype {B} lacks optional C");
        assert_ne!(positions[with_optional][1], MISSING, "archetype {A,C} carries optional C");
    }

    #[test]
    fn reset_clears_both_tables() {
        let t = table();
        let archetypes = vec![make_archetype_with_base(&t, &[1])];
        let cache = ArchetypeQueryCache::new();
        let handle = cache.add_query(
            QueryDescription {
                components: vec![Component(1)],
                optional_components: Vec::new(),
                shared_components: Vec::new(),
                shared_instances: Vec::new(),
            },
            &archetypes,
        );
        cache.reset();
        assert_eq!(cache.get_results(handle).len(), 0);
    }
}
