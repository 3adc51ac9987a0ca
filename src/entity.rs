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

//! Entity handles and the chunked entity pool.
//!
//! `Entity` is a packed 64-bit value, not a `slotmap` key - the pool below
//! owns generation counters and chunk layout directly so indices stay
//! stable across archetype moves and the chunk power of two is caller
//! configurable (`EntityManagerConfig::entity_pool_chunk_power`).

/// Packed entity handle: 32-bit index, 8-bit generation, 8-bit tags,
/// 16-bit layer. Generation zero is reserved for "never allocated" /
/// invalid; a live entity always has generation >= 1.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
#[repr(transparent)]
pub struct Entity(pub u64);

impl Entity {
    /// The canonical invalid handle (index 0, generation 0). Any handle
    /// with generation 0 is invalid regardless of index - this is simply
    /// the conventional all-zero value.
    pub const INVALID: Entity = Entity(0);

    pub fn new(index: u32, generation: u8, tags: u8, layer: u16) -> Self {
        let value = (index as u64)
            | ((generation as u64) << 32)
            | ((tags as u64) << 40)
            | ((layer as u64) << 48);
        Entity(value)
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn generation(&self) -> u8 {
        (self.0 >> 32) as u8
    }

    #[inline]
    pub fn tags(&self) -> u8 {
        (self.0 >> 40) as u8
    }

    #[inline]
    pub fn layer(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.generation() == 0
    }
}

/// Per-entity location metadata, mutated in place as the entity moves
/// between archetype bases. `main_archetype`/`base_archetype` are
/// `u16::MAX` and `stream_index` is `u32::MAX` for an entity that has
/// been allocated but not yet placed into a base.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EntityInfo {
    pub main_archetype: u16,
    pub base_archetype: u16,
    pub stream_index: u32,
    pub generation: u8,
    pub tags: u8,
    pub layer: u16,
}

impl EntityInfo {
    const UNPLACED: Self = Self {
        main_archetype: u16::MAX,
        base_archetype: u16::MAX,
        stream_index: u32::MAX,
        generation: 0,
        tags: 0,
        layer: 0,
    };

    pub fn is_placed(&self) -> bool {
        self.stream_index != u32::MAX
    }
}

impl Default for EntityInfo {
    fn default() -> Self {
        Self::UNPLACED
    }
}

/// Default chunk size power of two (1024 slots per chunk).
pub const DEFAULT_CHUNK_POWER: u32 = 10;

struct Chunk {
    /// `None` when the chunk has never been touched, or was released
    /// after its last live entity was deallocated.
    infos: Option<Box<[EntityInfo]>>,
    in_use: Option<Box<[bool]>>,
    used: u32,
}

impl Chunk {
    fn empty() -> Self {
        Self {
            infos: None,
            in_use: None,
            used: 0,
        }
    }

    fn is_materialized(&self) -> bool {
        self.infos.is_some()
    }
}

/// Chunked, stable-index entity allocator.
///
/// Indices are handed out from the lowest chunk with room; a chunk whose
/// last live entity is deallocated has its backing storage released
/// (`infos`/`in_use` dropped to `None`) but keeps its slot in `chunks` so
/// indices into later chunks stay valid. Generation counters live in a
/// separate array that is never released, so a stale handle into a
/// released-then-reallocated chunk can never validate again.
pub struct EntityPool {
    chunk_power: u32,
    chunk_size: u32,
    chunks: Vec<Chunk>,
    generations: Vec<u8>,
    live_count: u32,
}

impl EntityPool {
    pub fn new(chunk_power: u32) -> Self {
        crate::ecs_assert!(
            chunk_power > 0 && chunk_power < 32,
            "entity pool chunk power {chunk_power} out of range"
        );
        Self {
            chunk_power,
            chunk_size: 1u32 << chunk_power,
            chunks: Vec::new(),
            generations: Vec::new(),
            live_count: 0,
        }
    }

    #[inline]
    fn split(&self, index: u32) -> (usize, usize) {
        let chunk = (index >> self.chunk_power) as usize;
        let local = (index & (self.chunk_size - 1)) as usize;
        (chunk, local)
    }

    fn ensure_chunk(&mut self, chunk_idx: usize) {
        while self.chunks.len() <= chunk_idx {
            self.chunks.push(Chunk::empty());
            let base = self.generations.len();
            self.generations.resize(base + self.chunk_size as usize, 0);
        }
    }

    fn materialize(&mut self, chunk_idx: usize) {
        let chunk = &mut self.chunks[chunk_idx];
        if chunk.infos.is_none() {
            chunk.infos = Some(vec![EntityInfo::default(); self.chunk_size as usize].into_boxed_slice());
            chunk.in_use = Some(vec![false; self.chunk_size as usize].into_boxed_slice());
        }
    }

    /// Find (or create) a chunk with at least one free slot, materializing
    /// it if necessary, and return (chunk_idx, local_idx).
    fn find_free_slot(&mut self) -> (usize, usize) {
        for idx in 0..self.chunks.len() {
            if !self.chunks[idx].is_materialized() || self.chunks[idx].used < self.chunk_size {
                self.materialize(idx);
                let chunk = &self.chunks[idx];
                let in_use = chunk.in_use.as_ref().unwrap();
                if let Some(local) = in_use.iter().position(|&used| !used) {
                    return (idx, local);
                }
            }
        }
        let chunk_idx = self.chunks.len();
        self.ensure_chunk(chunk_idx);
        self.materialize(chunk_idx);
        (chunk_idx, 0)
    }

    fn bump_generation(current: u8) -> u8 {
        if current == u8::MAX { 1 } else { current + 1 }
    }

    fn place(&mut self, chunk_idx: usize, local: usize, info: EntityInfo) -> Entity {
        let global = chunk_idx * self.chunk_size as usize + local;
        if self.generations[global] == 0 {
            self.generations[global] = 1;
        }
        let generation = self.generations[global];

        let chunk = &mut self.chunks[chunk_idx];
        chunk.in_use.as_mut().unwrap()[local] = true;
        chunk.infos.as_mut().unwrap()[local] = EntityInfo { generation, ..info };
        chunk.used += 1;
        self.live_count += 1;

        Entity::new(global as u32, generation, info.tags, info.layer)
    }

    /// Allocate a new entity with no archetype placement yet.
    pub fn allocate(&mut self) -> Entity {
        let (chunk_idx, local) = self.find_free_slot();
        self.place(chunk_idx, local, EntityInfo::UNPLACED)
    }

    /// Allocate a new entity already placed at the given location.
    pub fn allocate_with_location(&mut self, main_archetype: u16, base_archetype: u16, stream_index: u32) -> Entity {
        let (chunk_idx, local) = self.find_free_slot();
        self.place(
            chunk_idx,
            local,
            EntityInfo {
                main_archetype,
                base_archetype,
                stream_index,
                generation: 0,
                tags: 0,
                layer: 0,
            },
        )
    }

    /// Allocate `out.len()` entities, guaranteed to land in a single
    /// chunk (growing the pool by at most one chunk to make room).
    pub fn allocate_batch(&mut self, out: &mut [Entity]) {
        let count = out.len() as u32;
        crate::ecs_assert!(
            count <= self.chunk_size,
            "batch of {count} entities exceeds the {} chunk size",
            self.chunk_size
        );

        let mut chosen = None;
        for idx in 0..self.chunks.len() {
            let free = if self.chunks[idx].is_materialized() {
                self.chunk_size - self.chunks[idx].used
            } else {
                self.chunk_size
            };
            if free >= count {
                chosen = Some(idx);
                break;
            }
        }
        let chunk_idx = chosen.unwrap_or_else(|| {
            let idx = self.chunks.len();
            self.ensure_chunk(idx);
            idx
        });
        self.materialize(chunk_idx);

        let mut produced = 0usize;
        let mut local = 0usize;
        while produced < out.len() {
            let is_free = !self.chunks[chunk_idx].in_use.as_ref().unwrap()[local];
            if is_free {
                out[produced] = self.place(chunk_idx, local, EntityInfo::UNPLACED);
                produced += 1;
            }
            local += 1;
        }
    }

    /// Reconstruct an entity at its exact prior index and generation, as
    /// read back from a serialized snapshot. Crashes if the slot is
    /// already live - that indicates a corrupt or colliding snapshot.
    pub fn allocate_specific(&mut self, entity: Entity, info: EntityInfo) {
        let (chunk_idx, local) = self.split(entity.index());
        self.ensure_chunk(chunk_idx);
        self.materialize(chunk_idx);
        crate::ecs_assert!(
            !self.chunks[chunk_idx].in_use.as_ref().unwrap()[local],
            "allocate_specific: slot for entity index {} is already live",
            entity.index()
        );
        let global = chunk_idx * self.chunk_size as usize + local;
        self.generations[global] = entity.generation();
        let chunk = &mut self.chunks[chunk_idx];
        chunk.in_use.as_mut().unwrap()[local] = true;
        chunk.infos.as_mut().unwrap()[local] = info;
        chunk.used += 1;
        self.live_count += 1;
    }

    /// Release `entity`'s slot. Crashes on a stale or invalid handle.
    pub fn deallocate(&mut self, entity: Entity) {
        crate::ecs_assert!(
            self.is_valid(entity),
            "deallocate: entity {:?} is not a live handle",
            entity
        );
        let (chunk_idx, local) = self.split(entity.index());
        let global = chunk_idx * self.chunk_size as usize + local;

        self.generations[global] = Self::bump_generation(self.generations[global]);
        let chunk = &mut self.chunks[chunk_idx];
        chunk.in_use.as_mut().unwrap()[local] = false;
        chunk.used -= 1;
        self.live_count -= 1;

        if chunk.used == 0 {
            chunk.infos = None;
            chunk.in_use = None;
        }
    }

    pub fn deallocate_batch(&mut self, entities: &[Entity]) {
        for &entity in entities {
            self.deallocate(entity);
        }
    }

    /// True if `entity`'s index and generation both refer to a currently
    /// live slot.
    pub fn is_valid(&self, entity: Entity) -> bool {
        if entity.is_invalid() {
            return false;
        }
        let (chunk_idx, local) = self.split(entity.index());
        if chunk_idx >= self.chunks.len() {
            return false;
        }
        let chunk = &self.chunks[chunk_idx];
        let Some(in_use) = &chunk.in_use else {
            return false;
        };
        if !in_use[local] {
            return false;
        }
        let global = chunk_idx * self.chunk_size as usize + local;
        self.generations[global] == entity.generation()
    }

    /// Location metadata for `entity`, crashing on a stale handle - the
    /// spec treats this path as a contract the caller must uphold.
    pub fn get_info(&self, entity: Entity) -> &EntityInfo {
        crate::ecs_assert!(
            self.is_valid(entity),
            "get_info: entity {:?} is not a live handle",
            entity
        );
        let (chunk_idx, local) = self.split(entity.index());
        &self.chunks[chunk_idx].infos.as_ref().unwrap()[local]
    }

    /// Same as [`Self::get_info`] but returns `None` instead of crashing
    /// on a stale handle, for callers that treat staleness as routine.
    pub fn try_get_info(&self, entity: Entity) -> Option<&EntityInfo> {
        if !self.is_valid(entity) {
            return None;
        }
        let (chunk_idx, local) = self.split(entity.index());
        Some(&self.chunks[chunk_idx].infos.as_ref().unwrap()[local])
    }

    pub fn get_info_mut(&mut self, entity: Entity) -> &mut EntityInfo {
        crate::ecs_assert!(
            self.is_valid(entity),
            "get_info_mut: entity {:?} is not a live handle",
            entity
        );
        let (chunk_idx, local) = self.split(entity.index());
        &mut self.chunks[chunk_idx].infos.as_mut().unwrap()[local]
    }

    /// Overwrite the archetype placement of an already-live entity, used
    /// by archetype code after a row move.
    pub fn set_location(&mut self, entity: Entity, main_archetype: u16, base_archetype: u16, stream_index: u32) {
        let info = self.get_info_mut(entity);
        info.main_archetype = main_archetype;
        info.base_archetype = base_archetype;
        info.stream_index = stream_index;
    }

    /// Mint a handle that is guaranteed not to collide with any currently
    /// live entity and is not in `excluded`. Virtual entities are drawn
    /// descending from the top of the `bit_count`-wide index space and
    /// never actually occupy pool storage.
    ///
    /// This is a handle-miss operation, not a contract violation: if no
    /// free index turns up within the search bound, it returns
    /// [`Entity::INVALID`] instead of crashing, so callers branch on the
    /// result explicitly.
    pub fn get_virtual_entity(&self, bit_count: u32, excluded: &[Entity]) -> Entity {
        const ITERATION_STOP_COUNT: u32 = 1_000;
        crate::ecs_assert!(bit_count >= 16, "get_virtual_entity: bit_count {bit_count} is too narrow");
        let max_value = (1u32 << bit_count) - 2;
        let iterations = ITERATION_STOP_COUNT + excluded.len() as u32;
        for offset in 0..iterations {
            let Some(index) = max_value.checked_sub(offset) else {
                break;
            };
            let candidate = Entity::new(index, 1, 0, 0);
            if excluded.contains(&candidate) {
                continue;
            }
            if self.is_valid(candidate) {
                continue;
            }
            return candidate;
        }
        Entity::INVALID
    }

    pub fn live_count(&self) -> u32 {
        self.live_count
    }

    pub fn chunk_power(&self) -> u32 {
        self.chunk_power
    }

    /// Iterate all currently live entities, in index order. Used by
    /// serialization and by tests; not on any per-frame hot path.
    pub fn iter_live(&self) -> impl Iterator<Item = Entity> + '_ {
        self.chunks.iter().enumerate().flat_map(move |(chunk_idx, chunk)| {
            let chunk_size = self.chunk_size as usize;
            let generations = &self.generations;
            chunk
                .in_use
                .as_ref()
                .into_iter()
                .flat_map(move |in_use| in_use.iter().enumerate())
                .filter(|(_, &used)| used)
                .map(move |(local, _)| {
                    let global = chunk_idx * chunk_size + local;
                    Entity::new(global as u32, generations[global], 0, 0)
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_deallocate_round_trip() {
        let mut pool = EntityPool::new(2); // chunk size 4
        let e = pool.allocate();
        assert!(pool.is_valid(e));
        assert_eq!(pool.live_count(), 1);
        pool.deallocate(e);
        assert!(!pool.is_valid(e));
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn stale_handle_never_revalidates_after_reuse() {
        let mut pool = EntityPool::new(2);
        let e1 = pool.allocate();
        pool.deallocate(e1);
        let e2 = pool.allocate();
        assert_eq!(e1.index(), e2.index(), "slot should be reused");
        assert_ne!(e1.generation(), e2.generation());
        assert!(!pool.is_valid(e1));
        assert!(pool.is_valid(e2));
    }

    #[test]
    fn generation_survives_chunk_release_and_rematerialize() {
        let mut pool = EntityPool::new(1); // chunk size 2
        let a = pool.allocate();
        let b = pool.allocate();
        pool.deallocate(a);
        pool.deallocate(b); // chunk 0 now fully empty, backing storage released

        let c = pool.allocate(); // re-materializes chunk 0
        assert!(!pool.is_valid(a));
        assert!(!pool.is_valid(b));
        assert!(pool.is_valid(c));
        assert!(c.generation() > a.generation().max(b.generation()));
    }

    #[test]
    fn allocation_crosses_chunk_boundary() {
        let mut pool = EntityPool::new(1); // chunk size 2
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(pool.allocate());
        }
        assert_eq!(pool.chunks.len(), 3);
        for h in &handles {
            assert!(pool.is_valid(*h));
        }
    }

    #[test]
    fn allocate_batch_lands_in_a_single_chunk() {
        let mut pool = EntityPool::new(3); // chunk size 8
        let mut batch = [Entity::INVALID; 5];
        pool.allocate_batch(&mut batch);
        let first_chunk = batch[0].index() >> pool.chunk_power();
        for e in &batch {
            assert_eq!(e.index() >> pool.chunk_power(), first_chunk);
            assert!(pool.is_valid(*e));
        }
    }

    #[test]
    fn location_round_trips_through_get_and_set() {
        let mut pool = EntityPool::new(4);
        let e = pool.allocate_with_location(3, 7, 11);
        let info = pool.get_info(e);
        assert_eq!(info.main_archetype, 3);
        assert_eq!(info.base_archetype, 7);
        assert_eq!(info.stream_index, 11);

        pool.set_location(e, 4, 8, 12);
        let info = pool.get_info(e);
        assert_eq!(info.main_archetype, 4);
        assert_eq!(info.stream_index, 12);
    }

    #[test]
    fn virtual_entities_never_collide_with_live_or_excluded() {
        let mut pool = EntityPool::new(2);
        let live = pool.allocate();
        let excluded = pool.get_virtual_entity(20, &[]);
        let other = pool.get_virtual_entity(20, &[excluded]);
        assert_ne!(excluded, other);
        assert!(!pool.is_valid(excluded));
        assert_ne!(live.index(), excluded.index());
    }

    #[test]
    fn virtual_entity_exhaustion_returns_invalid_instead_of_crashing() {
        let mut pool = EntityPool::new(20);
        let max_value = (1u32 << 16) - 2;
        // Occupy every candidate the search could reach for bit_count = 16
        // with no exclusions (1000 iterations), forcing exhaustion.
        for offset in 0..1000u32 {
            let entity = Entity::new(max_value - offset, 1, 0, 0);
            pool.allocate_specific(entity, EntityInfo::default());
        }
        assert_eq!(pool.get_virtual_entity(16, &[]), Entity::INVALID);
    }

    #[test]
    fn allocate_specific_reconstructs_exact_handle() {
        let mut pool = EntityPool::new(4);
        let entity = Entity::new(37, 5, 0, 0);
        pool.allocate_specific(
            entity,
            EntityInfo {
                main_archetype: 1,
                base_archetype: 2,
                stream_index: 3,
                generation: 5,
                tags: 0,
                layer: 0,
            },
        );
        assert!(pool.is_valid(entity));
        assert_eq!(pool.get_info(entity).stream_index, 3);
    }
}
