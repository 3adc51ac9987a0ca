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

//! Binary snapshot of the entity pool.
//!
//! Every record is tightly packed in the order `EntityInfo` declares its
//! fields, with the originating `Entity` handle's index/generation
//! trailing each record so a snapshot can be replayed without touching
//! archetype storage. Hierarchy serialization lives alongside
//! [`crate::hierarchy::EntityHierarchy`] instead, since it needs the node
//! arena's own key space.

use crate::entity::{Entity, EntityInfo, EntityPool};
use crate::error::{EcsError, Result};

const VERSION: u32 = 0;
const RECORD_SIZE: usize = 1 + 1 + 2 + 2 + 2 + 4 + 4 + 1;

fn truncated() -> EcsError {
    EcsError::SerializationError("truncated entity pool buffer".into())
}

/// Pack every live entity in `pool` into the layout described by the
/// entity manager's serialization interface.
pub fn serialize_entity_pool(pool: &EntityPool) -> Vec<u8> {
    let live: Vec<Entity> = pool.iter_live().collect();
    let mut out = Vec::with_capacity(8 + live.len() * RECORD_SIZE);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(live.len() as u32).to_le_bytes());

    for entity in live {
        let info = pool
            .try_get_info(entity)
            .expect("entity yielded by iter_live must have a live info slot");
        out.push(entity.generation());
        out.push(entity.tags());
        out.extend_from_slice(&entity.layer().to_le_bytes());
        out.extend_from_slice(&info.main_archetype.to_le_bytes());
        out.extend_from_slice(&info.base_archetype.to_le_bytes());
        out.extend_from_slice(&info.stream_index.to_le_bytes());
        out.extend_from_slice(&entity.index().to_le_bytes());
        out.push(entity.generation());
    }
    out
}

/// Rebuild an entity pool from a snapshot produced by
/// [`serialize_entity_pool`]. `chunk_power` need not match the pool that
/// produced the snapshot; it only affects how the reconstructed pool lays
/// out future allocations.
pub fn deserialize_entity_pool(bytes: &[u8], chunk_power: u32) -> Result<EntityPool> {
    if bytes.len() < 8 {
        return Err(truncated());
    }
    let version = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if version != VERSION {
        return Err(EcsError::VersionMismatch {
            expected: VERSION,
            found: version,
        });
    }
    let entity_count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;

    let mut pool = EntityPool::new(chunk_power);
    let mut cursor = 8usize;
    for _ in 0..entity_count {
        if cursor + RECORD_SIZE > bytes.len() {
            return Err(truncated());
        }
        let generation = bytes[cursor];
        let tags = bytes[cursor + 1];
        let layer = u16::from_le_bytes(bytes[cursor + 2..cursor + 4].try_into().unwrap());
        let main_archetype = u16::from_le_bytes(bytes[cursor + 4..cursor + 6].try_into().unwrap());
        let base_archetype = u16::from_le_bytes(bytes[cursor + 6..cursor + 8].try_into().unwrap());
        let stream_index = u32::from_le_bytes(bytes[cursor + 8..cursor + 12].try_into().unwrap());
        let index = u32::from_le_bytes(bytes[cursor + 12..cursor + 16].try_into().unwrap());
        let trailing_generation = bytes[cursor + 16];
        cursor += RECORD_SIZE;

        if trailing_generation != generation {
            return Err(EcsError::SerializationError(
                "entity pool record has mismatched leading/trailing generation".into(),
            ));
        }

        let entity = Entity::new(index, generation, tags, layer);
        let info = EntityInfo {
            main_archetype,
            base_archetype,
            stream_index,
            generation,
            tags,
            layer,
        };
        pool.allocate_specific(entity, info);
    }

    Ok(pool)
}
