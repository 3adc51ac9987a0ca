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

//! Columnar storage for one archetype base: a parallel `entities` array
//! and one raw byte buffer per unique component, all the same row count.
//!
//! `ArchetypeBase` knows nothing about shared components or which base
//! it belongs to - that bookkeeping lives in [`crate::archetype::Archetype`].
//! It only owns contiguous bytes and moves them around on request.

use crate::component::ComponentTable;
use crate::entity::Entity;
use crate::signature::{Component, ComponentSignature};

/// One archetype base: columnar component storage plus the parallel
/// entity array, all the same length (`row_count`).
pub struct ArchetypeBase {
    components: ComponentSignature,
    columns: Vec<Vec<u8>>,
    entities: Vec<Entity>,
}

impl ArchetypeBase {
    pub fn new(components: ComponentSignature) -> Self {
        let columns = vec![Vec::new(); components.len()];
        Self {
            components,
            columns,
            entities: Vec::new(),
        }
    }

    #[inline]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    #[inline]
    pub fn row_count(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn column_index_of(&self, component: Component) -> Option<usize> {
        self.components.iter().position(|&c| c == component)
    }

    /// Reserve room for `additional` more rows across every column.
    pub fn reserve(&mut self, additional: usize, table: &ComponentTable) {
        self.entities.reserve(additional);
        for (column, &component) in self.components.iter().enumerate() {
            let size = table.byte_size(component);
            self.columns[column].reserve(additional * size);
        }
    }

    /// Append a new, zero-initialized row for `entity` and return its
    /// row index. Callers fill in component bytes afterward via
    /// [`Self::component_ptr_mut`].
    pub fn add_entity(&mut self, entity: Entity, table: &ComponentTable) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        for (column, &component) in self.components.iter().enumerate() {
            let size = table.byte_size(component);
            self.columns[column].resize(self.columns[column].len() + size, 0);
        }
        row
    }

    fn assert_row_in_range(&self, row: usize) {
        crate::ecs_assert!(
            row < self.entities.len(),
            "archetype base row {row} out of range ({} rows)",
            self.entities.len()
        );
    }

    /// Raw pointer to `row`'s instance of the component at `column`.
    pub fn component_ptr(&self, row: usize, column: usize, table: &ComponentTable) -> *const u8 {
        self.assert_row_in_range(row);
        let size = table.byte_size(self.components[column]);
        unsafe { self.columns[column].as_ptr().add(row * size) }
    }

    /// Mutable raw pointer to `row`'s instance of the component at `column`.
    pub fn component_ptr_mut(&mut self, row: usize, column: usize, table: &ComponentTable) -> *mut u8 {
        self.assert_row_in_range(row);
        let size = table.byte_size(self.components[column]);
        unsafe { self.columns[column].as_mut_ptr().add(row * size) }
    }

    /// Mutable pointer to `row`'s instance of `column`, obtained through a
    /// shared reference. Used by the for-each dispatcher, whose worker
    /// tasks only ever hold a shared reference to the archetype they scan
    /// and write through the query's declared write-access columns.
    ///
    /// # Safety
    /// The caller must ensure no other code concurrently reads or writes
    /// the same `(row, column)` while the returned pointer is live.
    pub unsafe fn component_ptr_raw(&self, row: usize, column: usize, table: &ComponentTable) -> *mut u8 {
        self.component_ptr(row, column, table) as *mut u8
    }

    /// Remove `row`, running each component's deallocate hook first, then
    /// swapping the last row down into its place. Returns the entity that
    /// now occupies `row` after the swap, or `None` if `row` was last.
    pub fn remove_swap_back(&mut self, row: usize, table: &ComponentTable) -> Option<Entity> {
        self.assert_row_in_range(row);
        let last = self.entities.len() - 1;

        for (column, &component) in self.components.iter().enumerate() {
            let info = table.get(component);
            let size = table.byte_size(component);
            let ptr = unsafe { self.columns[column].as_mut_ptr().add(row * size) };
            if let Some(info) = info {
                unsafe { info.deallocate(ptr) };
            }
        }

        if row != last {
            for (column, &component) in self.components.iter().enumerate() {
                let size = table.byte_size(component);
                unsafe {
                    let base = self.columns[column].as_mut_ptr();
                    let src = base.add(last * size);
                    let dst = base.add(row * size);
                    std::ptr::copy_nonoverlapping(src, dst, size);
                }
            }
            self.entities[row] = self.entities[last];
        }

        self.entities.pop();
        for (column, &component) in self.components.iter().enumerate() {
            let size = table.byte_size(component);
            let new_len = self.columns[column].len() - size;
            self.columns[column].truncate(new_len);
        }

        if row != last {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Copy `row`'s components shared by column id into `destination`'s
    /// newly added `destination_row`. Columns present in `self` but not in
    /// `destination` are left untouched (the caller is moving to a base
    /// with a different component set).
    pub fn copy_row_into(
        &self,
        row: usize,
        destination: &mut ArchetypeBase,
        destination_row: usize,
        table: &ComponentTable,
    ) {
        self.assert_row_in_range(row);
        destination.assert_row_in_range(destination_row);
        for (column, &component) in self.components.iter().enumerate() {
            let Some(dest_column) = destination.column_index_of(component) else {
                continue;
            };
            let size = table.byte_size(component);
            let src = unsafe { self.columns[column].as_ptr().add(row * size) };
            let dst = unsafe {
                destination.columns[dest_column]
                    .as_mut_ptr()
                    .add(destination_row * size)
            };
            match table.get(component) {
                Some(info) => unsafe { info.copy(dst, src) },
                None => unsafe { std::ptr::copy_nonoverlapping(src, dst, size) },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentInfo;
    use crate::signature::ComponentSignature;

    fn table_with(sizes: &[(u16, usize)]) -> ComponentTable {
        let mut table = ComponentTable::new();
        for &(id, size) in sizes {
            table.register(Component(id), ComponentInfo::trivial(size));
        }
        table
    }

    fn signature(ids: &[u16]) -> ComponentSignature {
        ids.iter().map(|&id| Component(id)).collect()
    }

    #[test]
    fn add_and_read_back_component_bytes() {
        let table = table_with(&[(1, 4)]);
        let mut base = ArchetypeBase::new(signature(&[1]));
        let entity = Entity::new(0, 1, 0, 0);
        let row = base.add_entity(entity, &table);
        unsafe {
            let ptr = base.component_ptr_mut(row, 0, &table) as *mut u32;
            *ptr = 0xCAFEBABEu32;
        }
        let read = unsafe { *(base.component_ptr(row, 0, &table) as *const u32) };
        assert_eq!(read, 0xCAFEBABE);
    }

    #[test]
    fn remove_swap_back_moves_last_row_down() {
        let table = table_with(&[(1, 4)]);
        let mut base = ArchetypeBase::new(signature(&[1]));
        let e0 = Entity::new(0, 1, 0, 0);
        let e1 = Entity::new(1, 1, 0, 0);
        let e2 = Entity::new(2, 1, 0, 0);
        for (i, e) in [e0, e1, e2].into_iter().enumerate() {
            let row = base.add_entity(e, &table);
            unsafe {
                *(base.component_ptr_mut(row, 0, &table) as *mut u32) = i as u32;
            }
        }

        let moved = base.remove_swap_back(0, &table);
        assert_eq!(moved, Some(e2));
        assert_eq!(base.row_count(), 2);
        assert_eq!(base.entities()[0], e2);
        let value = unsafe { *(base.component_ptr(0, 0, &table) as *const u32) };
        assert_eq!(value, 2);
    }

    #[test]
    fn removing_last_row_reports_no_swap() {
        let table = table_with(&[(1, 4)]);
        let mut base = ArchetypeBase::new(signature(&[1]));
        let e0 = Entity::new(0, 1, 0, 0);
        base.add_entity(e0, &table);
        assert_eq!(base.remove_swap_back(0, &table), None);
        assert_eq!(base.row_count(), 0);
    }

    #[test]
    fn copy_row_into_only_copies_shared_columns() {
        let table = table_with(&[(1, 4), (2, 4)]);
        let mut source = ArchetypeBase::new(signature(&[1, 2]));
        let mut dest = ArchetypeBase::new(signature(&[1]));

        let entity = Entity::new(0, 1, 0, 0);
        let src_row = source.add_entity(entity, &table);
        unsafe {
            *(source.component_ptr_mut(src_row, 0, &table) as *mut u32) = 7;
            *(source.component_ptr_mut(src_row, 1, &table) as *mut u32) = 9;
        }

        let dest_row = dest.add_entity(entity, &table);
        source.copy_row_into(src_row, &mut dest, dest_row, &table);

        let value = unsafe { *(dest.component_ptr(dest_row, 0, &table) as *const u32) };
        assert_eq!(value, 7);
    }
}
