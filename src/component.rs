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

//! The component-info collaborator: byte size and optional lifetime
//! callbacks per registered [`Component`](crate::signature::Component).
//!
//! Archetype storage is untyped - every column is a raw byte buffer sized
//! by `ComponentInfo::byte_size`. Most components are `Trivial` (bytewise
//! copy, nothing to do on removal); a component that owns a heap buffer
//! (a string, a growable array) registers a [`ComponentLifecycle`] so
//! `ArchetypeBase`'s swap-back removal and `Archetype::destroy_base` know
//! to run its copy/deallocate path instead of a raw `memcpy`.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::signature::Component;

/// Largest byte size a single component instance may declare. Generous
/// enough for any plain-data component; components needing more should
/// store a handle/pointer-sized value and own their bulk data elsewhere.
pub const MAX_COMPONENT_BYTE_SIZE: usize = 4096;

/// User-supplied copy/deallocate hooks for a non-trivial component.
///
/// `copy` is called whenever a row moves between archetype bases (a
/// shared-instance change, a component add/remove) or an entity is
/// duplicated; `deallocate` is called when a row is removed outright.
/// Implementors must be safe to call from any worker thread - the
/// dispatcher may invoke these from inside a parallel `for_each`.
pub trait ComponentLifecycle: Send + Sync {
    /// Copy one instance from `source` to `destination`. `destination`
    /// is uninitialized memory.
    ///
    /// # Safety
    /// `destination` and `source` must each be valid, non-overlapping
    /// pointers to at least `byte_size` bytes, where `byte_size` is the
    /// value registered alongside this lifecycle in [`ComponentInfo`].
    unsafe fn copy(&self, destination: *mut u8, source: *const u8);

    /// Release any resources owned by the component instance at `data`.
    /// Called once per removed row; the byte storage itself is reclaimed
    /// by the archetype base afterward.
    ///
    /// # Safety
    /// `data` must be a valid pointer to at least `byte_size` bytes
    /// holding a live instance of the component.
    unsafe fn deallocate(&self, data: *mut u8);
}

/// Byte size and lifetime behavior of one registered component type.
#[derive(Clone)]
pub struct ComponentInfo {
    byte_size: usize,
    lifecycle: Option<Arc<dyn ComponentLifecycle>>,
}

impl ComponentInfo {
    /// A plain-data component: rows are moved with `memcpy`, nothing
    /// runs on removal.
    pub fn trivial(byte_size: usize) -> Self {
        crate::ecs_assert!(
            byte_size <= MAX_COMPONENT_BYTE_SIZE,
            "component byte size {byte_size} exceeds the {MAX_COMPONENT_BYTE_SIZE} byte maximum"
        );
        Self {
            byte_size,
            lifecycle: None,
        }
    }

    /// A component with owned state, copied and deallocated through
    /// `lifecycle` instead of a raw byte copy.
    pub fn with_lifecycle(byte_size: usize, lifecycle: Arc<dyn ComponentLifecycle>) -> Self {
        crate::ecs_assert!(
            byte_size <= MAX_COMPONENT_BYTE_SIZE,
            "component byte size {byte_size} exceeds the {MAX_COMPONENT_BYTE_SIZE} byte maximum"
        );
        Self {
            byte_size,
            lifecycle: Some(lifecycle),
        }
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// True if this component has a non-trivial lifecycle, i.e. should be
    /// hoisted into `Archetype::user_defined_components`.
    #[inline]
    pub fn has_lifecycle(&self) -> bool {
        self.lifecycle.is_some()
    }

    /// Copy one instance from `source` to `destination`, dispatching to
    /// the registered lifecycle if any, otherwise a raw byte copy.
    ///
    /// # Safety
    /// `destination` and `source` must be valid, non-overlapping
    /// pointers to at least `self.byte_size()` bytes.
    pub unsafe fn copy(&self, destination: *mut u8, source: *const u8) {
        match &self.lifecycle {
            Some(lifecycle) => unsafe { lifecycle.copy(destination, source) },
            None => unsafe { std::ptr::copy_nonoverlapping(source, destination, self.byte_size) },
        }
    }

    /// Release the instance at `data`, if this component has a
    /// lifecycle; a no-op for `Trivial` components.
    ///
    /// # Safety
    /// `data` must be a valid pointer to at least `self.byte_size()`
    /// bytes holding a live instance.
    pub unsafe fn deallocate(&self, data: *mut u8) {
        if let Some(lifecycle) = &self.lifecycle {
            unsafe { lifecycle.deallocate(data) };
        }
    }
}

/// Registry of [`ComponentInfo`] keyed by [`Component`] id. Populated once
/// at startup by the host; archetype/storage code only ever reads it.
#[derive(Default)]
pub struct ComponentTable {
    infos: FxHashMap<Component, ComponentInfo>,
}

impl ComponentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the info for `component`.
    pub fn register(&mut self, component: Component, info: ComponentInfo) {
        self.infos.insert(component, info);
    }

    pub fn get(&self, component: Component) -> Option<&ComponentInfo> {
        self.infos.get(&component)
    }

    /// Byte size of `component`, crashing if it was never registered -
    /// every component referenced by a live signature must have an
    /// entry, so a miss here is a contract violation, not a query result.
    pub fn byte_size(&self, component: Component) -> usize {
        match self.get(component) {
            Some(info) => info.byte_size(),
            None => crate::error::crash(format!("component {} is not registered", component.0)),
        }
    }

    pub fn is_registered(&self, component: Component) -> bool {
        self.infos.contains_key(&component)
    }
}
