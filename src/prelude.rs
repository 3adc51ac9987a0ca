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

//! Convenient re-exports of commonly used types.
//!
//! ```
//! use archetype_ecs::prelude::*;
//! ```

pub use crate::command::{Command, CommandBuffer};
pub use crate::component::{ComponentInfo, ComponentLifecycle, ComponentTable};
pub use crate::entity::{Entity, EntityInfo, EntityPool};
pub use crate::error::{EcsError, Result};
pub use crate::hierarchy::{ChangeSet, EntityHierarchy};
pub use crate::parallel::{for_each, for_each_selection, for_each_selection_grouped, ForEachContext, SelectionContext};
pub use crate::query::{ArchetypeQueryCache, QueryDescription, QueryHandle};
pub use crate::signature::{Component, SharedInstance};
pub use crate::world::{EntityManager, EntityManagerConfig};
