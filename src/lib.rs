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

//! Archetype ECS - a columnar entity-component store with SIMD signature
//! matching, a shared-component axis, an incrementally maintained query
//! cache, and a for-each dispatcher that fans work across a thread pool.

pub mod archetype;
pub mod command;
pub mod component;
pub mod entity;
pub mod error;
pub mod hierarchy;
pub mod parallel;
pub mod query;
pub mod serialization;
pub mod signature;
pub mod simd;
pub mod storage;
pub mod world;

pub mod prelude;

pub use archetype::Archetype;
pub use command::{Command, CommandBuffer};
pub use component::{ComponentInfo, ComponentLifecycle, ComponentTable};
pub use entity::{Entity, EntityInfo, EntityPool};
pub use error::{EcsError, Result};
pub use hierarchy::{ChangeSet, EntityHierarchy};
pub use parallel::{for_each, for_each_selection, for_each_selection_grouped, ForEachContext, SelectionContext};
pub use query::{ArchetypeQueryCache, QueryDescription, QueryHandle};
pub use signature::{Component, SharedInstance};
pub use world::{EntityManager, EntityManagerConfig};
