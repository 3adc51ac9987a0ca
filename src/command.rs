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

//! Deferred mutation, collected from worker threads during a parallel
//! `for_each` and applied single-threaded afterward.
//!
//! A for-each functor running on a worker must not mutate the entity
//! manager directly - archetype structure can't change underneath a
//! running dispatch. Instead it pushes a [`Command`] into its task's
//! buffer; the dispatcher drains every buffer on the calling thread once
//! the parallel-for completes.

use crate::entity::Entity;
use crate::error::Result;
use crate::world::EntityManager;

/// A world mutation deferred until after a dispatch completes.
pub type CommandClosure = Box<dyn FnOnce(&mut EntityManager) -> Result<()> + Send>;

pub enum Command {
    Despawn(Entity),
    Custom(CommandClosure),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Despawn(e) => f.debug_tuple("Despawn").field(e).finish(),
            Command::Custom(_) => write!(f, "Custom(...)"),
        }
    }
}

/// One worker task's deferred commands. Cheap to create per task; the
/// dispatcher hands these out from scratch storage and drains them after
/// the parallel-for joins.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    pub fn despawn(&mut self, entity: Entity) {
        self.commands.push(Command::Despawn(entity));
    }

    /// Queue an arbitrary mutation of the entity manager.
    pub fn add<F>(&mut self, f: F)
    where
        F: FnOnce(&mut EntityManager) -> Result<()> + Send + 'static,
    {
        self.commands.push(Command::Custom(Box::new(f)));
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Move every command out of `other` and onto the end of `self`,
    /// preserving relative order. Used to merge per-task buffers collected
    /// from a parallel dispatch back onto the caller's thread.
    pub fn extend(&mut self, mut other: CommandBuffer) {
        self.commands.extend(other.commands.drain(..));
    }

    /// Drain into a flat list of commands, in push order, without
    /// applying them. Used by the dispatcher to merge several tasks'
    /// buffers before a single-threaded apply pass.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Command> {
        self.commands.drain(..)
    }
}

/// Apply every command in `buffer` against `manager`, in order, then
/// clear it.
pub fn apply(buffer: &mut CommandBuffer, manager: &mut EntityManager) -> Result<()> {
    for command in buffer.commands.drain(..) {
        match command {
            Command::Despawn(entity) => manager.despawn(entity)?,
            Command::Custom(f) => f(manager)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_tracks_length_and_clears() {
        let mut buffer = CommandBuffer::new();
        assert!(buffer.is_empty());
        buffer.despawn(Entity::new(0, 1, 0, 0));
        assert_eq!(buffer.len(), 1);
        buffer.clear();
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn custom_commands_run_in_push_order() {
        let mut buffer = CommandBuffer::new();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            buffer.add(move |_manager| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        let mut manager = EntityManager::new();
        apply(&mut buffer, &mut manager).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
