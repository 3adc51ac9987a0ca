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

//! Error types and the global crash handler.
//!
//! The engine distinguishes two failure classes: a *contract violation*
//! (stale entity handle, out-of-range row, a query that exceeds the
//! 15-component lane limit) is unrecoverable and goes through [`crash`];
//! a *handle miss* that a caller can legitimately expect (`find_base`,
//! `get_virtual_entity`) is returned as a sentinel or `Option` instead of
//! an error variant.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

/// ECS error type for the recoverable half of the taxonomy: serialization
/// and configuration failures. Contract violations never produce one of
/// these - they go through the crash handler and the process halts.
#[derive(Debug, Clone)]
pub enum EcsError {
    /// A query or signature exceeded [`crate::signature::MAX_COMPONENTS`].
    TooManyComponents { requested: usize, max: usize },

    /// `Archetype::create_base` was given a shared signature whose length
    /// does not match the archetype's shared-component count.
    SharedSignatureMismatch { expected: usize, got: usize },

    /// A component referenced by id has no entry in the component table.
    UnknownComponent(u16),

    /// Binary deserialization read a malformed header or truncated buffer.
    SerializationError(String),

    /// Binary deserialization read a version it does not understand.
    VersionMismatch { expected: u32, found: u32 },

    /// A hierarchy operation would have created a cycle or re-parented a
    /// node onto itself.
    HierarchyError(String),

    /// IO error from a save/load helper.
    IoError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::TooManyComponents { requested, max } => {
                write!(f, "signature has {requested} components, max is {max}")
            }
            EcsError::SharedSignatureMismatch { expected, got } => write!(
                f,
                "shared signature has {got} instances, archetype expects {expected}"
            ),
            EcsError::UnknownComponent(id) => write!(f, "component {id} is not registered"),
            EcsError::SerializationError(msg) => write!(f, "serialization error: {msg}"),
            EcsError::VersionMismatch { expected, found } => {
                write!(f, "version mismatch: expected {expected}, found {found}")
            }
            EcsError::HierarchyError(msg) => write!(f, "hierarchy error: {msg}"),
            EcsError::IoError(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

impl From<std::io::Error> for EcsError {
    fn from(err: std::io::Error) -> Self {
        EcsError::IoError(err.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EcsError>;

/// A crash handler receives the formatted violation message and decides
/// what to do with it. The default handler logs at `error` level (via
/// `tracing` when the `profiling` feature is enabled, `eprintln!`
/// otherwise) and aborts the process.
pub type CrashHandlerFn = fn(&str);

fn default_crash_handler(message: &str) {
    #[cfg(feature = "profiling")]
    tracing::error!(target: "archetype_ecs::crash", "{message}");
    #[cfg(not(feature = "profiling"))]
    eprintln!("archetype_ecs: {message}");
}

static CRASH_HANDLER: RwLock<CrashHandlerFn> = RwLock::new(default_crash_handler);

/// Coordinates concurrent crashes: only the first thread to set this runs
/// the handler; others spin until the process actually halts. Mirrors the
/// in-progress flag / crashing-thread-id pair a process-wide crash path
/// needs to keep a second crash on another thread from racing the first.
static CRASH_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

/// Install a process-wide crash handler, replacing the default
/// log-and-abort behavior. Intended for hosts that want to flush state or
/// write a minidump before the process halts.
pub fn set_crash_handler(handler: CrashHandlerFn) {
    *CRASH_HANDLER.write() = handler;
}

fn thread_numeric_id() -> usize {
    // ThreadId has no stable numeric representation; hash the debug form,
    // which is stable for the process lifetime of the thread.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as usize
}

/// Report a contract violation and halt the process. Never returns.
///
/// Callers format the message with file/function/line context so a single
/// logged line identifies the violator, e.g.:
/// `crash(format!("{}:{}: stale entity {:?}", file!(), line!(), entity))`.
#[cold]
#[inline(never)]
pub fn crash(message: impl AsRef<str>) -> ! {
    let my_id = thread_numeric_id();
    if CRASH_IN_PROGRESS
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        CRASH_THREAD_ID.store(my_id, Ordering::SeqCst);
        let handler = *CRASH_HANDLER.read();
        handler(message.as_ref());
        std::process::abort();
    } else if CRASH_THREAD_ID.load(Ordering::SeqCst) == my_id {
        // Re-entrant crash on the same thread while already crashing -
        // don't recurse into the handler again, just abort.
        std::process::abort();
    } else {
        // A different thread is already tearing the process down.
        loop {
            std::hint::spin_loop();
        }
    }
}

/// Asserts `condition`, crashing with `message` (lazily formatted) if it
/// does not hold. The idiomatic replacement for a `ECS_CRASH_CONDITION`
/// style macro.
#[macro_export]
macro_rules! ecs_assert {
    ($condition:expr, $($arg:tt)*) => {
        if !$condition {
            $crate::error::crash(format!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        let err = EcsError::TooManyComponents {
            requested: 20,
            max: 15,
        };
        assert_eq!(err.to_string(), "signature has 20 components, max is 15");
    }

    #[test]
    fn custom_crash_handler_is_invoked() {
        // We cannot actually crash (it aborts the test process), so this
        // only verifies the handler can be swapped without panicking.
        fn noop_handler(_msg: &str) {}
        set_crash_handler(noop_handler);
        set_crash_handler(default_crash_handler);
    }
}
