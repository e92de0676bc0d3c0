//! Collaborator boundary for a real loader.
//!
//! `polyunwind-common::introspection::IntrospectionSource` and
//! `polyunwind-common::memory::Tables` are the two traits a loader
//! implements to keep per-PID offsets and the lookup tables populated —
//! the process-introspection offset extraction and BPF map plumbing
//! themselves are both out of scope here. [`InMemorySource`] is a minimal,
//! real (not test-only) implementation of the first, useful for a loader
//! that wants to stage snapshots before pushing them into a BPF map, or for
//! driving the `replay` subcommand against a recorded session.

use std::collections::HashMap;

use polyunwind_common::introspection::{IntrospectionSource, Snapshot};

/// Keeps the latest snapshot per PID, bumping the generation counter on
/// every reinstall so a concurrent reader can detect a stale read.
#[derive(Default)]
pub struct InMemorySource<T> {
    table: HashMap<u32, Snapshot<T>>,
    next_generation: u32,
}

impl<T> InMemorySource<T> {
    pub fn new() -> Self {
        Self { table: HashMap::new(), next_generation: 0 }
    }
}

impl<T: Copy> IntrospectionSource<T> for InMemorySource<T> {
    fn install(&mut self, pid: u32, record: T) {
        self.next_generation += 1;
        self.table.insert(pid, Snapshot { generation: self.next_generation, record });
    }

    fn invalidate(&mut self, pid: u32) {
        self.table.remove(&pid);
    }

    fn lookup(&self, pid: u32) -> Option<Snapshot<T>> {
        self.table.get(&pid).copied()
    }
}
