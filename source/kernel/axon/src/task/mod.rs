// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task registry: per-task capability table and address space
//! OWNERS: @runtime
//! PUBLIC API: TaskId, Task, TaskTable
//! DEPENDS_ON: cap::CapTable, vm::AddressSpace
//! INVARIANTS: A task's capability table is only locked through its own
//!             mutex; the engine never holds two tables' locks at once

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::cap::CapTable;
use crate::ipc::WaitChannel;
use crate::vm::AddressSpace;

/// Identifier of a task (process context) known to the transport.
pub type TaskId = u32;

/// One process context: capability namespace, address space, and the signal
/// state a blocked receive observes.
pub struct Task {
    id: TaskId,
    caps: Mutex<CapTable>,
    space: Arc<dyn AddressSpace>,
    interrupted: AtomicBool,
    /// Channel the task is currently blocked on, if any; lets an interrupt
    /// poke the right sleeper.
    waiting_on: Mutex<Option<Arc<WaitChannel>>>,
}

impl Task {
    fn new(id: TaskId, space: Arc<dyn AddressSpace>) -> Arc<Self> {
        Arc::new(Self {
            id,
            caps: Mutex::new(CapTable::new()),
            space,
            interrupted: AtomicBool::new(false),
            waiting_on: Mutex::new(None),
        })
    }

    /// The task's identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Locks the task's capability table.
    pub fn caps(&self) -> MutexGuard<'_, CapTable> {
        self.caps.lock()
    }

    /// The task's address space.
    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    /// Raises the interrupt signal and wakes the task if it is blocked.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(channel) = self.waiting_on.lock().as_ref() {
            channel.notify();
        }
    }

    /// Consumes a pending interrupt, if any.
    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Registers the channel a receive is about to block on.
    pub fn begin_wait(&self, channel: Arc<WaitChannel>) {
        *self.waiting_on.lock() = Some(channel);
    }

    /// Clears the blocked-on channel after the wait ends.
    pub fn end_wait(&self) {
        *self.waiting_on.lock() = None;
    }
}

/// Registry of all tasks attached to a transport.
pub struct TaskTable {
    tasks: RwLock<Vec<Arc<Task>>>,
}

impl TaskTable {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { tasks: RwLock::new(Vec::new()) }
    }

    /// Registers a task over `space` and returns its id.
    pub fn create(&self, space: Arc<dyn AddressSpace>) -> TaskId {
        let mut tasks = self.tasks.write();
        let id = tasks.len() as TaskId;
        tasks.push(Task::new(id, space));
        id
    }

    /// Looks a task up by id.
    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.read().get(id as usize).cloned()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}
