// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Dispatcher table for kernel-handled endpoints
//! OWNERS: @runtime
//! PUBLIC API: ServiceTable, ServiceEntry, ServiceArgs, ServiceHandler
//! DEPENDS_ON: task::TaskId, axon_abi::Status
//! INVARIANTS: The table is built at startup and immutable afterwards;
//!             request/reply length bounds are enforced by the transport
//!             before a handler runs

use axon_abi::Status;

use crate::task::TaskId;

/// Arguments handed to a service routine.
pub struct ServiceArgs<'a> {
    /// Task that sent the request.
    pub caller: TaskId,
    /// Task the target endpoint designates (the caller when unset).
    pub target: TaskId,
    /// Validated request bytes (header + body).
    pub request: &'a [u8],
    /// Reply buffer, sized to the entry's declared maximum. Empty on the
    /// no-reply path.
    pub reply: &'a mut [u8],
    /// In/out: capacity on entry, actual reply length on exit.
    pub reply_len: &'a mut usize,
}

/// A service routine invoked synchronously on behalf of a kernel-handled
/// endpoint. The returned status is propagated to the sender verbatim.
pub type ServiceHandler = fn(&mut ServiceArgs<'_>) -> Status;

/// One dispatcher registration.
#[derive(Clone)]
pub struct ServiceEntry {
    /// Message id the entry answers.
    pub id: u32,
    /// Routine name, for diagnostics only.
    pub name: &'static str,
    /// Smallest request (header + body) the handler accepts, in bytes.
    pub min_request_len: usize,
    /// Largest reply the handler may produce, in bytes.
    pub max_reply_len: usize,
    /// The routine itself.
    pub handler: ServiceHandler,
}

/// Lookup table mapping message ids to service routines.
///
/// Built once at transport construction; lookups are read-only afterwards,
/// so no locking is needed at call time.
#[derive(Default)]
pub struct ServiceTable {
    entries: Vec<ServiceEntry>,
}

impl ServiceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registers an entry. Ids must be unique.
    pub fn register(&mut self, entry: ServiceEntry) {
        debug_assert!(
            self.lookup(entry.id).is_none(),
            "duplicate service id {}",
            entry.id
        );
        self.entries.push(entry);
    }

    /// Finds the entry answering `id`.
    pub fn lookup(&self, id: u32) -> Option<&ServiceEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Number of registered routines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no routines are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
