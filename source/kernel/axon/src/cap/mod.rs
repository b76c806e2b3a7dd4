// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task capability table: port rights and port-set rights
//! OWNERS: @cap-team
//! PUBLIC API: Rights, Right, RightName, CapTable, ReleaseOutcome
//! DEPENDS_ON: ipc::{EndpointHandle, WaitChannel}
//! INVARIANTS: Names are opaque, nonzero, unique per table; receive and
//!             port-set rights are consumed whole, never refcounted; a
//!             non-set right always denotes an endpoint

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::ipc::{EndpointHandle, WaitChannel};

bitflags! {
    /// Kind bits of a capability, also usable as a lookup mask.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Rights: u32 {
        /// Permission to send through the endpoint.
        const SEND = 1 << 0;
        /// Permission to send exactly once; consumed by use.
        const SEND_ONCE = 1 << 1;
        /// The exclusive receive side of the endpoint.
        const RECEIVE = 1 << 2;
        /// A port set aggregating receive rights of the same task.
        const PORT_SET = 1 << 3;
    }
}

/// Process-local name of a right. Zero is never a valid name; translated
/// slots whose right vanished carry zero.
pub type RightName = u32;

/// A capability held by one task.
#[derive(Clone, Debug)]
pub struct Right {
    /// Kind of the right (exactly one bit set).
    pub kind: Rights,
    /// Endpoint the right denotes; `None` only for port sets.
    pub endpoint: Option<EndpointHandle>,
    /// Reference count; meaningful for send rights only.
    pub refs: u32,
    /// Member receive-right names; port sets only.
    pub members: Vec<RightName>,
    /// Shared wait channel; port sets only.
    pub channel: Option<Arc<WaitChannel>>,
}

impl Right {
    /// A right of `kind` denoting `endpoint`.
    pub fn endpoint_right(kind: Rights, endpoint: EndpointHandle) -> Self {
        debug_assert_eq!(kind.bits().count_ones(), 1);
        debug_assert!(!kind.contains(Rights::PORT_SET));
        Self { kind, endpoint: Some(endpoint), refs: 1, members: Vec::new(), channel: None }
    }

    /// A port-set right with its shared wait channel.
    pub fn port_set(channel: Arc<WaitChannel>) -> Self {
        Self {
            kind: Rights::PORT_SET,
            endpoint: None,
            refs: 1,
            members: Vec::new(),
            channel: Some(channel),
        }
    }
}

/// Outcome of releasing one reference to a right.
#[derive(Clone, Debug)]
pub enum ReleaseOutcome {
    /// No right under that name matched the mask.
    NotFound,
    /// A reference was dropped but others remain.
    StillHeld,
    /// The right was removed from the table.
    Removed(Right),
}

/// Per-task capability table.
///
/// All mutation is scoped to the owning task; the only cross-task mutation
/// in the engine is the explicit derive performed during delivery, where the
/// caller supplies the target table.
pub struct CapTable {
    rights: BTreeMap<RightName, Right>,
    next_name: RightName,
}

impl Default for CapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { rights: BTreeMap::new(), next_name: 1 }
    }

    fn fresh_name(&mut self) -> RightName {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    /// Returns the right under `name` if its kind intersects `mask`.
    pub fn resolve(&self, name: RightName, mask: Rights) -> Option<&Right> {
        self.rights.get(&name).filter(|right| right.kind.intersects(mask))
    }

    /// Mutable variant of [`Self::resolve`].
    pub fn resolve_mut(&mut self, name: RightName, mask: Rights) -> Option<&mut Right> {
        self.rights.get_mut(&name).filter(|right| right.kind.intersects(mask))
    }

    /// Inserts a right under a fresh name.
    pub fn insert(&mut self, right: Right) -> RightName {
        let name = self.fresh_name();
        self.rights.insert(name, right);
        name
    }

    /// Creates or reuses a right of `kind` bound to `endpoint`.
    ///
    /// An equivalent existing right gains a reference and keeps its name;
    /// otherwise a fresh name is assigned. Returns the name and whether a new
    /// table entry was created (so the caller can adjust the endpoint's
    /// reference count).
    pub fn derive(&mut self, endpoint: EndpointHandle, kind: Rights) -> (RightName, bool) {
        debug_assert_eq!(kind.bits().count_ones(), 1);
        let existing = self
            .rights
            .iter_mut()
            .find(|(_, right)| right.kind == kind && right.endpoint == Some(endpoint));
        if let Some((&name, right)) = existing {
            // Receive is exclusive: deriving it again is a no-op returning
            // the right already held, never a duplicate.
            if kind != Rights::RECEIVE {
                right.refs = right.refs.saturating_add(1);
            }
            return (name, false);
        }
        (self.insert(Right::endpoint_right(kind, endpoint)), true)
    }

    /// Releases one reference to the right under `name`, provided its kind
    /// intersects `mask`. Receive and port-set rights are consumed whole.
    pub fn release(&mut self, name: RightName, mask: Rights) -> ReleaseOutcome {
        let Some(right) = self.rights.get_mut(&name) else {
            return ReleaseOutcome::NotFound;
        };
        if !right.kind.intersects(mask) {
            return ReleaseOutcome::NotFound;
        }
        let consumed_whole = right.kind.intersects(Rights::RECEIVE | Rights::PORT_SET);
        if !consumed_whole && right.refs > 1 {
            right.refs -= 1;
            return ReleaseOutcome::StillHeld;
        }
        match self.rights.remove(&name) {
            Some(removed) => ReleaseOutcome::Removed(removed),
            None => unreachable!("entry vanished while the table was borrowed"),
        }
    }

    /// Removes the right under `name` unconditionally.
    pub fn remove(&mut self, name: RightName) -> Option<Right> {
        self.rights.remove(&name)
    }

    /// Number of rights held.
    pub fn len(&self) -> usize {
        self.rights.len()
    }

    /// `true` when no rights are held.
    pub fn is_empty(&self) -> bool {
        self.rights.is_empty()
    }
}

#[cfg(test)]
mod tests_prop;
