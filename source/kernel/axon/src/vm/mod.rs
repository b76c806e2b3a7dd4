// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address-space copy primitives used for out-of-line transfers
//! OWNERS: @runtime
//! PUBLIC API: AddressSpace, SpaceError, MemSpace
//! INVARIANTS: Copies are fallible and surfaced, never silently dropped;
//!             copy_out allocates in the destination space (anywhere policy)

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Allocation granularity for [`MemSpace`] regions.
const PAGE_SIZE: u64 = 0x1000;

/// Errors surfaced by cross-address-space copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceError {
    /// The source range is not mapped in the space.
    BadAddress,
    /// The destination space could not allocate the region.
    NoMemory,
}

impl fmt::Display for SpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddress => f.write_str("address not mapped"),
            Self::NoMemory => f.write_str("out of address space"),
        }
    }
}

/// A task's address space, as seen by the transport.
///
/// The engine only ever copies whole byte ranges in and out; mapping
/// mechanics live with the collaborator implementing this trait.
pub trait AddressSpace: Send + Sync {
    /// Copies `out.len()` bytes starting at `address` out of the space.
    fn copy_in(&self, address: u64, out: &mut [u8]) -> Result<(), SpaceError>;

    /// Allocates a fresh region in the space, copies `bytes` into it, and
    /// returns its address (allocate-anywhere policy).
    fn copy_out(&self, bytes: &[u8]) -> Result<u64, SpaceError>;
}

/// In-memory [`AddressSpace`] used by hosted deployments and tests.
pub struct MemSpace {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    next: AtomicU64,
}

impl MemSpace {
    /// Creates an empty space.
    pub fn new() -> Self {
        Self { regions: Mutex::new(BTreeMap::new()), next: AtomicU64::new(PAGE_SIZE) }
    }

    fn allocate(&self, len: usize) -> u64 {
        let span = (len as u64).div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        self.next.fetch_add(span, Ordering::Relaxed)
    }
}

impl Default for MemSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for MemSpace {
    fn copy_in(&self, address: u64, out: &mut [u8]) -> Result<(), SpaceError> {
        if out.is_empty() {
            return Ok(());
        }
        let regions = self.regions.lock();
        let (&base, region) =
            regions.range(..=address).next_back().ok_or(SpaceError::BadAddress)?;
        let offset = (address - base) as usize;
        let end = offset.checked_add(out.len()).ok_or(SpaceError::BadAddress)?;
        let src = region.get(offset..end).ok_or(SpaceError::BadAddress)?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn copy_out(&self, bytes: &[u8]) -> Result<u64, SpaceError> {
        let address = self.allocate(bytes.len());
        self.regions.lock().insert(address, bytes.to_vec());
        Ok(address)
    }
}
