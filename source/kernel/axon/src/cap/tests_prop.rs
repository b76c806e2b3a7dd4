// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the capability table
//! OWNERS: @cap-team
//! NOTE: Tests only; no engine logic. Ensures name allocation and release
//!       accounting stay sound under arbitrary interleavings.
//!
//! TEST_SCOPE:
//!   - Derive/release balance: every created entry is removed by exactly as
//!     many releases as references were handed out
//!   - Resolve never returns a right outside the requested kind mask
//!   - Names are never reused while a right is live

use super::{CapTable, ReleaseOutcome, Right, Rights};
use crate::ipc::EndpointHandle;
use proptest::prelude::*;

fn arb_kind() -> impl Strategy<Value = Rights> {
    prop_oneof![
        Just(Rights::SEND),
        Just(Rights::SEND_ONCE),
        Just(Rights::RECEIVE),
    ]
}

proptest! {
    #[test]
    fn resolve_respects_mask(kind in arb_kind(), mask_bits in 0u32..16) {
        let mut table = CapTable::new();
        let name = table.insert(Right::endpoint_right(kind, EndpointHandle::from_raw(1)));
        let mask = Rights::from_bits_truncate(mask_bits);
        let resolved = table.resolve(name, mask);
        prop_assert_eq!(resolved.is_some(), kind.intersects(mask));
    }

    #[test]
    fn derive_release_balances(extra_refs in 0u32..8) {
        let mut table = CapTable::new();
        let endpoint = EndpointHandle::from_raw(9);
        let (name, created) = table.derive(endpoint, Rights::SEND);
        prop_assert!(created);
        for _ in 0..extra_refs {
            let (again, created) = table.derive(endpoint, Rights::SEND);
            prop_assert_eq!(again, name);
            prop_assert!(!created);
        }
        for _ in 0..extra_refs {
            prop_assert!(matches!(table.release(name, Rights::SEND), ReleaseOutcome::StillHeld));
        }
        prop_assert!(matches!(table.release(name, Rights::SEND), ReleaseOutcome::Removed(_)));
        prop_assert!(table.is_empty());
    }

    #[test]
    fn live_names_are_distinct(count in 1usize..32) {
        let mut table = CapTable::new();
        let mut names = std::collections::BTreeSet::new();
        for i in 0..count {
            let name = table.insert(Right::endpoint_right(
                Rights::SEND,
                EndpointHandle::from_raw(i as u64),
            ));
            prop_assert!(names.insert(name), "name {} handed out twice", name);
        }
        prop_assert_eq!(table.len(), count);
    }
}
