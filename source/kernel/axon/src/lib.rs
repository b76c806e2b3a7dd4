// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability-based message-passing engine (transport core)
//! OWNERS: @ipc-engine-team
//! PUBLIC API: Transport, TransportConfig, MsgArgs; cap, ipc, service, task, vm
//! DEPENDS_ON: axon-abi (wire layout), parking_lot, log
//! INVARIANTS: An endpoint has at most one live receive right system-wide;
//!             queues are FIFO and bounded; all failures surface as
//!             axon_abi::Status codes, never panics
//!
//! The engine moves discrete messages between tasks through endpoints.
//! Messages may carry rights that transfer atomically on delivery and
//! out-of-line payloads copied between address spaces. Sends never block;
//! receives wait with an optional deadline, on a single endpoint or on a
//! port set fanning in several.

#![forbid(unsafe_code)]

pub mod cap;
pub mod ipc;
pub mod service;
pub mod task;
pub mod transport;
pub mod vm;

mod translate;

pub use axon_abi::{MsgHeader, MsgOptions, Status};
pub use transport::{MsgArgs, Transport, TransportConfig};
