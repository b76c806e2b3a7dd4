// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Low-noise, bounded IPC trace ring for transport triage
//! OWNERS: @ipc-engine-team
//! STATUS: Diagnostic only
//!
//! This module is intentionally tiny:
//! - Records a fixed number of transport events in memory.
//! - Emits nothing unless explicitly dumped.
//! - Is fire-and-forget: recording never affects transport control flow.

use parking_lot::Mutex;

#[derive(Clone, Copy)]
struct TraceEvent {
    seq: u32,
    kind: u8,
    status: u32,
    ep: u32,
    len: u32,
    extra: u32,
}

impl TraceEvent {
    const fn empty() -> Self {
        Self { seq: 0, kind: 0, status: 0, ep: 0, len: 0, extra: 0 }
    }
}

const KIND_SEND: u8 = 1;
const KIND_RECV: u8 = 2;
const KIND_XLATE: u8 = 3;
const KIND_EP_CREATE: u8 = 4;
const KIND_EP_CLOSE: u8 = 5;

// Power-of-two ring size for cheap masking.
const RING_SIZE: usize = 256;
const RING_MASK: usize = RING_SIZE - 1;

struct TraceRing {
    seq: u32,
    events: [TraceEvent; RING_SIZE],
}

impl TraceRing {
    const fn new() -> Self {
        Self { seq: 0, events: [TraceEvent::empty(); RING_SIZE] }
    }

    fn push(&mut self, mut event: TraceEvent) {
        event.seq = self.seq;
        self.events[self.seq as usize & RING_MASK] = event;
        self.seq = self.seq.wrapping_add(1);
    }
}

static RING: Mutex<TraceRing> = Mutex::new(TraceRing::new());

fn push(event: TraceEvent) {
    RING.lock().push(event);
}

/// Records a send attempt (`status` 0 means success).
pub fn record_send(task: u32, ep: u32, len: usize, status: u32) {
    push(TraceEvent {
        kind: KIND_SEND,
        status,
        ep,
        len: len as u32,
        extra: task,
        ..TraceEvent::empty()
    });
}

/// Records a receive completion (`status` 0 means success).
pub fn record_recv(task: u32, ep: u32, len: usize, status: u32) {
    push(TraceEvent {
        kind: KIND_RECV,
        status,
        ep,
        len: len as u32,
        extra: task,
        ..TraceEvent::empty()
    });
}

/// Records a rights-translation pass over a delivered message.
pub fn record_translate(receiver: u32, ep: u32, descriptors: u32, status: u32) {
    push(TraceEvent {
        kind: KIND_XLATE,
        status,
        ep,
        len: descriptors,
        extra: receiver,
        ..TraceEvent::empty()
    })
}

/// Records endpoint creation.
pub fn record_ep_create(ep: u32) {
    push(TraceEvent { kind: KIND_EP_CREATE, ep, ..TraceEvent::empty() })
}

/// Records endpoint death, with the number of drained messages.
pub fn record_ep_close(ep: u32, drained: usize) {
    push(TraceEvent { kind: KIND_EP_CLOSE, ep, len: drained as u32, ..TraceEvent::empty() })
}

/// Fire-and-forget dump of raw message bytes, mirroring the legacy message
/// ktrace hook. Never consulted by control flow.
pub fn trace_msg_bytes(direction: &str, bytes: &[u8]) {
    if log::log_enabled!(log::Level::Trace) {
        let id = axon_abi::MsgHeader::parse(bytes).map(|h| h.id).unwrap_or(0);
        log::trace!(target: "axon::msg", "{} id={} len={}", direction, id, bytes.len());
    }
}

/// Dumps the most recent events through the `log` facade.
pub fn dump(tag: &str) {
    let ring = RING.lock();
    let end = ring.seq;
    let span = (RING_SIZE as u32).min(end);
    log::debug!(target: "axon::trace", "IPC-TRACE dump tag={tag}");
    for seq in end.wrapping_sub(span)..end {
        let event = ring.events[seq as usize & RING_MASK];
        if event.seq != seq {
            continue;
        }
        let kind = match event.kind {
            KIND_SEND => "send",
            KIND_RECV => "recv",
            KIND_XLATE => "xlate",
            KIND_EP_CREATE => "epnew",
            KIND_EP_CLOSE => "epclose",
            _ => "unk",
        };
        log::debug!(
            target: "axon::trace",
            "IPC-TRACE {} seq={:#x} ep={:#x} len={:#x} st={:#x} x={:#x}",
            kind,
            event.seq,
            event.ep,
            event.len,
            event.status,
            event.extra
        );
    }
}
