// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Endpoints, bounded message queues, and receiver wait channels
//! OWNERS: @ipc-engine-team
//! PUBLIC API: EndpointHandle, Endpoint, EndpointTable, WaitChannel, QueuedMsg
//! DEPENDS_ON: task::TaskId, parking_lot
//! INVARIANTS: Queue length equals the pending count by construction; handles
//!             are generation-checked so stale ones never reach freed state;
//!             a dead endpoint wakes every waiter exactly once

pub mod trace;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axon_abi::{MsgHeader, STUB_REPLY_LEN};
use parking_lot::{Condvar, Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::task::Task;
use crate::task::TaskId;

/// Generation-checked handle addressing an endpoint arena slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointHandle {
    index: u32,
    generation: u32,
}

impl EndpointHandle {
    /// Packs the handle into a single word (generation in the high half).
    pub const fn as_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpacks a handle previously produced by [`Self::as_raw`].
    pub const fn from_raw(raw: u64) -> Self {
        Self { index: raw as u32, generation: (raw >> 32) as u32 }
    }

    /// Arena slot index, for diagnostics.
    pub const fn index(self) -> u32 {
        self.index
    }
}

/// Outcome of a timed wait on a [`WaitChannel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The channel was signalled after the snapshot was taken.
    Notified,
    /// The deadline passed without a signal.
    TimedOut,
}

/// Condition-variable wake-up channel shared by blocked receivers.
///
/// A receive right waits on its endpoint's channel; joining a port set swaps
/// the endpoint over to the set's channel so one blocked receiver serves
/// every member. Senders signal unconditionally after enqueuing.
#[derive(Debug)]
pub struct WaitChannel {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl WaitChannel {
    /// Creates a fresh channel.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { seq: Mutex::new(0), cond: Condvar::new() })
    }

    /// Snapshots the signal counter. Take the snapshot *before* scanning
    /// queues so a send landing mid-scan is never lost.
    pub fn snapshot(&self) -> u64 {
        *self.seq.lock()
    }

    /// Signals every waiter.
    pub fn notify(&self) {
        let mut seq = self.seq.lock();
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until the channel is signalled past `token` or `deadline`
    /// passes (`None` waits indefinitely).
    pub fn wait_from(&self, token: u64, deadline: Option<Instant>) -> WaitOutcome {
        let mut seq = self.seq.lock();
        loop {
            if *seq != token {
                return WaitOutcome::Notified;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut seq, deadline).timed_out() {
                        return if *seq != token {
                            WaitOutcome::Notified
                        } else {
                            WaitOutcome::TimedOut
                        };
                    }
                }
                None => self.cond.wait(&mut seq),
            }
        }
    }
}

/// A message held by an endpoint queue: the engine-owned byte copy plus the
/// sending task, kept alive for rights translation at delivery. Kernel
/// replies carry no sender and skip translation.
pub struct QueuedMsg {
    /// Owned header+body bytes.
    pub bytes: Vec<u8>,
    /// Sending task context, `None` for kernel-synthesised replies.
    pub sender: Option<Arc<Task>>,
}

/// Result of a dequeue attempt on behalf of a receiver.
pub enum Dequeue {
    /// Nothing queued (either never was, or another thread won the race).
    Empty,
    /// The head message, removed from the queue.
    Delivered(QueuedMsg),
    /// Head exceeded the caller's capacity and was destroyed (allow-large
    /// flag absent). Carries the destroyed message's size.
    TooLargeDestroyed {
        /// Size in bytes of the message that was dropped.
        size: usize,
    },
    /// Head exceeds the caller's capacity but stays queued; the stub tells
    /// the caller how big a retry buffer must be.
    TooLargeStub {
        /// Header+trailer stub to copy out.
        stub: [u8; STUB_REPLY_LEN],
    },
}

/// Error returned when an enqueue is refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// The endpoint died; no further messages are accepted.
    PortDead,
    /// The queue is at its configured depth.
    Full,
}

struct EndpointState {
    queue: VecDeque<QueuedMsg>,
    receiver: Option<TaskId>,
    dead: bool,
    /// Channel signalled on enqueue: the endpoint's own channel, or the
    /// containing set's channel while the receive right is a set member.
    wakeup: Arc<WaitChannel>,
}

/// A mailbox: bounded FIFO queue plus its exclusive receive side.
pub struct Endpoint {
    handle: EndpointHandle,
    kernel_handled: bool,
    kernel_target: Option<TaskId>,
    depth: usize,
    /// Outstanding rights denoting this endpoint, across all tasks.
    refs: AtomicUsize,
    own_channel: Arc<WaitChannel>,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    fn new(
        handle: EndpointHandle,
        depth: usize,
        kernel_handled: bool,
        kernel_target: Option<TaskId>,
    ) -> Arc<Self> {
        let own_channel = WaitChannel::new();
        Arc::new(Self {
            handle,
            kernel_handled,
            kernel_target,
            depth,
            refs: AtomicUsize::new(0),
            own_channel: own_channel.clone(),
            state: RwLock::new(EndpointState {
                queue: VecDeque::new(),
                receiver: None,
                dead: false,
                wakeup: own_channel,
            }),
        })
    }

    /// The arena handle this endpoint lives under.
    pub fn handle(&self) -> EndpointHandle {
        self.handle
    }

    /// `true` when sends are serviced synchronously by the dispatcher
    /// instead of queueing.
    pub fn is_kernel_handled(&self) -> bool {
        self.kernel_handled
    }

    /// Task a kernel-handled endpoint designates as the handler target.
    pub fn kernel_target(&self) -> Option<TaskId> {
        self.kernel_target
    }

    /// Number of queued messages (shared-lock peek).
    pub fn pending(&self) -> usize {
        self.state.read().queue.len()
    }

    /// `true` while a receive right is bound to this endpoint.
    pub fn has_receiver(&self) -> bool {
        self.state.read().receiver.is_some()
    }

    /// `true` once the endpoint has been killed.
    pub fn is_dead(&self) -> bool {
        self.state.read().dead
    }

    /// Channel a receiver should wait on right now.
    pub fn wakeup_channel(&self) -> Arc<WaitChannel> {
        self.state.read().wakeup.clone()
    }

    /// Binds the exclusive receive side to `task`.
    pub fn bind_receiver(&self, task: TaskId) {
        self.state.write().receiver = Some(task);
    }

    /// Routes wake-ups to `channel` (the containing set's) instead of the
    /// endpoint's own. Fails when already routed to a set.
    pub fn join_set(&self, channel: Arc<WaitChannel>) -> bool {
        let mut state = self.state.write();
        if !Arc::ptr_eq(&state.wakeup, &self.own_channel) {
            return false;
        }
        state.wakeup = channel;
        true
    }

    /// Restores wake-ups to the endpoint's own channel.
    pub fn leave_set(&self) {
        let mut state = self.state.write();
        state.wakeup = self.own_channel.clone();
    }

    /// Appends a message, returning the channel to signal on success.
    ///
    /// The caller signals *after* releasing its own bookkeeping, matching
    /// the enqueue-then-wake order of the send path.
    pub fn enqueue(&self, msg: QueuedMsg) -> Result<Arc<WaitChannel>, EnqueueError> {
        let mut state = self.state.write();
        if state.dead {
            return Err(EnqueueError::PortDead);
        }
        if state.queue.len() >= self.depth {
            return Err(EnqueueError::Full);
        }
        state.queue.push_back(msg);
        Ok(state.wakeup.clone())
    }

    /// Dequeues the head message for a receiver with `capacity` bytes.
    ///
    /// Peeks under an upgradable read lock and upgrades only for removal, so
    /// set scans peeking other queues are not blocked by the slow paths.
    pub fn dequeue_for_receive(&self, capacity: usize, allow_large: bool) -> Dequeue {
        let state = self.state.upgradable_read();
        let Some(front) = state.queue.front() else {
            return Dequeue::Empty;
        };
        let size = front.bytes.len();
        if size > capacity {
            if allow_large {
                // Leave the message queued; the caller retries with a buffer
                // sized from the stub's header.
                let Some(header) = MsgHeader::parse(&front.bytes) else {
                    return Dequeue::Empty;
                };
                return Dequeue::TooLargeStub { stub: axon_abi::encode_stub_reply(&header) };
            }
            let mut state = RwLockUpgradableReadGuard::upgrade(state);
            state.queue.pop_front();
            return Dequeue::TooLargeDestroyed { size };
        }
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        match state.queue.pop_front() {
            Some(msg) => Dequeue::Delivered(msg),
            None => Dequeue::Empty,
        }
    }

    /// Puts a message back at the head after a failed delivery, so the queue
    /// is left as if the receive never happened.
    pub fn requeue_front(&self, msg: QueuedMsg) {
        self.state.write().queue.push_front(msg);
    }

    /// Kills the endpoint: drops the receiver binding, drains the queue, and
    /// wakes every waiter so blocked receivers observe the death.
    pub fn kill(&self) -> usize {
        let drained = {
            let mut state = self.state.write();
            state.dead = true;
            state.receiver = None;
            let drained = state.queue.len();
            state.queue.clear();
            state.wakeup.notify();
            drained
        };
        trace::record_ep_close(self.handle.index(), drained);
        drained
    }

    /// Records one more right denoting this endpoint.
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one right reference, returning how many remain.
    pub fn release(&self) -> usize {
        let prev = self.refs.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "endpoint reference count underflow");
        prev - 1
    }
}

struct ArenaSlot {
    generation: u32,
    entry: Option<Arc<Endpoint>>,
}

/// Arena owning every endpoint, addressed by generation-checked handles.
pub struct EndpointTable {
    depth: usize,
    slots: RwLock<Vec<ArenaSlot>>,
}

impl EndpointTable {
    /// Creates an empty arena whose endpoints queue up to `depth` messages.
    pub fn new(depth: usize) -> Self {
        Self { depth, slots: RwLock::new(Vec::new()) }
    }

    /// Allocates an endpoint, reusing a freed slot under its next generation.
    pub fn create(
        &self,
        kernel_handled: bool,
        kernel_target: Option<TaskId>,
    ) -> Arc<Endpoint> {
        let mut slots = self.slots.write();
        let index = slots.iter().position(|slot| slot.entry.is_none());
        let index = match index {
            Some(index) => index,
            None => {
                slots.push(ArenaSlot { generation: 0, entry: None });
                slots.len() - 1
            }
        };
        let slot = &mut slots[index];
        let handle = EndpointHandle { index: index as u32, generation: slot.generation };
        let endpoint = Endpoint::new(handle, self.depth, kernel_handled, kernel_target);
        slot.entry = Some(endpoint.clone());
        trace::record_ep_create(handle.index());
        endpoint
    }

    /// Resolves a handle, rejecting stale generations.
    pub fn get(&self, handle: EndpointHandle) -> Option<Arc<Endpoint>> {
        let slots = self.slots.read();
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.clone()
    }

    /// Drops one right reference to `endpoint`, reclaiming its arena slot
    /// once nothing refers to a dead endpoint any more.
    pub fn release_ref(&self, endpoint: &Arc<Endpoint>) {
        if endpoint.release() == 0 && endpoint.is_dead() {
            self.remove(endpoint.handle());
        }
    }

    /// Frees a slot and bumps its generation, invalidating old handles.
    pub fn remove(&self, handle: EndpointHandle) -> Option<Arc<Endpoint>> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take();
        if entry.is_some() {
            slot.generation = slot.generation.wrapping_add(1);
        }
        entry
    }
}
