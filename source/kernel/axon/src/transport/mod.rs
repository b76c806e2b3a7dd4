// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Send/receive orchestration over tasks, endpoints, and services
//! OWNERS: @ipc-engine-team
//! PUBLIC API: Transport, TransportConfig, MsgArgs
//! DEPENDS_ON: cap, ipc, service, task, translate, vm, axon-abi
//! INVARIANTS: Send never blocks; delivery is the only point where rights
//!             cross task namespaces; a queued message is either fully
//!             delivered-and-removed or left queued, never half-consumed

use std::sync::Arc;
use std::time::{Duration, Instant};

use axon_abi::{
    bits, is_kernel_client_id, MsgHeader, MsgOptions, Status, MAX_MSG_LEN,
};

use crate::cap::{ReleaseOutcome, Right, RightName, Rights};
use crate::ipc::{
    trace, Dequeue, Endpoint, EndpointHandle, EndpointTable, EnqueueError, QueuedMsg, WaitChannel,
};
use crate::service::{ServiceArgs, ServiceTable};
use crate::task::{Task, TaskId, TaskTable};
use crate::translate;
use crate::vm::AddressSpace;

/// Tunables fixed at transport construction.
pub struct TransportConfig {
    /// Maximum messages queued per endpoint before senders see
    /// [`Status::SendQueueFull`]. Bounded by design: the classic unbounded
    /// mailbox is a denial-of-service foothold.
    pub queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

/// Arguments for the combined send/receive entry point.
pub struct MsgArgs<'a> {
    /// Raw outbound message (header + body); required when
    /// [`MsgOptions::SEND`] is set.
    pub send: Option<&'a [u8]>,
    /// Operation selection and receive behaviour.
    pub options: MsgOptions,
    /// Name to receive on (receive right or port set).
    pub recv_name: RightName,
    /// Wait budget in milliseconds, honoured when
    /// [`MsgOptions::RECEIVE_TIMEOUT`] is set; otherwise the wait is
    /// indefinite.
    pub timeout_ms: u32,
}

enum RecvTarget {
    Simple(Arc<Endpoint>),
    Set(Arc<WaitChannel>),
}

/// The message engine: validates rights, routes kernel-handled sends through
/// the dispatcher, queues everything else, and services blocking receives.
pub struct Transport {
    tasks: TaskTable,
    endpoints: EndpointTable,
    services: ServiceTable,
}

impl Transport {
    /// Builds a transport over an immutable dispatcher table.
    pub fn new(config: TransportConfig, services: ServiceTable) -> Self {
        Self {
            tasks: TaskTable::new(),
            endpoints: EndpointTable::new(config.queue_depth),
            services,
        }
    }

    // ——— Task and right lifecycle ———

    /// Registers a task over `space`.
    pub fn create_task(&self, space: Arc<dyn AddressSpace>) -> TaskId {
        self.tasks.create(space)
    }

    /// Raises the interrupt signal on `task`, waking it if blocked in a
    /// receive. The wait surfaces [`Status::ReceiveInterrupted`].
    pub fn interrupt(&self, task: TaskId) {
        if let Some(task) = self.tasks.get(task) {
            task.interrupt();
        }
    }

    /// Creates an endpoint and hands `owner` its receive right.
    pub fn create_endpoint(&self, owner: TaskId) -> Option<RightName> {
        let task = self.tasks.get(owner)?;
        let endpoint = self.endpoints.create(false, None);
        endpoint.bind_receiver(owner);
        endpoint.retain();
        let name = task.caps().insert(Right::endpoint_right(Rights::RECEIVE, endpoint.handle()));
        Some(name)
    }

    /// Derives a send right from a receive right held by the same task.
    pub fn make_send(&self, owner: TaskId, receive_name: RightName) -> Option<RightName> {
        let task = self.tasks.get(owner)?;
        let handle = {
            let caps = task.caps();
            caps.resolve(receive_name, Rights::RECEIVE).and_then(|right| right.endpoint)
        }?;
        let endpoint = self.endpoints.get(handle)?;
        let (name, created) = task.caps().derive(handle, Rights::SEND);
        if created {
            endpoint.retain();
        }
        Some(name)
    }

    /// Creates an empty port set owned by `owner`.
    pub fn create_port_set(&self, owner: TaskId) -> Option<RightName> {
        let task = self.tasks.get(owner)?;
        let name = task.caps().insert(Right::port_set(WaitChannel::new()));
        Some(name)
    }

    /// Adds a receive right to a port set. Both must belong to `owner`, and a
    /// receive right can be a member of at most one set.
    pub fn port_set_add(&self, owner: TaskId, set: RightName, member: RightName) -> bool {
        let Some(task) = self.tasks.get(owner) else {
            return false;
        };
        let (channel, handle) = {
            let caps = task.caps();
            let Some(set_right) = caps.resolve(set, Rights::PORT_SET) else {
                return false;
            };
            if set_right.members.contains(&member) {
                return false;
            }
            let Some(channel) = set_right.channel.clone() else {
                unreachable!("port set without a wait channel");
            };
            let Some(handle) = caps.resolve(member, Rights::RECEIVE).and_then(|r| r.endpoint)
            else {
                return false;
            };
            (channel, handle)
        };
        let Some(endpoint) = self.endpoints.get(handle) else {
            return false;
        };
        if !endpoint.join_set(channel) {
            return false;
        }
        if let Some(set_right) = task.caps().resolve_mut(set, Rights::PORT_SET) {
            set_right.members.push(member);
        }
        true
    }

    /// Removes a receive right from a port set, restoring its own wake-up
    /// channel.
    pub fn port_set_remove(&self, owner: TaskId, set: RightName, member: RightName) -> bool {
        let Some(task) = self.tasks.get(owner) else {
            return false;
        };
        let handle = {
            let caps = task.caps();
            caps.resolve(member, Rights::RECEIVE).and_then(|right| right.endpoint)
        };
        let removed = {
            let mut caps = task.caps();
            let Some(set_right) = caps.resolve_mut(set, Rights::PORT_SET) else {
                return false;
            };
            let before = set_right.members.len();
            set_right.members.retain(|name| *name != member);
            before != set_right.members.len()
        };
        if removed {
            if let Some(endpoint) = handle.and_then(|handle| self.endpoints.get(handle)) {
                endpoint.leave_set();
            }
        }
        removed
    }

    /// Releases one reference to the right under `name`.
    ///
    /// Releasing a receive right kills its endpoint: the queue is drained and
    /// blocked receivers observe [`Status::ReceivePortDied`].
    pub fn release_right(&self, owner: TaskId, name: RightName) -> bool {
        let Some(task) = self.tasks.get(owner) else {
            return false;
        };
        let kind = {
            let caps = task.caps();
            match caps.resolve(name, Rights::all()) {
                Some(right) => right.kind,
                None => return false,
            }
        };
        if kind == Rights::PORT_SET {
            let Some(set_right) = task.caps().remove(name) else {
                return false;
            };
            for member in set_right.members {
                let handle = {
                    let caps = task.caps();
                    caps.resolve(member, Rights::RECEIVE).and_then(|right| right.endpoint)
                };
                if let Some(endpoint) = handle.and_then(|handle| self.endpoints.get(handle)) {
                    endpoint.leave_set();
                }
            }
            return true;
        }
        if kind == Rights::RECEIVE {
            let Some(right) = task.caps().remove(name) else {
                return false;
            };
            if let Some(endpoint) = right.endpoint.and_then(|handle| self.endpoints.get(handle)) {
                endpoint.kill();
                self.endpoints.release_ref(&endpoint);
            }
            return true;
        }
        let outcome = task.caps().release(name, kind);
        match outcome {
            ReleaseOutcome::NotFound => false,
            ReleaseOutcome::StillHeld => true,
            ReleaseOutcome::Removed(right) => {
                if let Some(endpoint) =
                    right.endpoint.and_then(|handle| self.endpoints.get(handle))
                {
                    self.endpoints.release_ref(&endpoint);
                }
                true
            }
        }
    }

    /// Creates a kernel-handled endpoint whose sends run through the
    /// dispatcher. `target` designates the task handlers act on; the caller
    /// is used when unset.
    pub fn create_kernel_endpoint(&self, target: Option<TaskId>) -> EndpointHandle {
        self.endpoints.create(true, target).handle()
    }

    /// Grants `task` a send right on an endpoint it does not own.
    pub fn grant_send(&self, task: TaskId, handle: EndpointHandle) -> Option<RightName> {
        let task = self.tasks.get(task)?;
        let endpoint = self.endpoints.get(handle)?;
        let (name, created) = task.caps().derive(handle, Rights::SEND);
        if created {
            endpoint.retain();
        }
        Some(name)
    }

    /// Reveals the endpoint behind a right, for bootstrap wiring and
    /// diagnostics (the moral equivalent of a capability query syscall).
    pub fn query_endpoint(&self, owner: TaskId, name: RightName) -> Option<EndpointHandle> {
        let task = self.tasks.get(owner)?;
        let caps = task.caps();
        caps.resolve(name, Rights::all())?.endpoint
    }

    /// Queue depth of the endpoint behind a receive right, for inspection.
    pub fn pending(&self, owner: TaskId, name: RightName) -> Option<usize> {
        let task = self.tasks.get(owner)?;
        let handle = {
            let caps = task.caps();
            caps.resolve(name, Rights::RECEIVE).and_then(|right| right.endpoint)
        }?;
        Some(self.endpoints.get(handle)?.pending())
    }

    // ——— Operations ———

    /// Sends a raw message on behalf of `caller`. Never blocks.
    pub fn send(&self, caller: TaskId, raw: &[u8]) -> Status {
        let mut options = MsgOptions::SEND;
        self.send_inner(caller, raw, &mut options)
    }

    /// Receives into `out` on behalf of `caller`; `out.len()` is the
    /// capacity. Returns the status and the number of bytes written.
    pub fn recv(
        &self,
        caller: TaskId,
        name: RightName,
        options: MsgOptions,
        timeout_ms: u32,
        out: &mut [u8],
    ) -> (Status, usize) {
        self.recv_inner(caller, name, options | MsgOptions::RECEIVE, timeout_ms, out)
    }

    /// Combined entry point: optional send leg, then optional receive leg.
    ///
    /// A send failure skips the receive; a no-reply kernel send clears the
    /// receive flag itself, since no reply will ever arrive.
    pub fn msg(&self, caller: TaskId, args: MsgArgs<'_>, out: &mut [u8]) -> (Status, usize) {
        let mut options = args.options;
        if options.contains(MsgOptions::SEND) {
            let Some(raw) = args.send else {
                return (Status::SendInvalidData, 0);
            };
            let status = self.send_inner(caller, raw, &mut options);
            if status != Status::Success {
                return (status, 0);
            }
        }
        if options.contains(MsgOptions::RECEIVE) {
            return self.recv_inner(caller, args.recv_name, options, args.timeout_ms, out);
        }
        (Status::Success, 0)
    }

    // ——— Send leg ———

    fn send_inner(&self, caller: TaskId, raw: &[u8], options: &mut MsgOptions) -> Status {
        if raw.len() > MAX_MSG_LEN {
            return Status::SendTooLarge;
        }
        let Some(header) = MsgHeader::parse(raw) else {
            return Status::SendInvalidData;
        };
        let Some(task) = self.tasks.get(caller) else {
            return Status::SendInvalidDest;
        };
        // The one copy of caller bytes the engine trusts from here on.
        let bytes = raw.to_vec();
        trace::trace_msg_bytes("send", &bytes);

        let (remote_handle, sendable, local_handle) = {
            let caps = task.caps();
            let Some(remote) = caps.resolve(header.remote, Rights::all()) else {
                trace::record_send(caller, 0, bytes.len(), Status::SendInvalidDest.as_raw());
                return Status::SendInvalidDest;
            };
            let Some(remote_handle) = remote.endpoint else {
                return Status::SendInvalidDest;
            };
            let sendable = remote.kind.intersects(Rights::SEND | Rights::SEND_ONCE);
            let local_handle = if header.local != 0 {
                caps.resolve(header.local, Rights::all()).and_then(|right| right.endpoint)
            } else {
                None
            };
            (remote_handle, sendable, local_handle)
        };
        if !sendable {
            return Status::SendInvalidRight;
        }
        let Some(endpoint) = self.endpoints.get(remote_handle) else {
            return Status::SendInvalidDest;
        };

        if endpoint.is_kernel_handled() {
            return self.kernel_send(&task, &header, bytes, local_handle, &endpoint, options);
        }

        if endpoint.is_dead() || !endpoint.has_receiver() {
            return Status::SendInvalidDest;
        }
        let len = bytes.len();
        match endpoint.enqueue(QueuedMsg { bytes, sender: Some(task.clone()) }) {
            Ok(channel) => {
                // Ownership of moved rights has left the sender.
                self.drop_moved_right(&task, header.local, bits::local(header.bits));
                self.drop_moved_right(&task, header.remote, bits::remote(header.bits));
                channel.notify();
                trace::record_send(caller, endpoint.handle().index(), len, 0);
                Status::Success
            }
            Err(EnqueueError::Full) => {
                trace::record_send(
                    caller,
                    endpoint.handle().index(),
                    len,
                    Status::SendQueueFull.as_raw(),
                );
                Status::SendQueueFull
            }
            Err(EnqueueError::PortDead) => Status::SendInvalidDest,
        }
    }

    /// Consumes the sender-side reference of a move-disposition slot after
    /// the message has been queued.
    fn drop_moved_right(&self, task: &Arc<Task>, name: RightName, disposition_raw: u8) {
        use axon_abi::Disposition;
        let kind = match Disposition::from_raw(disposition_raw) {
            Some(Disposition::MoveSend) => Rights::SEND,
            Some(Disposition::MoveSendOnce) => Rights::SEND_ONCE,
            // A moved receive right is lost when the message is received,
            // not at send time; make/copy leave the sender intact.
            _ => return,
        };
        if let ReleaseOutcome::Removed(right) = task.caps().release(name, kind) {
            if let Some(endpoint) = right.endpoint.and_then(|handle| self.endpoints.get(handle)) {
                self.endpoints.release_ref(&endpoint);
            }
        }
    }

    fn kernel_send(
        &self,
        task: &Arc<Task>,
        header: &MsgHeader,
        bytes: Vec<u8>,
        local_handle: Option<EndpointHandle>,
        endpoint: &Arc<Endpoint>,
        options: &mut MsgOptions,
    ) -> Status {
        let Some(entry) = self.services.lookup(header.id) else {
            log::warn!(target: "axon::service", "no service handler for id {}", header.id);
            return Status::SendInvalidDest;
        };

        let min_request;
        let max_reply;
        let reply_target: Option<Arc<Endpoint>>;
        if is_kernel_client_id(header.id) {
            // The kernel behaves as the client here: the "request" is itself
            // a reply, lengths swap roles, and no reply path is created.
            min_request = entry.max_reply_len;
            max_reply = entry.min_request_len;
            reply_target = None;
        } else {
            min_request = entry.min_request_len;
            max_reply = entry.max_reply_len;
            let target = local_handle
                .and_then(|handle| self.endpoints.get(handle))
                .filter(|endpoint| endpoint.has_receiver() && !endpoint.is_dead());
            let Some(target) = target else {
                return Status::SendInvalidReply;
            };
            reply_target = Some(target);
        }

        // The handler must never read past the end of the request.
        if bytes.len() < min_request {
            return Status::SendMsgTooSmall;
        }

        let mut reply = vec![0u8; if reply_target.is_some() { max_reply } else { 0 }];
        let mut reply_len = reply.len();
        let target_task = endpoint.kernel_target().unwrap_or(task.id());
        let mut args = ServiceArgs {
            caller: task.id(),
            target: target_task,
            request: &bytes,
            reply: &mut reply,
            reply_len: &mut reply_len,
        };
        let status = (entry.handler)(&mut args);
        if status != Status::Success {
            return status;
        }

        let Some(reply_endpoint) = reply_target else {
            // No-reply operation: everything is done; the caller must skip
            // its own receive leg.
            options.remove(MsgOptions::RECEIVE);
            return Status::Success;
        };

        if reply_len > max_reply {
            log::warn!(
                target: "axon::service",
                "oversized reply from {}: {} > {}",
                entry.name,
                reply_len,
                max_reply
            );
            reply_len = max_reply;
        }
        reply.truncate(reply_len);
        match reply_endpoint.enqueue(QueuedMsg { bytes: reply, sender: None }) {
            Ok(channel) => {
                channel.notify();
                Status::Success
            }
            Err(EnqueueError::Full) => Status::SendQueueFull,
            Err(EnqueueError::PortDead) => Status::SendInvalidReply,
        }
    }

    // ——— Receive leg ———

    fn recv_inner(
        &self,
        caller: TaskId,
        name: RightName,
        options: MsgOptions,
        timeout_ms: u32,
        out: &mut [u8],
    ) -> (Status, usize) {
        let Some(task) = self.tasks.get(caller) else {
            return (Status::ReceiveInvalidName, 0);
        };
        let deadline = options
            .contains(MsgOptions::RECEIVE_TIMEOUT)
            .then(|| Instant::now() + Duration::from_millis(u64::from(timeout_ms)));

        let target = {
            let caps = task.caps();
            if let Some(right) = caps.resolve(name, Rights::RECEIVE) {
                let Some(handle) = right.endpoint else {
                    unreachable!("receive right held without an endpoint");
                };
                drop(caps);
                match self.endpoints.get(handle) {
                    Some(endpoint) => RecvTarget::Simple(endpoint),
                    None => return (Status::ReceivePortDied, 0),
                }
            } else if let Some(right) = caps.resolve(name, Rights::PORT_SET) {
                let Some(channel) = right.channel.clone() else {
                    unreachable!("port set without a wait channel");
                };
                RecvTarget::Set(channel)
            } else {
                return (Status::ReceiveInvalidName, 0);
            }
        };

        let channel = match &target {
            RecvTarget::Simple(endpoint) => endpoint.wakeup_channel(),
            RecvTarget::Set(channel) => channel.clone(),
        };
        // Snapshot before scanning: a send landing mid-scan must not be lost.
        let token = channel.snapshot();

        let ready = match &target {
            RecvTarget::Simple(endpoint) => {
                if endpoint.is_dead() {
                    return (Status::ReceivePortDied, 0);
                }
                (endpoint.pending() > 0).then(|| endpoint.clone())
            }
            RecvTarget::Set(_) => match self.scan_set_strict(&task, name) {
                Ok(found) => found,
                Err(status) => return (status, 0),
            },
        };

        let endpoint = match ready {
            Some(endpoint) => endpoint,
            None => {
                task.begin_wait(channel.clone());
                let _outcome = channel.wait_from(token, deadline);
                task.end_wait();
                if task.take_interrupted() {
                    return (Status::ReceiveInterrupted, 0);
                }
                // One wait per call: revalidate the right, rescan once, and
                // report the timeout if the queues are still empty.
                match &target {
                    RecvTarget::Simple(endpoint) => {
                        if task.caps().resolve(name, Rights::RECEIVE).is_none()
                            || endpoint.is_dead()
                        {
                            return (Status::ReceivePortDied, 0);
                        }
                        if endpoint.pending() == 0 {
                            return (Status::ReceiveTimedOut, 0);
                        }
                        endpoint.clone()
                    }
                    RecvTarget::Set(_) => {
                        if task.caps().resolve(name, Rights::PORT_SET).is_none() {
                            return (Status::ReceivePortDied, 0);
                        }
                        match self.scan_set_lenient(&task, name) {
                            Some(endpoint) => endpoint,
                            None => return (Status::ReceiveTimedOut, 0),
                        }
                    }
                }
            }
        };

        self.deliver_from(&task, &endpoint, options, out)
    }

    /// First scan of a port set: every member must still carry a receive
    /// right, exactly as on a simple receive.
    fn scan_set_strict(
        &self,
        task: &Arc<Task>,
        set: RightName,
    ) -> Result<Option<Arc<Endpoint>>, Status> {
        let members: Vec<RightName> = {
            let caps = task.caps();
            match caps.resolve(set, Rights::PORT_SET) {
                Some(right) => right.members.clone(),
                None => return Err(Status::ReceiveInvalidName),
            }
        };
        for member in members {
            let handle = {
                let caps = task.caps();
                caps.resolve(member, Rights::RECEIVE).and_then(|right| right.endpoint)
            };
            let Some(endpoint) = handle.and_then(|handle| self.endpoints.get(handle)) else {
                return Err(Status::ReceiveInvalidName);
            };
            if endpoint.pending() > 0 {
                return Ok(Some(endpoint));
            }
        }
        Ok(None)
    }

    /// Post-wake rescan: counts only, members whose rights went away are
    /// skipped rather than failing the call.
    fn scan_set_lenient(&self, task: &Arc<Task>, set: RightName) -> Option<Arc<Endpoint>> {
        let members: Vec<RightName> = {
            let caps = task.caps();
            caps.resolve(set, Rights::PORT_SET)?.members.clone()
        };
        members.into_iter().find_map(|member| {
            let handle = {
                let caps = task.caps();
                caps.resolve(member, Rights::RECEIVE).and_then(|right| right.endpoint)
            }?;
            let endpoint = self.endpoints.get(handle)?;
            (endpoint.pending() > 0).then_some(endpoint)
        })
    }

    /// Dequeues, translates, and copies out — the one point where capability
    /// ownership crosses task boundaries.
    fn deliver_from(
        &self,
        task: &Arc<Task>,
        endpoint: &Arc<Endpoint>,
        options: MsgOptions,
        out: &mut [u8],
    ) -> (Status, usize) {
        let allow_large = options.contains(MsgOptions::RECEIVE_LARGE);
        match endpoint.dequeue_for_receive(out.len(), allow_large) {
            Dequeue::Empty => (Status::ReceiveTimedOut, 0),
            Dequeue::TooLargeDestroyed { size } => {
                trace::record_recv(
                    task.id(),
                    endpoint.handle().index(),
                    size,
                    Status::ReceiveTooLarge.as_raw(),
                );
                (Status::ReceiveTooLarge, 0)
            }
            Dequeue::TooLargeStub { stub } => {
                let len = stub.len().min(out.len());
                out[..len].copy_from_slice(&stub[..len]);
                (Status::ReceiveTooLarge, len)
            }
            Dequeue::Delivered(mut msg) => {
                if let Some(sender) = msg.sender.clone() {
                    let original = msg.bytes.clone();
                    if let Err(status) =
                        translate::deliver(&mut msg.bytes, &sender, task, &self.endpoints)
                    {
                        // Leave the queue as if the receive never happened.
                        endpoint.requeue_front(QueuedMsg {
                            bytes: original,
                            sender: Some(sender),
                        });
                        return (status, 0);
                    }
                }
                let len = msg.bytes.len();
                out[..len].copy_from_slice(&msg.bytes);
                trace::trace_msg_bytes("recv", &msg.bytes);
                trace::record_recv(task.id(), endpoint.handle().index(), len, 0);
                (Status::Success, len)
            }
        }
    }
}
