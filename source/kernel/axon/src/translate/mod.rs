// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rights and descriptor translation at the delivery boundary
//! OWNERS: @cap-team
//! PUBLIC API: deliver, trade_right (crate-internal)
//! DEPENDS_ON: cap, ipc, task, vm, axon_abi::desc
//! INVARIANTS: Descriptor extents are validated before any entry is decoded;
//!             a vanished sender right yields name zero, never an error; the
//!             sender and receiver tables are never locked simultaneously

use std::sync::Arc;

use axon_abi::desc::{self, Descriptor};
use axon_abi::{bits, Disposition, MsgHeader, Status, HEADER_LEN};

use crate::cap::{RightName, Rights};
use crate::ipc::{trace, EndpointTable};
use crate::task::Task;

/// Width of one capability name inside an out-of-line port array.
const NAME_WIDTH: usize = core::mem::size_of::<RightName>();

/// Maps a disposition to the kind required in the sender's namespace and the
/// kind minted in the receiver's.
fn disposition_kinds(disposition: Disposition) -> (Rights, Rights) {
    match disposition {
        Disposition::MakeSend => (Rights::RECEIVE, Rights::SEND),
        Disposition::CopySend | Disposition::MoveSend => (Rights::SEND, Rights::SEND),
        Disposition::MakeSendOnce => (Rights::RECEIVE, Rights::SEND_ONCE),
        Disposition::MoveSendOnce => (Rights::SEND_ONCE, Rights::SEND_ONCE),
        Disposition::MoveReceive => (Rights::RECEIVE, Rights::RECEIVE),
    }
}

/// Rewrites one capability slot from the sender's namespace into the
/// receiver's, returning the receiver-local name (zero when the slot carries
/// nothing).
///
/// A missing sender right is tolerated, not fatal: the right may legitimately
/// have evaporated between enqueue and dequeue, and delivery proceeds with
/// the slot zeroed.
pub(crate) fn trade_right(
    sender: &Arc<Task>,
    receiver: &Arc<Task>,
    name: RightName,
    disposition_raw: u8,
    endpoints: &EndpointTable,
) -> RightName {
    let Some(disposition) = Disposition::from_raw(disposition_raw) else {
        return 0;
    };
    let (required, granted) = disposition_kinds(disposition);
    let moves_receive = disposition == Disposition::MoveReceive;

    // Sender side first; the lock is dropped before the receiver's table is
    // touched, so crossing deliveries cannot deadlock.
    let (handle, consumed) = {
        let mut sender_caps = sender.caps();
        let Some(right) = sender_caps.resolve(name, required) else {
            return 0;
        };
        let Some(handle) = right.endpoint else {
            unreachable!("{:?} right held without an endpoint", right.kind);
        };
        // Receive transfers whole ownership: the sender loses the right the
        // moment the message is delivered.
        let consumed = moves_receive && sender_caps.remove(name).is_some();
        (handle, consumed)
    };

    let endpoint = match endpoints.get(handle) {
        Some(endpoint) if !endpoint.is_dead() => endpoint,
        Some(endpoint) => {
            // The endpoint died in flight; the consumed right still has to
            // give back its reference.
            if consumed {
                endpoints.release_ref(&endpoint);
            }
            return 0;
        }
        None => return 0,
    };

    let (local_name, created) = receiver.caps().derive(handle, granted);
    if created {
        endpoint.retain();
    }
    if moves_receive {
        endpoint.bind_receiver(receiver.id());
        if consumed {
            endpoints.release_ref(&endpoint);
        }
    }
    local_name
}

/// Rewrites a queued message for delivery to `receiver`.
///
/// Header capability slots are traded first, then — for complex messages —
/// every descriptor is walked: port names are traded, out-of-line regions
/// are copied from the sender's address space into the receiver's and their
/// address fields rewritten. Finally the header's local/remote roles are
/// swapped, names and disposition bits together, since header roles are
/// directional.
pub(crate) fn deliver(
    bytes: &mut Vec<u8>,
    sender: &Arc<Task>,
    receiver: &Arc<Task>,
    endpoints: &EndpointTable,
) -> Result<(), Status> {
    let header = MsgHeader::parse(bytes).ok_or(Status::ReceiveInvalidData)?;
    let new_local = trade_right(sender, receiver, header.local, bits::local(header.bits), endpoints);
    let new_remote =
        trade_right(sender, receiver, header.remote, bits::remote(header.bits), endpoints);

    let mut descriptors = 0;
    if bits::is_complex(header.bits) {
        let body_len = bytes.len().saturating_sub(HEADER_LEN);
        let count = desc::read_count(&bytes[HEADER_LEN..]).ok_or(Status::SendInvalidData)?;
        let extent = desc::region_len(count).ok_or(Status::SendInvalidData)?;
        if extent > body_len {
            // Inconsistent count: reject before decoding a single entry.
            return Err(Status::SendInvalidData);
        }
        descriptors = count;
        for index in 0..count {
            let Some(descriptor) = desc::read_at(&bytes[HEADER_LEN..], index) else {
                // Unknown descriptor type: leave the entry untouched.
                continue;
            };
            let rewritten = match descriptor {
                Descriptor::Port { name, disposition } => Descriptor::Port {
                    name: trade_right(sender, receiver, name, disposition, endpoints),
                    disposition,
                },
                Descriptor::OolPorts { address, count: names, disposition } => {
                    let len = (names as usize)
                        .checked_mul(NAME_WIDTH)
                        .ok_or(Status::SendInvalidData)?;
                    let mut array = vec![0u8; len];
                    sender
                        .space()
                        .copy_in(address, &mut array)
                        .map_err(|_| Status::ReceiveInvalidData)?;
                    for chunk in array.chunks_exact_mut(NAME_WIDTH) {
                        let mut word = [0u8; NAME_WIDTH];
                        word.copy_from_slice(chunk);
                        let traded = trade_right(
                            sender,
                            receiver,
                            RightName::from_le_bytes(word),
                            disposition,
                            endpoints,
                        );
                        chunk.copy_from_slice(&traded.to_le_bytes());
                    }
                    let new_address = receiver
                        .space()
                        .copy_out(&array)
                        .map_err(|_| Status::ReceiveInvalidData)?;
                    Descriptor::OolPorts { address: new_address, count: names, disposition }
                }
                Descriptor::Ool { address, size } => {
                    let mut data = vec![0u8; size as usize];
                    sender
                        .space()
                        .copy_in(address, &mut data)
                        .map_err(|_| Status::ReceiveInvalidData)?;
                    let new_address = receiver
                        .space()
                        .copy_out(&data)
                        .map_err(|_| Status::ReceiveInvalidData)?;
                    Descriptor::Ool { address: new_address, size }
                }
            };
            desc::write_at(&mut bytes[HEADER_LEN..], index, &rewritten)
                .ok_or(Status::ReceiveInvalidData)?;
        }
    }

    // What was remote to the sender is local to the receiver and vice versa.
    let translated = MsgHeader {
        bits: bits::swap_roles(header.bits),
        size: header.size,
        remote: new_local,
        local: new_remote,
        id: header.id,
    };
    translated.write_to(bytes).ok_or(Status::ReceiveInvalidData)?;
    trace::record_translate(receiver.id(), 0, descriptors, 0);
    Ok(())
}
