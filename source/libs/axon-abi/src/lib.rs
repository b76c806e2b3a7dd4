// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared wire-format definitions for the Axon message transport
//! OWNERS: @runtime
//! PUBLIC API: MsgHeader, MsgTrailer, Status, Disposition, MsgOptions, bits, desc
//! DEPENDS_ON: no_std + alloc, bitflags
//! INVARIANTS: Header is 20 bytes LE; trailer is 8 bytes; descriptors are 16-byte
//!             tagged unions; declared extents are validated before interpretation

extern crate alloc;

pub mod desc;

use core::fmt;

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Byte length of the fixed message header.
pub const HEADER_LEN: usize = 20;

/// Byte length of the delivery trailer appended to kernel replies and stubs.
pub const TRAILER_LEN: usize = 8;

/// Hard upper bound on a single message (header + body), in bytes.
pub const MAX_MSG_LEN: usize = 64 * 1024;

/// Byte length of the header+trailer stub delivered for an oversized receive
/// when [`MsgOptions::RECEIVE_LARGE`] is set.
pub const STUB_REPLY_LEN: usize = HEADER_LEN + TRAILER_LEN;

/// Offset added to a request id to form the matching reply id.
pub const REPLY_ID_OFFSET: u32 = 100;

/// First message id of the kernel-client band (kernel-originated
/// exception/notification replies).
pub const KERNEL_CLIENT_FIRST_ID: u32 = 2501;

/// Last message id of the kernel-client band.
pub const KERNEL_CLIENT_LAST_ID: u32 = 2503;

const_assert_eq!(STUB_REPLY_LEN, 28);
const_assert!(MAX_MSG_LEN >= STUB_REPLY_LEN);

/// Returns `true` when `id` falls in the kernel-client band, where the kernel
/// acts as the client and no reply path exists.
pub const fn is_kernel_client_id(id: u32) -> bool {
    matches!(id, KERNEL_CLIENT_FIRST_ID..=KERNEL_CLIENT_LAST_ID)
}

/// Status codes surfaced to callers of the transport.
///
/// Send-side failures live in the `0x1000_00xx` band, receive-side failures in
/// the `0x1000_40xx` band. No other error channel crosses the API boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Operation completed.
    Success = 0,
    /// The outbound message bytes were unusable (missing header, inconsistent
    /// descriptor extents).
    SendInvalidData = 0x1000_0002,
    /// The destination name does not denote a live endpoint.
    SendInvalidDest = 0x1000_0003,
    /// The request was shorter than the handler's declared minimum.
    SendMsgTooSmall = 0x1000_0008,
    /// The reply slot does not denote a right a reply can be queued on.
    SendInvalidReply = 0x1000_0009,
    /// The destination name exists but carries no send-capable right.
    SendInvalidRight = 0x1000_000a,
    /// The destination queue is at its configured depth.
    SendQueueFull = 0x1000_000d,
    /// The message exceeds [`MAX_MSG_LEN`].
    SendTooLarge = 0x1000_000e,
    /// The receive name denotes neither a receive right nor a port set.
    ReceiveInvalidName = 0x1000_4002,
    /// The wait deadline expired with no message available.
    ReceiveTimedOut = 0x1000_4003,
    /// The pending message exceeds the caller's buffer capacity.
    ReceiveTooLarge = 0x1000_4004,
    /// The wait was interrupted by a signal.
    ReceiveInterrupted = 0x1000_4005,
    /// A cross-address-space copy failed while materialising the message.
    ReceiveInvalidData = 0x1000_4008,
    /// The endpoint (or the right to it) died while the caller waited.
    ReceivePortDied = 0x1000_4009,
}

impl Status {
    /// Raw numeric code carried on the wire.
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Decodes a raw status code.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Success,
            0x1000_0002 => Self::SendInvalidData,
            0x1000_0003 => Self::SendInvalidDest,
            0x1000_0008 => Self::SendMsgTooSmall,
            0x1000_0009 => Self::SendInvalidReply,
            0x1000_000a => Self::SendInvalidRight,
            0x1000_000d => Self::SendQueueFull,
            0x1000_000e => Self::SendTooLarge,
            0x1000_4002 => Self::ReceiveInvalidName,
            0x1000_4003 => Self::ReceiveTimedOut,
            0x1000_4004 => Self::ReceiveTooLarge,
            0x1000_4005 => Self::ReceiveInterrupted,
            0x1000_4008 => Self::ReceiveInvalidData,
            0x1000_4009 => Self::ReceivePortDied,
            _ => return None,
        })
    }

    /// Returns `true` for codes in the send band.
    pub const fn is_send_error(self) -> bool {
        (self.as_raw() & 0xffff_c000) == 0x1000_0000 && self.as_raw() != 0
    }

    /// Returns `true` for codes in the receive band.
    pub const fn is_receive_error(self) -> bool {
        (self.as_raw() & 0xffff_c000) == 0x1000_4000
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::SendInvalidData => "send: invalid data",
            Self::SendInvalidDest => "send: invalid destination",
            Self::SendMsgTooSmall => "send: message too small",
            Self::SendInvalidReply => "send: invalid reply port",
            Self::SendInvalidRight => "send: invalid right",
            Self::SendQueueFull => "send: queue full",
            Self::SendTooLarge => "send: too large",
            Self::ReceiveInvalidName => "receive: invalid name",
            Self::ReceiveTimedOut => "receive: timed out",
            Self::ReceiveTooLarge => "receive: too large",
            Self::ReceiveInterrupted => "receive: interrupted",
            Self::ReceiveInvalidData => "receive: invalid data",
            Self::ReceivePortDied => "receive: port died",
        };
        f.write_str(name)
    }
}

/// Disposition of a capability slot carried by a message.
///
/// The numeric values are wire-stable and appear in the header bits field and
/// in port descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Disposition {
    /// Transfer the receive right; the sender loses it.
    MoveReceive = 16,
    /// Transfer a send right; the sender's reference is consumed.
    MoveSend = 17,
    /// Transfer a send-once right; the sender's reference is consumed.
    MoveSendOnce = 18,
    /// Duplicate a send right; the sender keeps its reference.
    CopySend = 19,
    /// Mint a send right from the sender's receive right.
    MakeSend = 20,
    /// Mint a send-once right from the sender's receive right.
    MakeSendOnce = 21,
}

impl Disposition {
    /// Raw wire value.
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    /// Decodes a raw disposition byte. Unrecognised values decode to `None`;
    /// callers treat them as "carries no right".
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            16 => Self::MoveReceive,
            17 => Self::MoveSend,
            18 => Self::MoveSendOnce,
            19 => Self::CopySend,
            20 => Self::MakeSend,
            21 => Self::MakeSendOnce,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Option flags accepted by the combined message call.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MsgOptions: u32 {
        /// Perform the send leg.
        const SEND = 1 << 0;
        /// Perform the receive leg.
        const RECEIVE = 1 << 1;
        /// On an oversized pending message, deliver a header+trailer stub and
        /// keep the full message queued for a retry.
        const RECEIVE_LARGE = 1 << 2;
        /// Interpret the timeout argument; absent means wait indefinitely.
        const RECEIVE_TIMEOUT = 1 << 8;
    }
}

/// Helpers for the packed header bits field.
///
/// Layout: bit 31 flags a complex message; the low byte holds the remote
/// slot's disposition, the second byte the local slot's disposition.
pub mod bits {
    /// Complex-message flag: the body starts with a descriptor array.
    pub const COMPLEX: u32 = 0x8000_0000;

    /// Disposition applied to the remote (destination) slot.
    pub const fn remote(bits: u32) -> u8 {
        (bits & 0xff) as u8
    }

    /// Disposition applied to the local (reply) slot.
    pub const fn local(bits: u32) -> u8 {
        ((bits >> 8) & 0xff) as u8
    }

    /// Packs remote and local disposition bytes.
    pub const fn compose(remote: u8, local: u8) -> u32 {
        (remote as u32) | ((local as u32) << 8)
    }

    /// Returns `true` when the complex flag is set.
    pub const fn is_complex(bits: u32) -> bool {
        bits & COMPLEX != 0
    }

    /// Swaps the remote and local disposition bytes, preserving the rest.
    ///
    /// Header roles are directional: what was remote to the sender is local
    /// to the receiver, so delivery swaps the bytes together with the name
    /// slots.
    pub const fn swap_roles(bits: u32) -> u32 {
        (bits & 0xffff_0000) | ((bits & 0xff00) >> 8) | ((bits & 0x00ff) << 8)
    }
}

/// Fixed message header exchanged between tasks.
///
/// Serialised little-endian; exactly [`HEADER_LEN`] bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    /// Disposition bytes and flags; see [`bits`].
    pub bits: u32,
    /// Declared size of the message (header + body) in bytes.
    pub size: u32,
    /// Remote capability-name slot (destination on send).
    pub remote: u32,
    /// Local capability-name slot (reply port on send).
    pub local: u32,
    /// Message id, selecting the operation or service routine.
    pub id: u32,
}

const_assert_eq!(core::mem::size_of::<MsgHeader>(), HEADER_LEN);

impl MsgHeader {
    /// Creates a header with all fields initialised.
    pub const fn new(bits: u32, size: u32, remote: u32, local: u32, id: u32) -> Self {
        Self { bits, size, remote, local, id }
    }

    /// Serialises the header to little-endian bytes.
    pub fn to_le_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.bits.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.remote.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.local.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.id.to_le_bytes());
        bytes
    }

    /// Deserialises a little-endian byte array into a header.
    pub fn from_le_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        let word = |range: core::ops::Range<usize>| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[range]);
            u32::from_le_bytes(buf)
        };
        Self {
            bits: word(0..4),
            size: word(4..8),
            remote: word(8..12),
            local: word(12..16),
            id: word(16..20),
        }
    }

    /// Parses a header from the front of a message buffer.
    pub fn parse(msg: &[u8]) -> Option<Self> {
        let mut bytes = [0u8; HEADER_LEN];
        bytes.copy_from_slice(msg.get(..HEADER_LEN)?);
        Some(Self::from_le_bytes(bytes))
    }

    /// Writes the header over the front of a message buffer.
    ///
    /// Returns `None` when the buffer is shorter than [`HEADER_LEN`].
    pub fn write_to(&self, msg: &mut [u8]) -> Option<()> {
        msg.get_mut(..HEADER_LEN)?.copy_from_slice(&self.to_le_bytes());
        Some(())
    }
}

/// Delivery trailer stamped at the tail of kernel replies and stubs.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgTrailer {
    /// Trailer format discriminator; only format 0 exists today.
    pub format: u32,
    /// Trailer length in bytes.
    pub size: u32,
}

const_assert_eq!(core::mem::size_of::<MsgTrailer>(), TRAILER_LEN);

/// Trailer format 0: no extra payload beyond the discriminator and length.
pub const TRAILER_FORMAT_0: u32 = 0;

/// Stamps a format-0 trailer over the last [`TRAILER_LEN`] bytes of `msg`.
///
/// Returns `None` when the buffer cannot hold a trailer.
pub fn set_trailer(msg: &mut [u8]) -> Option<()> {
    let len = msg.len();
    let tail = msg.get_mut(len.checked_sub(TRAILER_LEN)?..)?;
    tail[0..4].copy_from_slice(&TRAILER_FORMAT_0.to_le_bytes());
    tail[4..8].copy_from_slice(&(TRAILER_LEN as u32).to_le_bytes());
    Some(())
}

/// Builds the reply header for a kernel-serviced request.
///
/// The reply travels to the request's local (reply) slot with a
/// move-send-once disposition, and its id is the request id plus
/// [`REPLY_ID_OFFSET`].
pub fn reply_header(request: &MsgHeader, reply_size: u32) -> MsgHeader {
    MsgHeader {
        bits: bits::compose(0, Disposition::MoveSendOnce.as_raw()),
        size: reply_size,
        remote: 0,
        local: request.local,
        id: request.id.wrapping_add(REPLY_ID_OFFSET),
    }
}

/// Encodes the header+trailer stub delivered when a pending message exceeds
/// the receive buffer and [`MsgOptions::RECEIVE_LARGE`] was set.
///
/// The header is the queued message's own header, so its `size` field tells
/// the caller how big a retry buffer must be.
pub fn encode_stub_reply(header: &MsgHeader) -> [u8; STUB_REPLY_LEN] {
    let mut stub = [0u8; STUB_REPLY_LEN];
    stub[..HEADER_LEN].copy_from_slice(&header.to_le_bytes());
    // Infallible: the stub always holds a trailer.
    let _ = set_trailer(&mut stub);
    stub
}
