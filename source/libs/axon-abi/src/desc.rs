// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Descriptor layout and accessors for complex messages
//! OWNERS: @runtime
//! PUBLIC API: Descriptor, DESC_LEN, region_len, read/write accessors, builders
//! INVARIANTS: Every descriptor variant occupies the same 16 bytes, so extent
//!             checks never need the variant; counts are validated against the
//!             buffer before any entry is decoded

use alloc::vec::Vec;

use crate::{bits, Disposition, MsgHeader, HEADER_LEN};

/// Byte length of one descriptor entry. All variants share it, which keeps
/// extent validation independent of the entry types.
pub const DESC_LEN: usize = 16;

/// Byte length of the descriptor-count field opening a complex body.
pub const COUNT_LEN: usize = 4;

/// Wire tag for a port descriptor.
pub const TYPE_PORT: u8 = 0;
/// Wire tag for an out-of-line data descriptor.
pub const TYPE_OOL: u8 = 1;
/// Wire tag for an out-of-line port-array descriptor.
pub const TYPE_OOL_PORTS: u8 = 2;

/// A descriptor embedded in the body of a complex message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Descriptor {
    /// A single capability slot: name plus disposition.
    Port {
        /// Capability name in the sending task's namespace.
        name: u32,
        /// Raw disposition byte; see [`Disposition`].
        disposition: u8,
    },
    /// An out-of-line byte region, copied between address spaces.
    Ool {
        /// Region address in the sending task's address space.
        address: u64,
        /// Region size in bytes.
        size: u32,
    },
    /// An out-of-line array of capability names, each translated on delivery.
    OolPorts {
        /// Array address in the sending task's address space.
        address: u64,
        /// Number of names in the array.
        count: u32,
        /// Raw disposition byte applied to every contained name.
        disposition: u8,
    },
}

impl Descriptor {
    /// Encodes the descriptor into a 16-byte entry.
    pub fn encode(&self) -> [u8; DESC_LEN] {
        let mut out = [0u8; DESC_LEN];
        let (payload_a, payload_b, disposition, tag) = match *self {
            Self::Port { name, disposition } => (name as u64, 0, disposition, TYPE_PORT),
            Self::Ool { address, size } => (address, size, 0, TYPE_OOL),
            Self::OolPorts { address, count, disposition } => {
                (address, count, disposition, TYPE_OOL_PORTS)
            }
        };
        out[0..8].copy_from_slice(&payload_a.to_le_bytes());
        out[8..12].copy_from_slice(&payload_b.to_le_bytes());
        out[12] = disposition;
        out[13] = tag;
        out
    }

    /// Decodes a 16-byte entry. Unknown tags decode to `None`; the translator
    /// skips them rather than failing the message.
    pub fn decode(entry: &[u8]) -> Option<Self> {
        if entry.len() < DESC_LEN {
            return None;
        }
        let mut a = [0u8; 8];
        a.copy_from_slice(&entry[0..8]);
        let payload_a = u64::from_le_bytes(a);
        let mut b = [0u8; 4];
        b.copy_from_slice(&entry[8..12]);
        let payload_b = u32::from_le_bytes(b);
        let disposition = entry[12];
        match entry[13] {
            TYPE_PORT => Some(Self::Port { name: payload_a as u32, disposition }),
            TYPE_OOL => Some(Self::Ool { address: payload_a, size: payload_b }),
            TYPE_OOL_PORTS => {
                Some(Self::OolPorts { address: payload_a, count: payload_b, disposition })
            }
            _ => None,
        }
    }
}

/// Byte extent of a descriptor region holding `count` entries (count field
/// included). `None` on arithmetic overflow.
pub fn region_len(count: u32) -> Option<usize> {
    (count as usize).checked_mul(DESC_LEN)?.checked_add(COUNT_LEN)
}

/// Reads the descriptor count from the front of a complex body.
pub fn read_count(body: &[u8]) -> Option<u32> {
    let mut buf = [0u8; COUNT_LEN];
    buf.copy_from_slice(body.get(..COUNT_LEN)?);
    Some(u32::from_le_bytes(buf))
}

/// Byte offset of entry `index` within a complex body.
fn entry_offset(index: u32) -> Option<usize> {
    (index as usize).checked_mul(DESC_LEN)?.checked_add(COUNT_LEN)
}

/// Decodes entry `index` of a complex body.
pub fn read_at(body: &[u8], index: u32) -> Option<Descriptor> {
    let offset = entry_offset(index)?;
    Descriptor::decode(body.get(offset..offset.checked_add(DESC_LEN)?)?)
}

/// Overwrites entry `index` of a complex body.
pub fn write_at(body: &mut [u8], index: u32, descriptor: &Descriptor) -> Option<()> {
    let offset = entry_offset(index)?;
    body.get_mut(offset..offset.checked_add(DESC_LEN)?)?
        .copy_from_slice(&descriptor.encode());
    Some(())
}

/// Appends a descriptor to a message under construction, maintaining the
/// complex flag and the descriptor count.
///
/// Descriptors must precede any inline payload: the call fails (returns
/// `None`) once bytes beyond the descriptor region exist, or when the buffer
/// does not yet hold a full header.
pub fn push_descriptor(msg: &mut Vec<u8>, descriptor: &Descriptor) -> Option<()> {
    let mut header = MsgHeader::parse(msg)?;
    let count = if bits::is_complex(header.bits) {
        read_count(&msg[HEADER_LEN..])?
    } else {
        // First descriptor: open the region.
        if msg.len() != HEADER_LEN {
            return None;
        }
        header.bits |= bits::COMPLEX;
        msg.extend_from_slice(&0u32.to_le_bytes());
        0
    };
    if msg.len() != HEADER_LEN.checked_add(region_len(count)?)? {
        return None;
    }
    msg.extend_from_slice(&descriptor.encode());
    let next = count.checked_add(1)?;
    msg[HEADER_LEN..HEADER_LEN + COUNT_LEN].copy_from_slice(&next.to_le_bytes());
    header.write_to(msg)?;
    Some(())
}

/// Convenience wrapper appending a port descriptor.
pub fn push_port(msg: &mut Vec<u8>, name: u32, disposition: Disposition) -> Option<()> {
    push_descriptor(msg, &Descriptor::Port { name, disposition: disposition.as_raw() })
}

/// Convenience wrapper appending an out-of-line data descriptor.
pub fn push_ool(msg: &mut Vec<u8>, address: u64, size: u32) -> Option<()> {
    push_descriptor(msg, &Descriptor::Ool { address, size })
}

/// Convenience wrapper appending an out-of-line port-array descriptor.
pub fn push_ool_ports(
    msg: &mut Vec<u8>,
    address: u64,
    count: u32,
    disposition: Disposition,
) -> Option<()> {
    push_descriptor(
        msg,
        &Descriptor::OolPorts { address, count, disposition: disposition.as_raw() },
    )
}

/// Rewrites the header's declared size to match the buffer length.
pub fn set_size_from_len(msg: &mut [u8]) -> Option<()> {
    let mut header = MsgHeader::parse(msg)?;
    header.size = u32::try_from(msg.len()).ok()?;
    header.write_to(msg)
}
