// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! E1.31 packet layer parsing.
//!
//! An sACN data packet nests three PDU layers: the ACN root layer (packet
//! id + sender CID), the E1.31 framing layer (source name, priority,
//! sequence, options, universe) and the DMP layer (address + slots). This
//! module peels the first two and hands the DMP PDU up to the inflator.
//!
//! Two framing revisions exist on real networks: the ratified layout with
//! a 64-octet source name, sync address and options, and the older draft
//! ("rev2") layout with a 32-octet name and neither. They are told apart by
//! which one makes the nested DMP PDU length line up.

use super::Cid;

const ACN_PACKET_ID: [u8; 12] = *b"ASC-E1.17\x00\x00\x00";
const ROOT_VECTOR_E131_DATA: u32 = 0x0000_0004;
const FRAMING_VECTOR_DMX: u32 = 0x0000_0002;

const ROOT_OFFSET: usize = 16;
const CID_OFFSET: usize = 22;
const FRAMING_OFFSET: usize = 38;

/// DMP offset within the framing PDU for the ratified layout.
const CURRENT_DMP_OFFSET: usize = 77;
/// DMP offset within the framing PDU for the rev2 draft layout.
const REV2_DMP_OFFSET: usize = 42;

/// Options bit: this frame is preview data, not for live output.
pub const PREVIEW_DATA_MASK: u8 = 0x80;
/// Options bit: the source is terminating this stream.
pub const STREAM_TERMINATED_MASK: u8 = 0x40;

/// The decoded E1.31 framing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E131Header {
    pub source_name: String,
    pub priority: u8,
    pub sequence: u8,
    pub preview: bool,
    pub stream_terminated: bool,
    pub universe: u16,
    pub rev2: bool,
}

/// The DMP PDU as found on the wire. Vector and header octets are omitted
/// when the PDU inherits them from a previous PDU.
#[derive(Debug, Clone, Copy)]
pub struct DmpPdu<'a> {
    pub vector: Option<u8>,
    pub header: Option<u8>,
    pub payload: &'a [u8],
}

/// A fully peeled data frame.
#[derive(Debug)]
pub struct RawFrame<'a> {
    pub cid: Cid,
    pub header: E131Header,
    pub dmp: DmpPdu<'a>,
}

/// Read an ACN flags + length word. Returns (flags nibble, length).
fn flags_and_length(data: &[u8], offset: usize) -> Option<(u8, usize)> {
    let bytes = data.get(offset..offset + 2)?;
    let flags = bytes[0] >> 4;
    let length = (usize::from(bytes[0] & 0x0f) << 8) | usize::from(bytes[1]);
    Some((flags, length))
}

const FLAG_VECTOR: u8 = 0x4;
const FLAG_HEADER: u8 = 0x2;

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_name(data: &[u8], offset: usize, width: usize) -> Option<String> {
    let bytes = data.get(offset..offset + width)?;
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(width);
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Check whether a DMP PDU starting at `offset` has a length word matching
/// `expected` octets.
fn dmp_length_matches(data: &[u8], offset: usize, expected: usize) -> bool {
    match flags_and_length(data, offset) {
        Some((_, length)) => length == expected,
        None => false,
    }
}

/// Peel the root and framing layers off a packet.
///
/// Returns None (after logging at info) for anything malformed; the caller
/// counts the drop.
pub fn parse_packet(data: &[u8]) -> Option<RawFrame<'_>> {
    // root layer
    if data.len() < FRAMING_OFFSET || read_u16(data, 0)? != 0x0010 || read_u16(data, 2)? != 0 {
        log::info!("[E131] bad preamble, dropping packet");
        return None;
    }
    if data.get(4..16)? != ACN_PACKET_ID.as_slice() {
        log::info!("[E131] bad ACN packet id, dropping packet");
        return None;
    }
    let (root_flags, root_length) = flags_and_length(data, ROOT_OFFSET)?;
    if root_flags & FLAG_VECTOR == 0 || ROOT_OFFSET + root_length > data.len() {
        log::info!("[E131] bad root layer, dropping packet");
        return None;
    }
    if read_u32(data, ROOT_OFFSET + 2)? != ROOT_VECTOR_E131_DATA {
        log::debug!("[E131] not an E1.31 data packet, ignoring");
        return None;
    }
    let cid = Cid::from_bytes(data.get(CID_OFFSET..CID_OFFSET + 16)?)?;

    // framing layer
    let (framing_flags, framing_length) = flags_and_length(data, FRAMING_OFFSET)?;
    if framing_flags & FLAG_VECTOR == 0 || FRAMING_OFFSET + framing_length > data.len() {
        log::info!("[E131] bad framing layer, dropping packet");
        return None;
    }
    if read_u32(data, FRAMING_OFFSET + 2)? != FRAMING_VECTOR_DMX {
        log::debug!("[E131] non-DMX framing vector, ignoring");
        return None;
    }

    // Revision detection: the layout is whichever makes the nested DMP PDU
    // length consistent with the framing length.
    let rev2 = if framing_length > CURRENT_DMP_OFFSET
        && dmp_length_matches(
            data,
            FRAMING_OFFSET + CURRENT_DMP_OFFSET,
            framing_length - CURRENT_DMP_OFFSET,
        ) {
        false
    } else if framing_length > REV2_DMP_OFFSET
        && dmp_length_matches(
            data,
            FRAMING_OFFSET + REV2_DMP_OFFSET,
            framing_length - REV2_DMP_OFFSET,
        ) {
        true
    } else {
        log::info!("[E131] framing length doesn't match either revision, dropping");
        return None;
    };

    let header = if rev2 {
        E131Header {
            source_name: read_name(data, FRAMING_OFFSET + 6, 32)?,
            priority: *data.get(FRAMING_OFFSET + 38)?,
            sequence: *data.get(FRAMING_OFFSET + 39)?,
            preview: false,
            stream_terminated: false,
            universe: read_u16(data, FRAMING_OFFSET + 40)?,
            rev2: true,
        }
    } else {
        let options = *data.get(FRAMING_OFFSET + 74)?;
        E131Header {
            source_name: read_name(data, FRAMING_OFFSET + 6, 64)?,
            priority: *data.get(FRAMING_OFFSET + 70)?,
            sequence: *data.get(FRAMING_OFFSET + 73)?,
            preview: options & PREVIEW_DATA_MASK != 0,
            stream_terminated: options & STREAM_TERMINATED_MASK != 0,
            universe: read_u16(data, FRAMING_OFFSET + 75)?,
            rev2: false,
        }
    };

    // DMP layer
    let dmp_offset = FRAMING_OFFSET + if rev2 { REV2_DMP_OFFSET } else { CURRENT_DMP_OFFSET };
    let (dmp_flags, dmp_length) = flags_and_length(data, dmp_offset)?;
    let dmp_end = dmp_offset + dmp_length;
    if dmp_end > data.len() {
        log::info!("[E131] truncated DMP PDU, dropping packet");
        return None;
    }
    let mut cursor = dmp_offset + 2;
    let vector = if dmp_flags & FLAG_VECTOR != 0 {
        let v = *data.get(cursor)?;
        cursor += 1;
        Some(v)
    } else {
        None
    };
    let dmp_header = if dmp_flags & FLAG_HEADER != 0 {
        let h = *data.get(cursor)?;
        cursor += 1;
        Some(h)
    } else {
        None
    };
    let payload = data.get(cursor..dmp_end)?;

    Some(RawFrame {
        cid,
        header,
        dmp: DmpPdu {
            vector,
            header: dmp_header,
            payload,
        },
    })
}

/// Build a ratified-layout E1.31 data packet.
///
/// Exists for the loopback load generator and the tests; the daemon core
/// itself only receives.
pub fn build_dmx_packet(
    cid: &Cid,
    source_name: &str,
    universe: u16,
    sequence: u8,
    priority: u8,
    options: u8,
    start_code: u8,
    slots: &[u8],
) -> Vec<u8> {
    let property_count = 1 + slots.len() as u16; // start code + slots
    let dmp_length = 2 + 1 + 1 + 6 + usize::from(property_count);
    let framing_length = CURRENT_DMP_OFFSET + dmp_length;
    let root_length = 22 + framing_length;

    let mut packet = Vec::with_capacity(FRAMING_OFFSET + framing_length);
    // preamble
    packet.extend_from_slice(&0x0010u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&ACN_PACKET_ID);
    // root layer
    packet.extend_from_slice(&flags_len_word(root_length));
    packet.extend_from_slice(&ROOT_VECTOR_E131_DATA.to_be_bytes());
    packet.extend_from_slice(cid.as_bytes());
    // framing layer
    packet.extend_from_slice(&flags_len_word(framing_length));
    packet.extend_from_slice(&FRAMING_VECTOR_DMX.to_be_bytes());
    let mut name = [0u8; 64];
    let name_bytes = source_name.as_bytes();
    let copy = name_bytes.len().min(63);
    name[..copy].copy_from_slice(&name_bytes[..copy]);
    packet.extend_from_slice(&name);
    packet.push(priority);
    packet.extend_from_slice(&0u16.to_be_bytes()); // sync address
    packet.push(sequence);
    packet.push(options);
    packet.extend_from_slice(&universe.to_be_bytes());
    // DMP layer
    packet.extend_from_slice(&flags_len_word(dmp_length));
    packet.push(super::dmp::DMP_SET_PROPERTY_VECTOR);
    packet.push(0xa1); // virtual, absolute, range-equal, two-byte fields
    packet.extend_from_slice(&0u16.to_be_bytes()); // first property address
    packet.extend_from_slice(&1u16.to_be_bytes()); // increment
    packet.extend_from_slice(&property_count.to_be_bytes());
    packet.push(start_code);
    packet.extend_from_slice(slots);
    packet
}

fn flags_len_word(length: usize) -> [u8; 2] {
    let word = 0x7000 | (length as u16 & 0x0fff);
    word.to_be_bytes()
}
