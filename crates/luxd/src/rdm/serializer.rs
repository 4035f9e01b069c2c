// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RDM wire serialization (E1.20 section 6).
//!
//! Frame layout, start code through checksum:
//!
//! ```text
//! 0xCC | 0x01 | msg len | dest (6) | src (6) | TN | port/resp type |
//! msg count | sub device (2) | CC | PID (2) | PDL | data | checksum (2)
//! ```
//!
//! `msg len` counts every octet before the checksum; the checksum is the
//! 16-bit sum of those octets. Transports that put RDM on a wire (USB
//! widgets, network carriers) use this; the controllers never look inside.

use super::command::{RdmRequest, RdmResponse};
use super::uid::{Uid, UID_SIZE};
use super::{CommandClass, ResponseType, RDM_START_CODE};

/// Sub-start code for E1.20 messages.
pub const SUB_START_CODE: u8 = 0x01;

/// Octets before the parameter data.
const HEADER_SIZE: usize = 24;
/// Smallest valid frame: header + checksum.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 2;
/// Largest parameter data length.
pub const MAX_PARAM_DATA_LENGTH: usize = 231;

fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)))
}

#[allow(clippy::too_many_arguments)] // one packer serves requests and responses
fn pack(
    destination: Uid,
    source: Uid,
    transaction_number: u8,
    port_or_response_type: u8,
    message_count: u8,
    sub_device: u16,
    command_class: CommandClass,
    param_id: u16,
    param_data: &[u8],
) -> Vec<u8> {
    let message_length = HEADER_SIZE + param_data.len();
    let mut frame = Vec::with_capacity(message_length + 2);
    frame.push(RDM_START_CODE);
    frame.push(SUB_START_CODE);
    frame.push(message_length as u8);
    frame.extend_from_slice(&destination.to_bytes());
    frame.extend_from_slice(&source.to_bytes());
    frame.push(transaction_number);
    frame.push(port_or_response_type);
    frame.push(message_count);
    frame.extend_from_slice(&sub_device.to_be_bytes());
    frame.push(command_class as u8);
    frame.extend_from_slice(&param_id.to_be_bytes());
    frame.push(param_data.len() as u8);
    frame.extend_from_slice(param_data);
    let sum = checksum(&frame);
    frame.extend_from_slice(&sum.to_be_bytes());
    frame
}

/// Serialize a request, start code included.
///
/// Returns None when the parameter data exceeds the E1.20 limit.
pub fn encode_request(request: &RdmRequest) -> Option<Vec<u8>> {
    if request.param_data().len() > MAX_PARAM_DATA_LENGTH {
        log::warn!(
            "[RDM] parameter data too long to serialize: {}",
            request.param_data().len()
        );
        return None;
    }
    Some(pack(
        request.destination(),
        request.source(),
        request.transaction_number(),
        request.port_id(),
        0,
        request.sub_device(),
        request.command_class(),
        request.param_id(),
        request.param_data(),
    ))
}

/// Serialize a response, start code included. Used by responder emulations
/// and the loopback tests.
pub fn encode_response(response: &RdmResponse) -> Option<Vec<u8>> {
    if response.param_data().len() > MAX_PARAM_DATA_LENGTH {
        return None;
    }
    Some(pack(
        response.destination(),
        response.source(),
        response.transaction_number(),
        response.response_type() as u8,
        response.message_count(),
        response.sub_device(),
        response.command_class(),
        response.param_id(),
        response.param_data(),
    ))
}

/// Parse a response frame (start code included).
///
/// Returns None, with an info log, for anything that fails validation:
/// short frames, wrong start codes, bad checksums, non-response command
/// classes or unknown response types.
pub fn decode_response(frame: &[u8]) -> Option<RdmResponse> {
    if frame.len() < MIN_FRAME_SIZE {
        log::info!("[RDM] response frame too short: {} octets", frame.len());
        return None;
    }
    if frame[0] != RDM_START_CODE || frame[1] != SUB_START_CODE {
        log::info!(
            "[RDM] bad start codes {:#04x} {:#04x}",
            frame[0],
            frame[1]
        );
        return None;
    }
    let message_length = usize::from(frame[2]);
    if message_length < HEADER_SIZE || frame.len() < message_length + 2 {
        log::info!("[RDM] bad message length {}", message_length);
        return None;
    }
    let expected = u16::from_be_bytes([frame[message_length], frame[message_length + 1]]);
    let actual = checksum(&frame[..message_length]);
    if expected != actual {
        log::info!(
            "[RDM] checksum mismatch: expected {:#06x}, got {:#06x}",
            expected,
            actual
        );
        return None;
    }

    let destination = Uid::from_bytes(&frame[3..3 + UID_SIZE])?;
    let source = Uid::from_bytes(&frame[9..9 + UID_SIZE])?;
    let transaction_number = frame[15];
    let Some(response_type) = ResponseType::from_u8(frame[16]) else {
        log::info!("[RDM] unknown response type {:#04x}", frame[16]);
        return None;
    };
    let message_count = frame[17];
    let sub_device = u16::from_be_bytes([frame[18], frame[19]]);
    let Some(command_class) = CommandClass::from_u8(frame[20]) else {
        log::info!("[RDM] unknown command class {:#04x}", frame[20]);
        return None;
    };
    if command_class.response_class().is_some() {
        log::info!("[RDM] frame is a request, not a response");
        return None;
    }
    let param_id = u16::from_be_bytes([frame[21], frame[22]]);
    let param_data_length = usize::from(frame[23]);
    if HEADER_SIZE + param_data_length != message_length {
        log::info!("[RDM] parameter data length doesn't match message length");
        return None;
    }
    let param_data = frame[HEADER_SIZE..HEADER_SIZE + param_data_length].to_vec();

    Some(RdmResponse::new(
        source,
        destination,
        transaction_number,
        response_type,
        message_count,
        sub_device,
        command_class,
        param_id,
        param_data,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdm::command::ROOT_DEVICE;

    fn request() -> RdmRequest {
        RdmRequest::new(
            Uid::new(0x454e, 0x0102_0304),
            Uid::new(0x4744, 0x0a0b_0c0d),
            9,
            1,
            ROOT_DEVICE,
            CommandClass::GetCommand,
            0x0060, // DEVICE_INFO
            vec![],
        )
    }

    #[test]
    fn test_request_layout() {
        let frame = encode_request(&request()).unwrap();
        assert_eq!(frame[0], RDM_START_CODE);
        assert_eq!(frame[1], SUB_START_CODE);
        assert_eq!(frame[2] as usize, HEADER_SIZE);
        // destination then source
        assert_eq!(&frame[3..9], &[0x47, 0x44, 0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&frame[9..15], &[0x45, 0x4e, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame[15], 9); // transaction
        assert_eq!(frame[16], 1); // port
        assert_eq!(frame[20], CommandClass::GetCommand as u8);
        assert_eq!(frame.len(), MIN_FRAME_SIZE);
    }

    #[test]
    fn test_response_round_trip() {
        let response = RdmResponse::from_request(&request(), ResponseType::Ack, vec![1, 2, 3]);
        let frame = encode_response(&response).unwrap();
        let decoded = decode_response(&frame).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_checksum_is_validated() {
        let response = RdmResponse::from_request(&request(), ResponseType::Ack, vec![1]);
        let mut frame = encode_response(&response).unwrap();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        assert!(decode_response(&frame).is_none());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let response = RdmResponse::from_request(&request(), ResponseType::Ack, vec![1, 2]);
        let frame = encode_response(&response).unwrap();
        assert!(decode_response(&frame[..frame.len() - 3]).is_none());
    }

    #[test]
    fn test_request_frame_is_not_a_response() {
        let frame = encode_request(&request()).unwrap();
        assert!(decode_response(&frame).is_none());
    }

    #[test]
    fn test_oversize_param_data_refused() {
        let request = RdmRequest::new(
            Uid::new(1, 1),
            Uid::new(2, 2),
            0,
            1,
            ROOT_DEVICE,
            CommandClass::SetCommand,
            0x1000,
            vec![0; MAX_PARAM_DATA_LENGTH + 1],
        );
        assert!(encode_request(&request).is_none());
    }
}
