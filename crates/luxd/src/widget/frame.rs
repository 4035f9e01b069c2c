// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The Usb Pro wire frame.
//!
//! Every message in the Enttec Usb Pro family shares one layout:
//!
//! ```text
//! 0x7E | label | len lo | len hi | payload (len bytes) | 0xE7
//! ```
//!
//! The decoder is an incremental state machine: feed it whatever bytes the
//! serial line produced and it emits complete (label, payload) messages,
//! resynchronizing on the start-of-message octet after garbage.

/// Start-of-message octet.
pub const SOM: u8 = 0x7e;
/// End-of-message octet.
pub const EOM: u8 = 0xe7;

/// Send a DMX frame.
pub const DMX_LABEL: u8 = 6;
/// Serial number query/response.
pub const SERIAL_LABEL: u8 = 10;
/// Manufacturer id query/response.
pub const MANUFACTURER_LABEL: u8 = 77;
/// Device id query/response.
pub const DEVICE_LABEL: u8 = 78;

/// Largest payload a widget will send us.
const MAX_DATA_SIZE: usize = 600;

/// Frame a message for the wire.
pub fn encode_message(label: u8, data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(5 + data.len());
    message.push(SOM);
    message.push(label);
    message.push((data.len() & 0xff) as u8);
    message.push((data.len() >> 8) as u8);
    message.extend_from_slice(data);
    message.push(EOM);
    message
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    PreSom,
    Label,
    SizeLo,
    SizeHi,
    Body,
    Eom,
}

/// Incremental Usb Pro frame decoder.
pub struct FrameDecoder {
    state: DecodeState,
    label: u8,
    expected: usize,
    body: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            state: DecodeState::PreSom,
            label: 0,
            expected: 0,
            body: Vec::new(),
        }
    }

    /// Feed raw bytes; `sink` is called once per complete message.
    pub fn feed<F: FnMut(u8, &[u8])>(&mut self, data: &[u8], mut sink: F) {
        for &byte in data {
            match self.state {
                DecodeState::PreSom => {
                    if byte == SOM {
                        self.state = DecodeState::Label;
                    }
                }
                DecodeState::Label => {
                    self.label = byte;
                    self.state = DecodeState::SizeLo;
                }
                DecodeState::SizeLo => {
                    self.expected = usize::from(byte);
                    self.state = DecodeState::SizeHi;
                }
                DecodeState::SizeHi => {
                    self.expected |= usize::from(byte) << 8;
                    if self.expected > MAX_DATA_SIZE {
                        log::info!(
                            "[DETECT] oversize Usb Pro frame ({} bytes), resyncing",
                            self.expected
                        );
                        self.state = DecodeState::PreSom;
                    } else {
                        self.body.clear();
                        self.state = if self.expected == 0 {
                            DecodeState::Eom
                        } else {
                            DecodeState::Body
                        };
                    }
                }
                DecodeState::Body => {
                    self.body.push(byte);
                    if self.body.len() == self.expected {
                        self.state = DecodeState::Eom;
                    }
                }
                DecodeState::Eom => {
                    if byte == EOM {
                        sink(self.label, &self.body);
                    } else {
                        log::info!("[DETECT] missing EOM, dropping frame");
                    }
                    self.state = DecodeState::PreSom;
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(decoder: &mut FrameDecoder, data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        decoder.feed(data, |label, body| out.push((label, body.to_vec())));
        out
    }

    #[test]
    fn test_encode_layout() {
        let message = encode_message(MANUFACTURER_LABEL, &[]);
        assert_eq!(message, vec![SOM, MANUFACTURER_LABEL, 0, 0, EOM]);

        let message = encode_message(DMX_LABEL, &[0, 1, 2]);
        assert_eq!(message, vec![SOM, DMX_LABEL, 3, 0, 0, 1, 2, EOM]);
    }

    #[test]
    fn test_decode_round_trip() {
        let mut decoder = FrameDecoder::new();
        let wire = encode_message(SERIAL_LABEL, &[0x78, 0x56, 0x34, 0x12]);
        let messages = collect(&mut decoder, &wire);
        assert_eq!(messages, vec![(SERIAL_LABEL, vec![0x78, 0x56, 0x34, 0x12])]);
    }

    #[test]
    fn test_decode_across_split_reads() {
        let mut decoder = FrameDecoder::new();
        let wire = encode_message(DEVICE_LABEL, &[1, 2]);
        let (a, b) = wire.split_at(3);
        assert!(collect(&mut decoder, a).is_empty());
        assert_eq!(collect(&mut decoder, b), vec![(DEVICE_LABEL, vec![1, 2])]);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut decoder = FrameDecoder::new();
        let mut wire = vec![0x00, 0x42, 0x13];
        wire.extend(encode_message(MANUFACTURER_LABEL, &[0x4e, 0x45]));
        let messages = collect(&mut decoder, &wire);
        assert_eq!(messages, vec![(MANUFACTURER_LABEL, vec![0x4e, 0x45])]);
    }

    #[test]
    fn test_missing_eom_drops_frame() {
        let mut decoder = FrameDecoder::new();
        let mut wire = encode_message(SERIAL_LABEL, &[1, 2, 3, 4]);
        let last = wire.len() - 1;
        wire[last] = 0x00; // corrupt the EOM
        assert!(collect(&mut decoder, &wire).is_empty());

        // decoder recovers for the next frame
        let ok = encode_message(SERIAL_LABEL, &[5, 6, 7, 8]);
        assert_eq!(collect(&mut decoder, &ok).len(), 1);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut decoder = FrameDecoder::new();
        let mut wire = encode_message(MANUFACTURER_LABEL, &[1, 1]);
        wire.extend(encode_message(DEVICE_LABEL, &[2, 2]));
        let messages = collect(&mut decoder, &wire);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, MANUFACTURER_LABEL);
        assert_eq!(messages[1].0, DEVICE_LABEL);
    }
}
