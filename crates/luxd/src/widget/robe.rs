// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The Robe wire frame and detector.
//!
//! Robe Universal Interface frames:
//!
//! ```text
//! 0xA5 | type | len lo | len hi | header sum | payload | full sum
//! ```
//!
//! Both checksums are byte sums modulo 256: the header sum covers the four
//! octets before it, the full sum covers everything before it (header sum
//! included).
//!
//! Detection sends INFO_REQUEST, expects hardware/software/eeprom
//! versions, then UID_REQUEST for the 6-octet RDM UID.

use super::detector::{ProbeVerdict, WidgetDetector};
use super::serial::SerialDescriptor;
use super::{RobeWidgetInformation, WidgetInformation};
use crate::rdm::uid::Uid;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// Start-of-message octet.
pub const ROBE_SOM: u8 = 0xa5;

pub const INFO_REQUEST: u8 = 0x14;
pub const INFO_RESPONSE: u8 = 0x15;
pub const UID_REQUEST: u8 = 0x24;
pub const UID_RESPONSE: u8 = 0x25;

const MAX_DATA_SIZE: usize = 600;

/// Frame a Robe message for the wire.
pub fn encode_robe_message(packet_type: u8, data: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(6 + data.len());
    message.push(ROBE_SOM);
    message.push(packet_type);
    message.push((data.len() & 0xff) as u8);
    message.push((data.len() >> 8) as u8);
    let header_sum = message.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    message.push(header_sum);
    message.extend_from_slice(data);
    let full_sum = message.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    message.push(full_sum);
    message
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RobeDecodeState {
    PreSom,
    Type,
    SizeLo,
    SizeHi,
    HeaderSum,
    Body,
    FullSum,
}

/// Incremental Robe frame decoder.
pub struct RobeFrameDecoder {
    state: RobeDecodeState,
    packet_type: u8,
    expected: usize,
    body: Vec<u8>,
    running_sum: u8,
}

impl RobeFrameDecoder {
    pub fn new() -> Self {
        RobeFrameDecoder {
            state: RobeDecodeState::PreSom,
            packet_type: 0,
            expected: 0,
            body: Vec::new(),
            running_sum: 0,
        }
    }

    /// Feed raw bytes; `sink` is called once per checksum-clean message.
    pub fn feed<F: FnMut(u8, &[u8])>(&mut self, data: &[u8], mut sink: F) {
        for &byte in data {
            match self.state {
                RobeDecodeState::PreSom => {
                    if byte == ROBE_SOM {
                        self.running_sum = byte;
                        self.state = RobeDecodeState::Type;
                    }
                }
                RobeDecodeState::Type => {
                    self.packet_type = byte;
                    self.running_sum = self.running_sum.wrapping_add(byte);
                    self.state = RobeDecodeState::SizeLo;
                }
                RobeDecodeState::SizeLo => {
                    self.expected = usize::from(byte);
                    self.running_sum = self.running_sum.wrapping_add(byte);
                    self.state = RobeDecodeState::SizeHi;
                }
                RobeDecodeState::SizeHi => {
                    self.expected |= usize::from(byte) << 8;
                    self.running_sum = self.running_sum.wrapping_add(byte);
                    if self.expected > MAX_DATA_SIZE {
                        log::info!("[DETECT] oversize Robe frame, resyncing");
                        self.state = RobeDecodeState::PreSom;
                    } else {
                        self.state = RobeDecodeState::HeaderSum;
                    }
                }
                RobeDecodeState::HeaderSum => {
                    if byte != self.running_sum {
                        log::info!("[DETECT] Robe header checksum mismatch, resyncing");
                        self.state = RobeDecodeState::PreSom;
                        continue;
                    }
                    self.running_sum = self.running_sum.wrapping_add(byte);
                    self.body.clear();
                    self.state = if self.expected == 0 {
                        RobeDecodeState::FullSum
                    } else {
                        RobeDecodeState::Body
                    };
                }
                RobeDecodeState::Body => {
                    self.body.push(byte);
                    self.running_sum = self.running_sum.wrapping_add(byte);
                    if self.body.len() == self.expected {
                        self.state = RobeDecodeState::FullSum;
                    }
                }
                RobeDecodeState::FullSum => {
                    if byte == self.running_sum {
                        sink(self.packet_type, &self.body);
                    } else {
                        log::info!("[DETECT] Robe payload checksum mismatch, dropping");
                    }
                    self.state = RobeDecodeState::PreSom;
                }
            }
        }
    }
}

impl Default for RobeFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RobeStage {
    Info,
    Uid,
}

struct RobeProbe {
    stage: RobeStage,
    decoder: RobeFrameDecoder,
    hardware_version: u8,
    software_version: u8,
    eeprom_version: u8,
}

/// Detector for Robe Universal Interface widgets.
///
/// Both probe stages require an answer; silence rejects the device.
#[derive(Default)]
pub struct RobeWidgetDetector {
    probes: HashMap<RawFd, RobeProbe>,
}

impl RobeWidgetDetector {
    pub fn new() -> Self {
        RobeWidgetDetector::default()
    }

    fn send(descriptor: &mut SerialDescriptor, packet_type: u8) -> bool {
        if let Err(e) = descriptor.write_all(&encode_robe_message(packet_type, &[])) {
            log::info!(
                "[DETECT] robe request {:#04x} failed on {}: {}",
                packet_type,
                descriptor.path().display(),
                e
            );
            return false;
        }
        true
    }
}

impl WidgetDetector for RobeWidgetDetector {
    fn protocol(&self) -> &'static str {
        "robe"
    }

    fn begin(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor) -> bool {
        self.probes.insert(
            fd,
            RobeProbe {
                stage: RobeStage::Info,
                decoder: RobeFrameDecoder::new(),
                hardware_version: 0,
                software_version: 0,
                eeprom_version: 0,
            },
        );
        Self::send(descriptor, INFO_REQUEST)
    }

    fn feed(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor, data: &[u8]) -> ProbeVerdict {
        let Some(probe) = self.probes.get_mut(&fd) else {
            log::error!("[DETECT] robe feed for unknown fd {}", fd);
            return ProbeVerdict::Rejected;
        };

        let mut messages = Vec::new();
        probe
            .decoder
            .feed(data, |packet_type, body| messages.push((packet_type, body.to_vec())));

        for (packet_type, body) in messages {
            match (probe.stage, packet_type) {
                (RobeStage::Info, INFO_RESPONSE) => {
                    if body.len() < 3 {
                        log::info!("[DETECT] short Robe info answer, rejecting");
                        return ProbeVerdict::Rejected;
                    }
                    probe.hardware_version = body[0];
                    probe.software_version = body[1];
                    probe.eeprom_version = body[2];
                    probe.stage = RobeStage::Uid;
                    if !Self::send(descriptor, UID_REQUEST) {
                        return ProbeVerdict::Rejected;
                    }
                }
                (RobeStage::Uid, UID_RESPONSE) => {
                    let Some(uid) = Uid::from_bytes(&body) else {
                        log::info!("[DETECT] short Robe UID answer, rejecting");
                        return ProbeVerdict::Rejected;
                    };
                    return ProbeVerdict::Recognized(WidgetInformation::Robe(
                        RobeWidgetInformation {
                            uid,
                            hardware_version: probe.hardware_version,
                            software_version: probe.software_version,
                            eeprom_version: probe.eeprom_version,
                        },
                    ));
                }
                (_, other) => {
                    log::debug!("[DETECT] unexpected Robe packet {:#04x}", other);
                }
            }
        }
        ProbeVerdict::Pending
    }

    fn on_timeout(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor) -> ProbeVerdict {
        log::debug!(
            "[DETECT] robe probe timed out on {}",
            descriptor.path().display()
        );
        self.probes.remove(&fd);
        ProbeVerdict::Rejected
    }

    fn abandon(&mut self, fd: RawFd) {
        self.probes.remove(&fd);
    }
}
