// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Widget detectors.
//!
//! A detector probes one protocol family. The discovery thread walks a
//! descriptor through the detector list in order; each detector sends a
//! bounded sequence of identifying queries and reports a verdict per
//! probe step. Detector state is per-descriptor, so one detector instance
//! serves any number of simultaneous probes.

use super::frame::{self, FrameDecoder};
use super::serial::SerialDescriptor;
use super::{UsbProWidgetInformation, WidgetInformation};
use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// Outcome of one probe step.
#[derive(Debug)]
pub enum ProbeVerdict {
    /// Still waiting; keep the stage timeout armed.
    Pending,
    /// The device answered enough to classify.
    Recognized(WidgetInformation),
    /// Not this protocol family; move on.
    Rejected,
}

/// One protocol family's probe logic.
pub trait WidgetDetector {
    fn protocol(&self) -> &'static str;

    /// Start probing a descriptor: send the first query. Returning false
    /// means the probe could not even start (write failure).
    fn begin(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor) -> bool;

    /// Bytes arrived for a descriptor being probed.
    fn feed(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor, data: &[u8]) -> ProbeVerdict;

    /// The per-stage timeout fired without an answer.
    fn on_timeout(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor) -> ProbeVerdict;

    /// Drop any state held for a descriptor.
    fn abandon(&mut self, fd: RawFd);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UsbProStage {
    Manufacturer,
    Device,
    Serial,
}

struct UsbProProbe {
    stage: UsbProStage,
    decoder: FrameDecoder,
    information: UsbProWidgetInformation,
}

/// Detector for the Enttec Usb Pro frame family.
///
/// Sends MANUFACTURER (77), DEVICE (78) and SERIAL (10) queries in turn.
/// Manufacturer and device answers are optional (older firmware doesn't
/// implement them); the serial answer is required.
#[derive(Default)]
pub struct UsbProWidgetDetector {
    probes: HashMap<RawFd, UsbProProbe>,
}

impl UsbProWidgetDetector {
    pub fn new() -> Self {
        UsbProWidgetDetector::default()
    }

    fn send_query(descriptor: &mut SerialDescriptor, label: u8) -> bool {
        if let Err(e) = descriptor.write_all(&frame::encode_message(label, &[])) {
            log::info!(
                "[DETECT] usbpro query {} failed on {}: {}",
                label,
                descriptor.path().display(),
                e
            );
            return false;
        }
        true
    }

    /// Advance to the next stage query; returns the verdict for a missing
    /// answer at the current stage.
    fn next_stage(probe: &mut UsbProProbe, descriptor: &mut SerialDescriptor) -> ProbeVerdict {
        match probe.stage {
            UsbProStage::Manufacturer => {
                probe.stage = UsbProStage::Device;
                if Self::send_query(descriptor, frame::DEVICE_LABEL) {
                    ProbeVerdict::Pending
                } else {
                    ProbeVerdict::Rejected
                }
            }
            UsbProStage::Device => {
                probe.stage = UsbProStage::Serial;
                if Self::send_query(descriptor, frame::SERIAL_LABEL) {
                    ProbeVerdict::Pending
                } else {
                    ProbeVerdict::Rejected
                }
            }
            UsbProStage::Serial => ProbeVerdict::Rejected,
        }
    }

    fn handle_message(
        probe: &mut UsbProProbe,
        descriptor: &mut SerialDescriptor,
        label: u8,
        body: &[u8],
    ) -> ProbeVerdict {
        match label {
            frame::MANUFACTURER_LABEL if probe.stage == UsbProStage::Manufacturer => {
                if body.len() >= 2 {
                    probe.information.esta_id = u16::from_le_bytes([body[0], body[1]]);
                    probe.information.manufacturer =
                        String::from_utf8_lossy(&body[2..]).trim_end_matches('\0').to_string();
                }
                Self::next_stage(probe, descriptor)
            }
            frame::DEVICE_LABEL if probe.stage == UsbProStage::Device => {
                if body.len() >= 2 {
                    probe.information.device_id = u16::from_le_bytes([body[0], body[1]]);
                    probe.information.device =
                        String::from_utf8_lossy(&body[2..]).trim_end_matches('\0').to_string();
                }
                Self::next_stage(probe, descriptor)
            }
            frame::SERIAL_LABEL if probe.stage == UsbProStage::Serial => {
                if body.len() < 4 {
                    log::info!("[DETECT] short serial answer, rejecting");
                    return ProbeVerdict::Rejected;
                }
                probe.information.serial =
                    u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                ProbeVerdict::Recognized(WidgetInformation::UsbPro(probe.information.clone()))
            }
            other => {
                log::debug!("[DETECT] unexpected usbpro label {} during probe", other);
                ProbeVerdict::Pending
            }
        }
    }
}

impl WidgetDetector for UsbProWidgetDetector {
    fn protocol(&self) -> &'static str {
        "usbpro"
    }

    fn begin(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor) -> bool {
        let probe = UsbProProbe {
            stage: UsbProStage::Manufacturer,
            decoder: FrameDecoder::new(),
            information: UsbProWidgetInformation::default(),
        };
        self.probes.insert(fd, probe);
        Self::send_query(descriptor, frame::MANUFACTURER_LABEL)
    }

    fn feed(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor, data: &[u8]) -> ProbeVerdict {
        let Some(probe) = self.probes.get_mut(&fd) else {
            log::error!("[DETECT] usbpro feed for unknown fd {}", fd);
            return ProbeVerdict::Rejected;
        };

        let mut messages = Vec::new();
        probe
            .decoder
            .feed(data, |label, body| messages.push((label, body.to_vec())));

        for (label, body) in messages {
            match Self::handle_message(probe, descriptor, label, &body) {
                ProbeVerdict::Pending => {}
                verdict => return verdict,
            }
        }
        ProbeVerdict::Pending
    }

    fn on_timeout(&mut self, fd: RawFd, descriptor: &mut SerialDescriptor) -> ProbeVerdict {
        let Some(probe) = self.probes.get_mut(&fd) else {
            return ProbeVerdict::Rejected;
        };
        log::debug!(
            "[DETECT] usbpro stage {:?} timed out on {}",
            probe.stage,
            descriptor.path().display()
        );
        Self::next_stage(probe, descriptor)
    }

    fn abandon(&mut self, fd: RawFd) {
        self.probes.remove(&fd);
    }
}
