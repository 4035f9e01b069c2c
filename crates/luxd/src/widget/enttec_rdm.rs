// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RDM transport over an Enttec Usb Pro.
//!
//! The Pro carries one RDM exchange at a time: the host sends label 7
//! (or 11 for discovery-unique-branch), the widget answers on label 5
//! with a status byte + the raw response frame, and label 12 ("timeout")
//! arrives when an exchange ends without a usable reply. This adapter
//! turns that into the [`RdmTransport`] contract the queueing controller
//! wraps.
//!
//! The adapter lives on the main loop with the plugin, so it can hold the
//! non-`Send` completion callbacks; the bare [`EnttecUsbProWidget`] stays
//! `Send` for the discovery-thread handoff.

use super::frame::{self, FrameDecoder};
use super::widgets::EnttecUsbProWidget;
use crate::dmx::DmxBuffer;
use crate::rdm::controller::{RdmCallback, RdmTransport};
use crate::rdm::{serializer, RdmRequest, ResponseStatus, CommandClass, PID_DISC_UNIQUE_BRANCH, RDM_START_CODE};

/// Label 5: a frame received on the DMX line (status + start code + data).
pub const RECEIVED_DMX_LABEL: u8 = 5;
/// Label 7: host-to-widget RDM request.
pub const RDM_PACKET_LABEL: u8 = 7;
/// Label 11: host-to-widget discovery-unique-branch request.
pub const RDM_DISCOVERY_LABEL: u8 = 11;
/// Label 12: the widget's end-of-exchange marker.
pub const RDM_TIMEOUT_LABEL: u8 = 12;

/// The port id this widget reports in re-originated requests.
const PORT_ID: u8 = 1;

struct PendingRdm {
    broadcast: bool,
    dub: bool,
    on_complete: RdmCallback,
    packets: Vec<Vec<u8>>,
}

/// Received-DMX handler: frames with start code 0 that arrive between RDM
/// exchanges.
pub type DmxFrameHandler = Box<dyn FnMut(&DmxBuffer)>;

/// Single-exchange RDM plumbing around an [`EnttecUsbProWidget`].
pub struct EnttecUsbProRdm {
    widget: EnttecUsbProWidget,
    decoder: FrameDecoder,
    transaction_number: u8,
    pending: Option<PendingRdm>,
    dmx_handler: Option<DmxFrameHandler>,
}

impl EnttecUsbProRdm {
    pub fn new(widget: EnttecUsbProWidget) -> Self {
        EnttecUsbProRdm {
            widget,
            decoder: FrameDecoder::new(),
            transaction_number: 0,
            pending: None,
            dmx_handler: None,
        }
    }

    pub fn widget(&self) -> &EnttecUsbProWidget {
        &self.widget
    }

    pub fn widget_mut(&mut self) -> &mut EnttecUsbProWidget {
        &mut self.widget
    }

    /// Install the handler for plain DMX frames the widget receives.
    pub fn set_dmx_handler(&mut self, handler: DmxFrameHandler) {
        self.dmx_handler = Some(handler);
    }

    /// Drain the descriptor and process widget messages. Call from the
    /// read-readiness callback registered for the widget's fd.
    pub fn descriptor_ready(&mut self) {
        let mut data = Vec::new();
        let mut buffer = [0u8; 512];
        loop {
            match self.widget.descriptor_mut().read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&buffer[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[RDM] widget read error: {}", e);
                    break;
                }
            }
        }
        if data.is_empty() {
            return;
        }

        let mut messages = Vec::new();
        self.decoder
            .feed(&data, |label, body| messages.push((label, body.to_vec())));
        for (label, body) in messages {
            self.handle_message(label, &body);
        }
    }

    fn handle_message(&mut self, label: u8, body: &[u8]) {
        match label {
            RDM_PACKET_LABEL => {
                // host-to-widget only; the widget must never echo it
                log::warn!("[RDM] widget sent an RDM frame (label 7), ignoring");
            }
            RDM_TIMEOUT_LABEL => self.handle_rdm_timeout(body),
            RECEIVED_DMX_LABEL => self.handle_received_frame(body),
            other => {
                log::debug!("[RDM] unhandled widget message label {}", other);
            }
        }
    }

    /// The end-of-exchange marker. For a broadcast this is the expected
    /// outcome; for anything else it means no usable response arrived.
    fn handle_rdm_timeout(&mut self, body: &[u8]) {
        if !body.is_empty() {
            log::warn!("[RDM] strange timeout message, length was {}", body.len());
        }
        let Some(pending) = self.pending.take() else {
            log::debug!("[RDM] timeout marker with no exchange in flight");
            return;
        };
        let status = if pending.broadcast && !pending.dub {
            ResponseStatus::WasBroadcast
        } else {
            ResponseStatus::Timeout
        };
        (pending.on_complete)(status, None, pending.packets);
    }

    /// A frame from the DMX line: status byte, start code, then data.
    fn handle_received_frame(&mut self, body: &[u8]) {
        if body.len() < 2 {
            log::info!("[RDM] runt received-frame message, dropping");
            return;
        }
        if body[0] != 0 {
            log::info!("[RDM] widget reported line error {:#04x}, dropping frame", body[0]);
            return;
        }
        let frame = &body[1..];

        if frame[0] == RDM_START_CODE {
            let Some(mut pending) = self.pending.take() else {
                log::info!("[RDM] unsolicited RDM frame, dropping");
                return;
            };
            pending.packets.push(frame.to_vec());
            match serializer::decode_response(frame) {
                Some(response) => {
                    (pending.on_complete)(
                        ResponseStatus::CompletedOk,
                        Some(response),
                        pending.packets,
                    );
                }
                None => {
                    (pending.on_complete)(
                        ResponseStatus::InvalidResponse,
                        None,
                        pending.packets,
                    );
                }
            }
        } else if frame[0] == 0 {
            if let Some(handler) = self.dmx_handler.as_mut() {
                handler(&DmxBuffer::from_slice(&frame[1..]));
            }
        } else {
            log::debug!("[RDM] alternate start code {:#04x} frame, ignoring", frame[0]);
        }
    }
}

impl RdmTransport for EnttecUsbProRdm {
    fn send_rdm_request(&mut self, request: RdmRequest, on_complete: RdmCallback) {
        if self.pending.is_some() {
            log::warn!("[RDM] previous exchange hasn't completed, dropping request");
            on_complete(ResponseStatus::FailedToSend, None, Vec::new());
            return;
        }
        if !self.widget.supports_rdm() {
            log::warn!("[RDM] widget has no RDM support, dropping request");
            on_complete(ResponseStatus::FailedToSend, None, Vec::new());
            return;
        }

        // re-originate under this widget's UID
        let transaction_number = self.transaction_number;
        self.transaction_number = self.transaction_number.wrapping_add(1);
        let request = request.duplicate_with_controller_params(
            self.widget.uid(),
            transaction_number,
            PORT_ID,
        );

        let Some(frame_bytes) = serializer::encode_request(&request) else {
            on_complete(ResponseStatus::FailedToSend, None, Vec::new());
            return;
        };
        let dub = request.command_class() == CommandClass::DiscoverCommand
            && request.param_id() == PID_DISC_UNIQUE_BRANCH;
        let label = if dub {
            RDM_DISCOVERY_LABEL
        } else {
            RDM_PACKET_LABEL
        };

        if let Err(e) = self
            .widget
            .descriptor_mut()
            .write_all(&frame::encode_message(label, &frame_bytes))
        {
            log::warn!("[RDM] failed to write request: {}", e);
            on_complete(ResponseStatus::FailedToSend, None, Vec::new());
            return;
        }
        self.pending = Some(PendingRdm {
            broadcast: request.is_broadcast(),
            dub,
            on_complete,
            packets: Vec::new(),
        });
    }
}
