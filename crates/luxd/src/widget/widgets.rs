// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Concrete widget variants and the classification table.
//!
//! Once a probe succeeds, the information record selects the concrete
//! variant. The rules run in order, first match wins; anything unmatched
//! is a generic Usb Pro with RDM gated on firmware.

use super::frame;
use super::serial::SerialDescriptor;
use super::UsbProWidgetInformation;
use crate::dmx::DmxBuffer;
use crate::rdm::uid::Uid;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;

// ESTA manufacturer ids seen during classification.
pub const ENTTEC_ESTA_ID: u16 = 0x454e;
pub const GODDARD_ESTA_ID: u16 = 0x4744;
pub const JESE_ESTA_ID: u16 = 0x6864;
pub const DMX_KING_ESTA_ID: u16 = 0x6a6b;
pub const OPEN_LIGHTING_ESTA_ID: u16 = 0x7a70;

// DMXKing device ids.
pub const DMX_KING_ULTRA_ID: u16 = 0x0000;
pub const DMX_KING_ULTRA_RDM_ID: u16 = 0x0001;
pub const DMX_KING_ULTRA_PRO_ID: u16 = 0x0002;

// Goddard Design device ids.
pub const GODDARD_DMXTER4_ID: u16 = 0x444d;
pub const GODDARD_DMXTER4A_ID: u16 = 0x4441;
pub const GODDARD_MINI_DMXTER4_ID: u16 = 0x4d44;

// JESE device ids.
pub const JESE_DMX_TRI_MK1_ID: u16 = 0x0001;
pub const JESE_RDM_TRI_MK1_ID: u16 = 0x0002;
pub const JESE_RDM_TRI_MK2_ID: u16 = 0x0003;
pub const JESE_RDM_TXI_MK2_ID: u16 = 0x0004;
pub const JESE_DMX_TRI_MK1_SE_ID: u16 = 0x0005;

// Open Lighting device ids.
pub const OPEN_LIGHTING_RGB_MIXER_ID: u16 = 0x0001;
pub const OPEN_LIGHTING_PACKETHEADS_ID: u16 = 0x0002;

/// First firmware with working RDM on the Usb Pro.
const USB_PRO_RDM_FIRMWARE: u16 = 0x0204;
/// First firmware without the RDM DUB timeout quirk.
const USB_PRO_NO_DUB_TIMEOUT_FIRMWARE: u16 = 0x040f;

/// DMX send labels for the Ultra's two ports.
const ULTRA_DMX_PRIMARY_LABEL: u8 = 100;
const ULTRA_DMX_SECONDARY_LABEL: u8 = 101;

fn send_dmx_message(
    descriptor: &mut SerialDescriptor,
    label: u8,
    buffer: &DmxBuffer,
) -> io::Result<()> {
    // frame payload is the start code followed by the slots
    let mut payload = Vec::with_capacity(1 + buffer.len());
    payload.push(0x00);
    payload.extend_from_slice(buffer.as_slice());
    descriptor.write_all(&frame::encode_message(label, &payload))
}

/// The generic Enttec Usb Pro (and its drop-in replacements).
#[derive(Debug)]
pub struct EnttecUsbProWidget {
    descriptor: SerialDescriptor,
    uid: Uid,
    enable_rdm: bool,
    dual_port: bool,
    no_rdm_dub_timeout: bool,
}

impl EnttecUsbProWidget {
    pub fn new(
        descriptor: SerialDescriptor,
        esta_id: u16,
        serial: u32,
        enable_rdm: bool,
    ) -> Self {
        let esta_id = if esta_id == 0 { ENTTEC_ESTA_ID } else { esta_id };
        EnttecUsbProWidget {
            descriptor,
            uid: Uid::new(esta_id, serial),
            enable_rdm,
            dual_port: false,
            no_rdm_dub_timeout: false,
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn supports_rdm(&self) -> bool {
        self.enable_rdm
    }

    pub fn dual_port(&self) -> bool {
        self.dual_port
    }

    pub fn no_rdm_dub_timeout(&self) -> bool {
        self.no_rdm_dub_timeout
    }

    pub fn send_dmx(&mut self, buffer: &DmxBuffer) -> io::Result<()> {
        send_dmx_message(&mut self.descriptor, frame::DMX_LABEL, buffer)
    }

    pub(crate) fn descriptor_mut(&mut self) -> &mut SerialDescriptor {
        &mut self.descriptor
    }
}

/// DMXKing Ultra DMX Pro: one widget, two DMX outputs.
#[derive(Debug)]
pub struct UltraDmxProWidget {
    descriptor: SerialDescriptor,
    serial: u32,
}

impl UltraDmxProWidget {
    pub fn new(descriptor: SerialDescriptor, serial: u32) -> Self {
        UltraDmxProWidget { descriptor, serial }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn send_dmx_primary(&mut self, buffer: &DmxBuffer) -> io::Result<()> {
        send_dmx_message(&mut self.descriptor, ULTRA_DMX_PRIMARY_LABEL, buffer)
    }

    pub fn send_dmx_secondary(&mut self, buffer: &DmxBuffer) -> io::Result<()> {
        send_dmx_message(&mut self.descriptor, ULTRA_DMX_SECONDARY_LABEL, buffer)
    }
}

/// Goddard Design DMXter: an RDM test tool, no DMX output of its own.
#[derive(Debug)]
pub struct DmxterWidget {
    descriptor: SerialDescriptor,
    uid: Uid,
}

impl DmxterWidget {
    pub fn new(descriptor: SerialDescriptor, esta_id: u16, serial: u32) -> Self {
        DmxterWidget {
            descriptor,
            uid: Uid::new(esta_id, serial),
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn supports_rdm(&self) -> bool {
        true
    }
}

/// JESE DMX-TRI / RDM-TRI.
#[derive(Debug)]
pub struct DmxTriWidget {
    descriptor: SerialDescriptor,
}

impl DmxTriWidget {
    /// TRI extended command label.
    const EXTENDED_COMMAND_LABEL: u8 = 88;
    /// Single-universe transmit command.
    const SINGLE_TX_COMMAND_ID: u8 = 0x21;

    pub fn new(descriptor: SerialDescriptor) -> Self {
        DmxTriWidget { descriptor }
    }

    pub fn supports_rdm(&self) -> bool {
        true
    }

    pub fn send_dmx(&mut self, buffer: &DmxBuffer) -> io::Result<()> {
        let mut payload = Vec::with_capacity(2 + buffer.len());
        payload.push(Self::SINGLE_TX_COMMAND_ID);
        payload.push(0x00); // start code
        payload.extend_from_slice(buffer.as_slice());
        self.descriptor
            .write_all(&frame::encode_message(Self::EXTENDED_COMMAND_LABEL, &payload))
    }
}

/// Open Lighting Arduino RGB mixer.
#[derive(Debug)]
pub struct ArduinoWidget {
    descriptor: SerialDescriptor,
    uid: Uid,
}

impl ArduinoWidget {
    pub fn new(descriptor: SerialDescriptor, esta_id: u16, serial: u32) -> Self {
        ArduinoWidget {
            descriptor,
            uid: Uid::new(esta_id, serial),
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn send_dmx(&mut self, buffer: &DmxBuffer) -> io::Result<()> {
        send_dmx_message(&mut self.descriptor, frame::DMX_LABEL, buffer)
    }
}

/// Robe Universal Interface.
#[derive(Debug)]
pub struct RobeWidget {
    descriptor: SerialDescriptor,
    uid: Uid,
}

impl RobeWidget {
    /// Robe channel-data packet type.
    const CHANNEL_A_OUT: u8 = 0x06;

    pub fn new(descriptor: SerialDescriptor, uid: Uid) -> Self {
        RobeWidget { descriptor, uid }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn send_dmx(&mut self, buffer: &DmxBuffer) -> io::Result<()> {
        self.descriptor.write_all(&super::robe::encode_robe_message(
            Self::CHANNEL_A_OUT,
            buffer.as_slice(),
        ))
    }
}

/// A classified widget, ready for hand-off to the plugin observer.
#[derive(Debug)]
pub enum Widget {
    EnttecUsbPro(EnttecUsbProWidget),
    UltraDmxPro(UltraDmxProWidget),
    Dmxter(DmxterWidget),
    DmxTri(DmxTriWidget),
    Arduino(ArduinoWidget),
    Robe(RobeWidget),
}

impl Widget {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Widget::EnttecUsbPro(_) => "EnttecUsbPro",
            Widget::UltraDmxPro(_) => "UltraDmxPro",
            Widget::Dmxter(_) => "Dmxter",
            Widget::DmxTri(_) => "DmxTri",
            Widget::Arduino(_) => "Arduino",
            Widget::Robe(_) => "Robe",
        }
    }

    fn descriptor(&self) -> &SerialDescriptor {
        match self {
            Widget::EnttecUsbPro(w) => &w.descriptor,
            Widget::UltraDmxPro(w) => &w.descriptor,
            Widget::Dmxter(w) => &w.descriptor,
            Widget::DmxTri(w) => &w.descriptor,
            Widget::Arduino(w) => &w.descriptor,
            Widget::Robe(w) => &w.descriptor,
        }
    }

    /// The fd the observer registers with its own loop.
    pub fn raw_fd(&self) -> RawFd {
        self.descriptor().raw_fd()
    }

    /// The device path backing this widget.
    pub fn path(&self) -> &Path {
        self.descriptor().path()
    }
}

/// Classify a Usb Pro probe result into a concrete widget.
///
/// Rules run in order, first match wins.
pub fn classify_usb_pro(descriptor: SerialDescriptor, info: &UsbProWidgetInformation) -> Widget {
    match info.esta_id {
        DMX_KING_ESTA_ID => {
            if info.device_id == DMX_KING_ULTRA_PRO_ID {
                // the Ultra Pro has two outputs
                return Widget::UltraDmxPro(UltraDmxProWidget::new(descriptor, info.serial));
            }
            // other DMXKing devices are drop-in Usb Pro replacements
            let enable_rdm = info.device_id == DMX_KING_ULTRA_RDM_ID;
            return Widget::EnttecUsbPro(EnttecUsbProWidget::new(
                descriptor,
                info.esta_id,
                info.serial,
                enable_rdm,
            ));
        }
        GODDARD_ESTA_ID => {
            if matches!(
                info.device_id,
                GODDARD_DMXTER4_ID | GODDARD_DMXTER4A_ID | GODDARD_MINI_DMXTER4_ID
            ) {
                return Widget::Dmxter(DmxterWidget::new(descriptor, info.esta_id, info.serial));
            }
        }
        JESE_ESTA_ID => {
            if matches!(
                info.device_id,
                JESE_DMX_TRI_MK1_ID
                    | JESE_RDM_TRI_MK1_ID
                    | JESE_RDM_TRI_MK2_ID
                    | JESE_RDM_TXI_MK2_ID
                    | JESE_DMX_TRI_MK1_SE_ID
            ) {
                return Widget::DmxTri(DmxTriWidget::new(descriptor));
            }
        }
        OPEN_LIGHTING_ESTA_ID => {
            if matches!(
                info.device_id,
                OPEN_LIGHTING_RGB_MIXER_ID | OPEN_LIGHTING_PACKETHEADS_ID
            ) {
                return Widget::Arduino(ArduinoWidget::new(descriptor, info.esta_id, info.serial));
            }
        }
        _ => {}
    }

    log::info!("[DETECT] defaulting {} to a Usb Pro", descriptor.path().display());
    let enable_rdm = match info.firmware_version {
        Some(version) if version >= USB_PRO_RDM_FIRMWARE => true,
        Some(version) => {
            log::warn!(
                "[DETECT] Usb Pro firmware {}.{} is too old for RDM (need 2.4)",
                version >> 8,
                version & 0xff
            );
            false
        }
        None => false,
    };
    let mut widget =
        EnttecUsbProWidget::new(descriptor, info.esta_id, info.serial, enable_rdm);
    widget.dual_port = info.dual_port;
    widget.no_rdm_dub_timeout = matches!(
        info.firmware_version,
        Some(version) if version >= USB_PRO_NO_DUB_TIMEOUT_FIRMWARE
    );
    if widget.dual_port {
        log::info!("[DETECT] found an unlocked Usb Pro Mk II");
    }
    Widget::EnttecUsbPro(widget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn descriptor() -> SerialDescriptor {
        let (local, _remote) = UnixStream::pair().unwrap();
        // leak the remote end so the fd stays open for the test
        std::mem::forget(_remote);
        SerialDescriptor::from_fd(local.into(), Path::new("/mock"))
    }

    fn info(esta_id: u16, device_id: u16) -> UsbProWidgetInformation {
        UsbProWidgetInformation {
            esta_id,
            device_id,
            serial: 0x12345678,
            ..Default::default()
        }
    }

    #[test]
    fn test_dmx_king_ultra_pro() {
        let widget = classify_usb_pro(descriptor(), &info(DMX_KING_ESTA_ID, DMX_KING_ULTRA_PRO_ID));
        assert_eq!(widget.variant_name(), "UltraDmxPro");
    }

    #[test]
    fn test_dmx_king_rdm_variant_enables_rdm() {
        let widget = classify_usb_pro(descriptor(), &info(DMX_KING_ESTA_ID, DMX_KING_ULTRA_RDM_ID));
        let Widget::EnttecUsbPro(widget) = widget else {
            panic!("expected a Usb Pro");
        };
        assert!(widget.supports_rdm());

        let widget = classify_usb_pro(descriptor(), &info(DMX_KING_ESTA_ID, DMX_KING_ULTRA_ID));
        let Widget::EnttecUsbPro(widget) = widget else {
            panic!("expected a Usb Pro");
        };
        assert!(!widget.supports_rdm());
    }

    #[test]
    fn test_goddard_dmxter() {
        for device_id in [GODDARD_DMXTER4_ID, GODDARD_DMXTER4A_ID, GODDARD_MINI_DMXTER4_ID] {
            let widget = classify_usb_pro(descriptor(), &info(GODDARD_ESTA_ID, device_id));
            assert_eq!(widget.variant_name(), "Dmxter");
        }
        // unknown Goddard device falls through to the generic Usb Pro
        let widget = classify_usb_pro(descriptor(), &info(GODDARD_ESTA_ID, 0x9999));
        assert_eq!(widget.variant_name(), "EnttecUsbPro");
    }

    #[test]
    fn test_jese_tri_family() {
        let widget = classify_usb_pro(descriptor(), &info(JESE_ESTA_ID, JESE_RDM_TRI_MK2_ID));
        assert_eq!(widget.variant_name(), "DmxTri");
    }

    #[test]
    fn test_open_lighting_arduino() {
        let widget = classify_usb_pro(
            descriptor(),
            &info(OPEN_LIGHTING_ESTA_ID, OPEN_LIGHTING_RGB_MIXER_ID),
        );
        assert_eq!(widget.variant_name(), "Arduino");
    }

    #[test]
    fn test_default_firmware_gated_rdm() {
        let mut information = info(ENTTEC_ESTA_ID, 0x0001);
        information.firmware_version = Some(0x0204);
        let Widget::EnttecUsbPro(widget) = classify_usb_pro(descriptor(), &information) else {
            panic!("expected a Usb Pro");
        };
        assert!(widget.supports_rdm());
        assert!(!widget.no_rdm_dub_timeout());

        information.firmware_version = Some(0x0203);
        let Widget::EnttecUsbPro(widget) = classify_usb_pro(descriptor(), &information) else {
            panic!("expected a Usb Pro");
        };
        assert!(!widget.supports_rdm());

        information.firmware_version = Some(0x0410);
        let Widget::EnttecUsbPro(widget) = classify_usb_pro(descriptor(), &information) else {
            panic!("expected a Usb Pro");
        };
        assert!(widget.no_rdm_dub_timeout());
    }

    #[test]
    fn test_zero_esta_falls_back_to_enttec() {
        let widget = EnttecUsbProWidget::new(descriptor(), 0, 42, false);
        assert_eq!(widget.uid(), Uid::new(ENTTEC_ESTA_ID, 42));
    }

    #[test]
    fn test_send_dmx_frames_wire_format() {
        use std::io::Read;

        let (local, mut remote) = UnixStream::pair().unwrap();
        let mut widget = EnttecUsbProWidget::new(
            SerialDescriptor::from_fd(local.into(), Path::new("/mock")),
            ENTTEC_ESTA_ID,
            1,
            false,
        );
        widget.send_dmx(&DmxBuffer::from_slice(&[10, 20])).unwrap();

        let mut wire = [0u8; 8];
        remote.read_exact(&mut wire).unwrap();
        // SOM, label 6, len 3 (start code + 2 slots), payload, EOM
        assert_eq!(wire, [0x7e, 6, 3, 0, 0, 10, 20, 0xe7]);
    }
}
