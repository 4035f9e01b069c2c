// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Devices: a plugin's grouping of ports.
//!
//! A device owns a set of input and output ports plus the two policy flags
//! the patcher enforces: whether one universe may appear on both directions
//! of this device (`allow_looping`) and whether several same-direction
//! ports may share a universe (`allow_multi_port_patching`).

use super::port::{InputPort, OutputPort, PortDirection};
use std::cell::RefCell;
use std::rc::Rc;

/// Build the stable unique id for a device.
///
/// Format: `<plugin_id>-<device_id>`; empty when the device id is empty
/// (devices without ids are not registrable).
pub fn device_unique_id(plugin_id: u32, device_id: &str) -> String {
    if device_id.is_empty() {
        String::new()
    } else {
        format!("{}-{}", plugin_id, device_id)
    }
}

/// Build the stable unique id for a port.
///
/// Format: `<device_uid>-<I|O>-<index>`.
pub fn port_unique_id(device_uid: &str, direction: PortDirection, index: u32) -> String {
    format!("{}-{}-{}", device_uid, direction.id_letter(), index)
}

/// A plugin-owned device and its ports.
pub struct Device {
    plugin_id: u32,
    device_id: String,
    name: String,
    allow_looping: bool,
    allow_multi_port_patching: bool,
    input_ports: Vec<Rc<RefCell<InputPort>>>,
    output_ports: Vec<Rc<RefCell<OutputPort>>>,
}

impl Device {
    pub fn new(plugin_id: u32, device_id: &str, name: &str) -> Self {
        Device {
            plugin_id,
            device_id: device_id.to_string(),
            name: name.to_string(),
            allow_looping: false,
            allow_multi_port_patching: false,
            input_ports: Vec::new(),
            output_ports: Vec::new(),
        }
    }

    pub fn plugin_id(&self) -> u32 {
        self.plugin_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> String {
        device_unique_id(self.plugin_id, &self.device_id)
    }

    pub fn allow_looping(&self) -> bool {
        self.allow_looping
    }

    pub fn set_allow_looping(&mut self, allow: bool) {
        self.allow_looping = allow;
    }

    pub fn allow_multi_port_patching(&self) -> bool {
        self.allow_multi_port_patching
    }

    pub fn set_allow_multi_port_patching(&mut self, allow: bool) {
        self.allow_multi_port_patching = allow;
    }

    /// Add an input port built from this device's id and the next index.
    pub fn add_input_port(&mut self, port: InputPort) -> Rc<RefCell<InputPort>> {
        let port = Rc::new(RefCell::new(port));
        self.input_ports.push(port.clone());
        port
    }

    pub fn add_output_port(&mut self, port: OutputPort) -> Rc<RefCell<OutputPort>> {
        let port = Rc::new(RefCell::new(port));
        self.output_ports.push(port.clone());
        port
    }

    pub fn input_ports(&self) -> &[Rc<RefCell<InputPort>>] {
        &self.input_ports
    }

    pub fn output_ports(&self) -> &[Rc<RefCell<OutputPort>>] {
        &self.output_ports
    }

    /// True if any input port is patched to `universe_id`.
    pub fn input_port_on_universe(&self, universe_id: u16) -> bool {
        self.input_ports
            .iter()
            .any(|p| p.borrow().universe() == Some(universe_id))
    }

    /// True if any output port is patched to `universe_id`.
    pub fn output_port_on_universe(&self, universe_id: u16) -> bool {
        self.output_ports
            .iter()
            .any(|p| p.borrow().universe() == Some(universe_id))
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("unique_id", &self.unique_id())
            .field("name", &self.name)
            .field("inputs", &self.input_ports.len())
            .field("outputs", &self.output_ports.len())
            .finish()
    }
}
