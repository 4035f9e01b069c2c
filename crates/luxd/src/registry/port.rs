// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ports: the hardware-adjacent DMX endpoints a device exposes.
//!
//! An input port receives DMX from the outside world and feeds a universe;
//! an output port takes a universe's merged frame and pushes it to
//! hardware. Each port carries a stable unique id (it survives device
//! unregister/re-register cycles and keys the persisted patch settings) and
//! a priority configuration bounded by the port's capability.

use crate::clock::TimeStamp;
use crate::dmx::DmxBuffer;

/// Lowest valid port priority.
pub const PORT_PRIORITY_MIN: u8 = 0;
/// Highest valid port priority.
pub const PORT_PRIORITY_MAX: u8 = 200;
/// Priority used when nothing else is configured or inherited.
pub const PORT_PRIORITY_DEFAULT: u8 = 100;

/// Which direction DMX flows through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl PortDirection {
    /// Single-letter form used in port unique ids.
    pub fn id_letter(self) -> char {
        match self {
            PortDirection::Input => 'I',
            PortDirection::Output => 'O',
        }
    }
}

/// What priority configuration a port supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityCapability {
    /// Priority is stuck at the default; settings are ignored.
    None,
    /// The value is settable; the mode is fixed to inherit.
    Static,
    /// Both mode and value are settable.
    Full,
}

/// How a port's effective priority is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PriorityMode {
    /// Follow the priority carried by the data stream.
    Inherit = 0,
    /// Use the configured value.
    Override = 1,
}

impl PriorityMode {
    pub fn from_u8(value: u8) -> Option<PriorityMode> {
        match value {
            0 => Some(PriorityMode::Inherit),
            1 => Some(PriorityMode::Override),
            _ => None,
        }
    }
}

/// Priority state shared by input and output ports.
#[derive(Debug, Clone)]
pub struct PortPriority {
    capability: PriorityCapability,
    mode: PriorityMode,
    value: u8,
}

impl PortPriority {
    pub fn new(capability: PriorityCapability) -> Self {
        PortPriority {
            capability,
            mode: PriorityMode::Inherit,
            value: PORT_PRIORITY_DEFAULT,
        }
    }

    pub fn capability(&self) -> PriorityCapability {
        self.capability
    }

    pub fn mode(&self) -> PriorityMode {
        self.mode
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub(crate) fn set_mode(&mut self, mode: PriorityMode) {
        self.mode = mode;
    }

    pub(crate) fn set_value(&mut self, value: u8) {
        self.value = value;
    }
}

/// A DMX input endpoint.
///
/// The port keeps the latest frame it received plus the priority inherited
/// from the stream; the universe reads both during a merge.
pub struct InputPort {
    unique_id: String,
    port_index: u32,
    priority: PortPriority,
    inherited_priority: u8,
    universe: Option<u16>,
    buffer: DmxBuffer,
    last_updated: Option<TimeStamp>,
}

impl InputPort {
    pub fn new(unique_id: &str, port_index: u32, capability: PriorityCapability) -> Self {
        InputPort {
            unique_id: unique_id.to_string(),
            port_index,
            priority: PortPriority::new(capability),
            inherited_priority: PORT_PRIORITY_DEFAULT,
            universe: None,
            buffer: DmxBuffer::new(),
            last_updated: None,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn port_index(&self) -> u32 {
        self.port_index
    }

    pub fn direction(&self) -> PortDirection {
        PortDirection::Input
    }

    pub fn priority(&self) -> &PortPriority {
        &self.priority
    }

    pub(crate) fn priority_mut(&mut self) -> &mut PortPriority {
        &mut self.priority
    }

    pub fn universe(&self) -> Option<u16> {
        self.universe
    }

    pub(crate) fn set_universe(&mut self, universe: Option<u16>) {
        self.universe = universe;
    }

    /// Store a new frame with the priority carried by the stream.
    pub fn write_dmx(&mut self, data: &DmxBuffer, stream_priority: u8, now: TimeStamp) {
        self.buffer = data.clone();
        self.inherited_priority = stream_priority.min(PORT_PRIORITY_MAX);
        self.last_updated = Some(now);
    }

    pub fn buffer(&self) -> &DmxBuffer {
        &self.buffer
    }

    pub fn last_updated(&self) -> Option<TimeStamp> {
        self.last_updated
    }

    /// The priority this port's data competes at.
    pub fn effective_priority(&self) -> u8 {
        match self.priority.mode() {
            PriorityMode::Override => self.priority.value(),
            PriorityMode::Inherit => self.inherited_priority,
        }
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("unique_id", &self.unique_id)
            .field("universe", &self.universe)
            .field("priority", &self.effective_priority())
            .finish_non_exhaustive()
    }
}

/// Receives merged frames for an output port.
pub trait DmxWriter {
    /// Deliver a frame. Returning false means the sink could not accept the
    /// write; the universe logs and does not retry.
    fn write_dmx(&mut self, buffer: &DmxBuffer, priority: u8) -> bool;
}

impl<F: FnMut(&DmxBuffer, u8) -> bool> DmxWriter for F {
    fn write_dmx(&mut self, buffer: &DmxBuffer, priority: u8) -> bool {
        self(buffer, priority)
    }
}

/// A DMX output endpoint.
pub struct OutputPort {
    unique_id: String,
    port_index: u32,
    priority: PortPriority,
    universe: Option<u16>,
    writer: Box<dyn DmxWriter>,
}

impl OutputPort {
    pub fn new(
        unique_id: &str,
        port_index: u32,
        capability: PriorityCapability,
        writer: Box<dyn DmxWriter>,
    ) -> Self {
        OutputPort {
            unique_id: unique_id.to_string(),
            port_index,
            priority: PortPriority::new(capability),
            universe: None,
            writer,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn port_index(&self) -> u32 {
        self.port_index
    }

    pub fn direction(&self) -> PortDirection {
        PortDirection::Output
    }

    pub fn priority(&self) -> &PortPriority {
        &self.priority
    }

    pub(crate) fn priority_mut(&mut self) -> &mut PortPriority {
        &mut self.priority
    }

    pub fn universe(&self) -> Option<u16> {
        self.universe
    }

    pub(crate) fn set_universe(&mut self, universe: Option<u16>) {
        self.universe = universe;
    }

    /// Push a merged frame to the underlying hardware.
    pub fn write_dmx(&mut self, buffer: &DmxBuffer, priority: u8) -> bool {
        self.writer.write_dmx(buffer, priority)
    }
}

impl std::fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("unique_id", &self.unique_id)
            .field("universe", &self.universe)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[test]
    fn test_input_port_defaults() {
        let port = InputPort::new("1-2-I-0", 0, PriorityCapability::None);
        assert_eq!(port.effective_priority(), PORT_PRIORITY_DEFAULT);
        assert!(port.buffer().is_empty());
        assert!(port.last_updated().is_none());
        assert_eq!(port.universe(), None);
    }

    #[test]
    fn test_write_dmx_tracks_stream_priority() {
        let clock = Clock::system();
        let mut port = InputPort::new("1-2-I-0", 0, PriorityCapability::Full);
        port.write_dmx(&DmxBuffer::from_slice(&[1, 2, 3]), 150, clock.now());
        assert_eq!(port.buffer().as_slice(), &[1, 2, 3]);
        assert_eq!(port.effective_priority(), 150);
        assert!(port.last_updated().is_some());
    }

    #[test]
    fn test_stream_priority_clamped() {
        let clock = Clock::system();
        let mut port = InputPort::new("1-2-I-0", 0, PriorityCapability::Full);
        port.write_dmx(&DmxBuffer::new(), 255, clock.now());
        assert_eq!(port.effective_priority(), PORT_PRIORITY_MAX);
    }

    #[test]
    fn test_override_mode_wins() {
        let clock = Clock::system();
        let mut port = InputPort::new("1-2-I-0", 0, PriorityCapability::Full);
        port.priority_mut().set_mode(PriorityMode::Override);
        port.priority_mut().set_value(42);
        port.write_dmx(&DmxBuffer::new(), 150, clock.now());
        assert_eq!(port.effective_priority(), 42);
    }

    #[test]
    fn test_output_port_writer_invoked() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut port = OutputPort::new(
            "1-2-O-0",
            0,
            PriorityCapability::None,
            Box::new(move |buffer: &DmxBuffer, priority: u8| {
                sink.borrow_mut().push((buffer.clone(), priority));
                true
            }),
        );
        assert!(port.write_dmx(&DmxBuffer::from_slice(&[9]), 100));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].1, 100);
    }
}
