// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Port patching and priority policy.
//!
//! The patcher is the only code allowed to bind ports to universes. It
//! enforces the owning device's looping and multi-patch flags, keeps port
//! and universe membership in sync, and applies priority settings within
//! each port's capability.

use super::device::Device;
use super::port::{
    InputPort, OutputPort, PortPriority, PriorityCapability, PriorityMode, PORT_PRIORITY_MAX,
};
use crate::universe::UniverseStore;
use std::cell::RefCell;
use std::rc::Rc;

/// Mediates patch and priority requests against the universe store.
pub struct PortPatcher {
    store: Rc<RefCell<UniverseStore>>,
}

impl PortPatcher {
    pub fn new(store: Rc<RefCell<UniverseStore>>) -> Self {
        PortPatcher { store }
    }

    pub fn store(&self) -> &Rc<RefCell<UniverseStore>> {
        &self.store
    }

    /// Patch an input port to a universe.
    ///
    /// Re-patching to the current universe is a no-op that succeeds. The
    /// request is refused if the device forbids looping and an output port
    /// shares the target universe, or forbids multi-port patching and
    /// another input port does.
    pub fn patch_input_port(
        &self,
        device: &Device,
        port: &Rc<RefCell<InputPort>>,
        universe_id: u16,
    ) -> bool {
        let (unique_id, current) = {
            let port = port.borrow();
            (port.unique_id().to_string(), port.universe())
        };
        if current == Some(universe_id) {
            return true;
        }

        if !device.allow_looping() && device.output_port_on_universe(universe_id) {
            log::warn!(
                "[PATCH] refusing {} -> {}: would loop through device {}",
                unique_id,
                universe_id,
                device.unique_id()
            );
            return false;
        }
        if !device.allow_multi_port_patching() && device.input_port_on_universe(universe_id) {
            log::warn!(
                "[PATCH] refusing {} -> {}: device {} already has an input there",
                unique_id,
                universe_id,
                device.unique_id()
            );
            return false;
        }

        if let Some(old_universe_id) = current {
            self.detach_input(&unique_id, old_universe_id);
        }

        let universe = self.store.borrow_mut().get_universe_or_create(universe_id);
        if !universe.borrow_mut().add_input_port(port.clone()) {
            if !universe.borrow().is_active() {
                self.store
                    .borrow_mut()
                    .add_universe_garbage_collection(universe_id);
            }
            return false;
        }
        port.borrow_mut().set_universe(Some(universe_id));
        log::info!("[PATCH] patched {} to universe {}", unique_id, universe_id);
        true
    }

    /// Patch an output port to a universe; policy mirrors the input case
    /// with the direction checks swapped.
    pub fn patch_output_port(
        &self,
        device: &Device,
        port: &Rc<RefCell<OutputPort>>,
        universe_id: u16,
    ) -> bool {
        let (unique_id, current) = {
            let port = port.borrow();
            (port.unique_id().to_string(), port.universe())
        };
        if current == Some(universe_id) {
            return true;
        }

        if !device.allow_looping() && device.input_port_on_universe(universe_id) {
            log::warn!(
                "[PATCH] refusing {} -> {}: would loop through device {}",
                unique_id,
                universe_id,
                device.unique_id()
            );
            return false;
        }
        if !device.allow_multi_port_patching() && device.output_port_on_universe(universe_id) {
            log::warn!(
                "[PATCH] refusing {} -> {}: device {} already has an output there",
                unique_id,
                universe_id,
                device.unique_id()
            );
            return false;
        }

        if let Some(old_universe_id) = current {
            self.detach_output(&unique_id, old_universe_id);
        }

        let universe = self.store.borrow_mut().get_universe_or_create(universe_id);
        if !universe.borrow_mut().add_output_port(port.clone()) {
            if !universe.borrow().is_active() {
                self.store
                    .borrow_mut()
                    .add_universe_garbage_collection(universe_id);
            }
            return false;
        }
        port.borrow_mut().set_universe(Some(universe_id));
        log::info!("[PATCH] patched {} to universe {}", unique_id, universe_id);
        true
    }

    /// Detach an input port from its universe, if any.
    pub fn unpatch_input_port(&self, port: &Rc<RefCell<InputPort>>) -> bool {
        let (unique_id, current) = {
            let port = port.borrow();
            (port.unique_id().to_string(), port.universe())
        };
        if let Some(universe_id) = current {
            self.detach_input(&unique_id, universe_id);
            port.borrow_mut().set_universe(None);
            log::debug!("[PATCH] unpatched {} from universe {}", unique_id, universe_id);
        }
        true
    }

    pub fn unpatch_output_port(&self, port: &Rc<RefCell<OutputPort>>) -> bool {
        let (unique_id, current) = {
            let port = port.borrow();
            (port.unique_id().to_string(), port.universe())
        };
        if let Some(universe_id) = current {
            self.detach_output(&unique_id, universe_id);
            port.borrow_mut().set_universe(None);
            log::debug!("[PATCH] unpatched {} from universe {}", unique_id, universe_id);
        }
        true
    }

    fn detach_input(&self, unique_id: &str, universe_id: u16) {
        let universe = self.store.borrow().get_universe(universe_id);
        if let Some(universe) = universe {
            universe.borrow_mut().remove_input_port(unique_id);
            if !universe.borrow().is_active() {
                self.store
                    .borrow_mut()
                    .add_universe_garbage_collection(universe_id);
            }
        }
    }

    fn detach_output(&self, unique_id: &str, universe_id: u16) {
        let universe = self.store.borrow().get_universe(universe_id);
        if let Some(universe) = universe {
            universe.borrow_mut().remove_output_port(unique_id);
            if !universe.borrow().is_active() {
                self.store
                    .borrow_mut()
                    .add_universe_garbage_collection(universe_id);
            }
        }
    }

    /// Apply priority settings within the port's capability.
    ///
    /// Ports with no priority capability ignore the request and report
    /// success. Static ports keep inherit mode and store the value. In
    /// pedantic mode an out-of-range value or mode fails the call instead
    /// of being corrected.
    pub fn set_priority(
        priority: &mut PortPriority,
        mode: u8,
        value: u8,
        pedantic: bool,
    ) -> bool {
        if priority.capability() == PriorityCapability::None {
            return true;
        }

        let mut value = value;
        if value > PORT_PRIORITY_MAX {
            log::warn!(
                "[PATCH] priority {} above the maximum {}",
                value,
                PORT_PRIORITY_MAX
            );
            if pedantic {
                return false;
            }
            value = PORT_PRIORITY_MAX;
        }

        if priority.capability() == PriorityCapability::Full {
            match PriorityMode::from_u8(mode) {
                Some(mode) => priority.set_mode(mode),
                None => {
                    log::warn!("[PATCH] priority mode {} out of range", mode);
                    if pedantic {
                        return false;
                    }
                }
            }
        }

        priority.set_value(value);
        true
    }

    /// String-typed variant used when restoring persisted settings;
    /// unparseable fields fall back to defaults without failing.
    pub fn set_priority_from_strings(
        priority: &mut PortPriority,
        mode: Option<&str>,
        value: Option<&str>,
    ) -> bool {
        let mode = match mode.map(str::parse::<u8>) {
            Some(Ok(mode)) => mode,
            Some(Err(_)) | None => PriorityMode::Inherit as u8,
        };
        let value = match value.map(str::parse::<u8>) {
            Some(Ok(value)) => value,
            Some(Err(_)) | None => super::port::PORT_PRIORITY_DEFAULT,
        };
        Self::set_priority(priority, mode, value, false)
    }
}
