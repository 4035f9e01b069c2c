// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The device manager.
//!
//! Tracks registered devices, issues stable numeric aliases, and snapshots
//! / restores per-port patch and priority settings around the device
//! lifecycle. A device that unregisters and later comes back under the same
//! unique id gets its old alias and its old patches.

use super::device::Device;
use super::patcher::PortPatcher;
use crate::prefs::Preferences;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Alias returned for unknown devices.
pub const MISSING_DEVICE_ALIAS: u32 = 0;
const FIRST_DEVICE_ALIAS: u32 = 1;

const PRIORITY_VALUE_SUFFIX: &str = "_priority_value";
const PRIORITY_MODE_SUFFIX: &str = "_priority_mode";

struct DeviceEntry {
    alias: u32,
    /// None while the device is unregistered; the entry stays to pin the
    /// alias.
    device: Option<Rc<RefCell<Device>>>,
}

/// Registry of devices with stable aliasing and settings persistence.
pub struct DeviceManager {
    prefs: Option<Rc<RefCell<dyn Preferences>>>,
    patcher: Rc<PortPatcher>,
    devices: BTreeMap<String, DeviceEntry>,
    alias_map: BTreeMap<u32, Rc<RefCell<Device>>>,
    next_alias: u32,
}

impl DeviceManager {
    pub fn new(prefs: Option<Rc<RefCell<dyn Preferences>>>, patcher: Rc<PortPatcher>) -> Self {
        DeviceManager {
            prefs,
            patcher,
            devices: BTreeMap::new(),
            alias_map: BTreeMap::new(),
            next_alias: FIRST_DEVICE_ALIAS,
        }
    }

    /// Number of currently registered devices.
    pub fn device_count(&self) -> usize {
        self.alias_map.len()
    }

    /// All registered devices as (alias, device) pairs, in alias order.
    pub fn devices(&self) -> Vec<(u32, Rc<RefCell<Device>>)> {
        self.alias_map
            .iter()
            .map(|(alias, device)| (*alias, device.clone()))
            .collect()
    }

    /// Find a registered device by alias.
    pub fn get_device(&self, alias: u32) -> Option<Rc<RefCell<Device>>> {
        self.alias_map.get(&alias).cloned()
    }

    /// Find a registered device and its alias by unique id. The alias is
    /// [`MISSING_DEVICE_ALIAS`] when the device is unknown or unregistered.
    pub fn get_device_by_unique_id(&self, unique_id: &str) -> (u32, Option<Rc<RefCell<Device>>>) {
        match self.devices.get(unique_id) {
            Some(entry) if entry.device.is_some() => (entry.alias, entry.device.clone()),
            _ => (MISSING_DEVICE_ALIAS, None),
        }
    }

    /// Register a device, restoring its persisted patches and priorities.
    ///
    /// Fails for devices without a unique id and for ids that are already
    /// registered. Re-registration after an unregister reuses the alias.
    pub fn register_device(&mut self, device: Rc<RefCell<Device>>) -> bool {
        let unique_id = device.borrow().unique_id();
        if unique_id.is_empty() {
            log::warn!(
                "[REGISTRY] device {} is missing a unique id",
                device.borrow().name()
            );
            return false;
        }

        let alias = match self.devices.get_mut(&unique_id) {
            Some(entry) => {
                if entry.device.is_some() {
                    log::info!("[REGISTRY] device {} is already registered", unique_id);
                    return false;
                }
                entry.device = Some(device.clone());
                entry.alias
            }
            None => {
                let alias = self.next_alias;
                self.next_alias += 1;
                self.devices.insert(
                    unique_id.clone(),
                    DeviceEntry {
                        alias,
                        device: Some(device.clone()),
                    },
                );
                alias
            }
        };

        self.alias_map.insert(alias, device.clone());
        log::info!(
            "[REGISTRY] installed device {} ({}) as alias {}",
            device.borrow().name(),
            unique_id,
            alias
        );

        self.restore_device_port_settings(&device.borrow());
        true
    }

    /// Unregister a device by unique id, snapshotting its port settings and
    /// detaching its ports from their universes.
    pub fn unregister_device(&mut self, unique_id: &str) -> bool {
        let (alias, device) = {
            let Some(entry) = self.devices.get_mut(unique_id) else {
                log::warn!("[REGISTRY] device {} not found", unique_id);
                return false;
            };
            let Some(device) = entry.device.take() else {
                log::warn!("[REGISTRY] device {} not registered", unique_id);
                return false;
            };
            (entry.alias, device)
        };

        self.alias_map.remove(&alias);
        self.save_device_port_settings(&device.borrow());
        self.detach_device_ports(&device.borrow());
        true
    }

    /// Unregister everything; aliases stay pinned for re-registration.
    pub fn unregister_all_devices(&mut self) {
        let devices: Vec<Rc<RefCell<Device>>> = self
            .devices
            .values_mut()
            .filter_map(|entry| entry.device.take())
            .collect();
        for device in devices {
            self.save_device_port_settings(&device.borrow());
            self.detach_device_ports(&device.borrow());
        }
        self.alias_map.clear();
    }

    fn detach_device_ports(&self, device: &Device) {
        for port in device.input_ports() {
            self.patcher.unpatch_input_port(port);
        }
        for port in device.output_ports() {
            self.patcher.unpatch_output_port(port);
        }
    }

    /// Snapshot patch and priority settings for every port on a device.
    fn save_device_port_settings(&self, device: &Device) {
        let Some(prefs) = &self.prefs else { return };
        let mut prefs = prefs.borrow_mut();

        for port in device.input_ports() {
            let port = port.borrow();
            save_patch(&mut *prefs, port.unique_id(), port.universe());
            save_priority(&mut *prefs, port.unique_id(), port.priority());
        }
        for port in device.output_ports() {
            let port = port.borrow();
            save_patch(&mut *prefs, port.unique_id(), port.universe());
            save_priority(&mut *prefs, port.unique_id(), port.priority());
        }
    }

    /// Restore persisted patch and priority settings for a device's ports.
    /// Invalid stored values are skipped silently.
    fn restore_device_port_settings(&self, device: &Device) {
        let Some(prefs) = &self.prefs else { return };

        for port in device.input_ports() {
            let unique_id = port.borrow().unique_id().to_string();
            if let Some(universe_id) = load_patch(&*prefs.borrow(), &unique_id) {
                self.patcher.patch_input_port(device, port, universe_id);
            }
            let (mode, value) = load_priority(&*prefs.borrow(), &unique_id);
            if mode.is_some() || value.is_some() {
                PortPatcher::set_priority_from_strings(
                    port.borrow_mut().priority_mut(),
                    mode.as_deref(),
                    value.as_deref(),
                );
            }
        }
        for port in device.output_ports() {
            let unique_id = port.borrow().unique_id().to_string();
            if let Some(universe_id) = load_patch(&*prefs.borrow(), &unique_id) {
                self.patcher.patch_output_port(device, port, universe_id);
            }
            let (mode, value) = load_priority(&*prefs.borrow(), &unique_id);
            if mode.is_some() || value.is_some() {
                PortPatcher::set_priority_from_strings(
                    port.borrow_mut().priority_mut(),
                    mode.as_deref(),
                    value.as_deref(),
                );
            }
        }
    }
}

fn save_patch(prefs: &mut dyn Preferences, unique_id: &str, universe: Option<u16>) {
    if unique_id.is_empty() {
        return;
    }
    match universe {
        Some(universe_id) => prefs.set_value(unique_id, &universe_id.to_string()),
        None => {
            prefs.remove_value(unique_id);
        }
    }
}

fn save_priority(
    prefs: &mut dyn Preferences,
    unique_id: &str,
    priority: &super::port::PortPriority,
) {
    use super::port::PriorityCapability;
    if priority.capability() == PriorityCapability::None || unique_id.is_empty() {
        return;
    }
    prefs.set_value(
        &format!("{}{}", unique_id, PRIORITY_VALUE_SUFFIX),
        &priority.value().to_string(),
    );
    if priority.capability() == PriorityCapability::Full {
        prefs.set_value(
            &format!("{}{}", unique_id, PRIORITY_MODE_SUFFIX),
            &(priority.mode() as u8).to_string(),
        );
    }
}

fn load_patch(prefs: &dyn Preferences, unique_id: &str) -> Option<u16> {
    if unique_id.is_empty() {
        return None;
    }
    prefs.get_value(unique_id)?.parse::<u16>().ok()
}

fn load_priority(prefs: &dyn Preferences, unique_id: &str) -> (Option<String>, Option<String>) {
    (
        prefs.get_value(&format!("{}{}", unique_id, PRIORITY_MODE_SUFFIX)),
        prefs.get_value(&format!("{}{}", unique_id, PRIORITY_VALUE_SUFFIX)),
    )
}
