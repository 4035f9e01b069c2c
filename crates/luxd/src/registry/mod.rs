// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Port and device registry
//!
//! Plugins expose hardware as devices, each carrying input and output
//! ports. This module is the authority on which port is patched to which
//! universe and at what priority:
//!
//! - [`DeviceManager`] issues stable aliases and snapshots/restores port
//!   settings across device lifecycles.
//! - [`PortPatcher`] is the only path that binds ports to universes,
//!   enforcing the device's looping and multi-patch policy.
//!
//! Everything here lives on the main loop; devices and ports are shared
//! with universes via `Rc<RefCell<_>>`, and the back-references that would
//! form cycles are plain universe ids.

pub mod device;
pub mod manager;
pub mod patcher;
pub mod port;

pub use device::{device_unique_id, port_unique_id, Device};
pub use manager::{DeviceManager, MISSING_DEVICE_ALIAS};
pub use patcher::PortPatcher;
pub use port::{
    DmxWriter, InputPort, OutputPort, PortDirection, PortPriority, PriorityCapability,
    PriorityMode, PORT_PRIORITY_DEFAULT, PORT_PRIORITY_MAX, PORT_PRIORITY_MIN,
};
