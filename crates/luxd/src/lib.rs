// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # luxd - DMX512/RDM lighting daemon control core
//!
//! A pure Rust implementation of the control plane of a lighting daemon:
//! it merges and prioritizes DMX512 streams from heterogeneous sources,
//! shepherds RDM (Remote Device Management) transactions over
//! one-request-at-a-time transports, inflates E1.31 (sACN) network traffic,
//! and discovers USB serial widgets on a dedicated probe thread.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Plugin / Client Layer                        |
//! |     Devices -> Input/Output Ports          Source/Sink Clients      |
//! +---------------------------------------------------------------------+
//! |                          Control Core                               |
//! |  UniverseStore | DeviceManager/PortPatcher | QueueingRdmController  |
//! +---------------------------------------------------------------------+
//! |                          Receive Paths                              |
//! |        E1.31 (DMP) Inflator        |    WidgetDetectorThread        |
//! +---------------------------------------------------------------------+
//! |                           Reactor Layer                             |
//! |   SelectServer "M" (main loop)     |   SelectServer "D" (discovery) |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`DmxBuffer`] | 512-slot DMX frame with HTP merge |
//! | [`universe::Universe`] | Per-universe source tracking and merge |
//! | [`registry::DeviceManager`] | Stable device aliases, patch persistence |
//! | [`rdm::QueueingRdmController`] | Serialized RDM with ACK_OVERFLOW reassembly |
//! | [`e131::DmpE131Inflator`] | sACN receive path with priority arbitration |
//! | [`widget::WidgetDetectorThread`] | Staged USB widget discovery |
//! | [`runtime::SelectServer`] | Cooperative single-threaded event loop |
//!
//! ## Threading Model
//!
//! Exactly two event loops: the main loop `M` owns the universe store, the
//! port registry, the RDM controllers and the E1.31 receiver; the discovery
//! loop `D` owns descriptors being probed. The only cross-loop surface is
//! [`runtime::RemoteHandle::execute`].

/// Monotonic timestamps and the mockable clock handle.
pub mod clock;
/// Named process-wide counters (frame/drop accounting).
pub mod counters;
/// The 512-slot DMX frame buffer.
pub mod dmx;
/// E1.31 (sACN) receive path: DMP inflation and source tracking.
pub mod e131;
/// Key/value preferences with validators and file persistence.
pub mod prefs;
/// RDM primitives and the queueing controllers.
pub mod rdm;
/// Port and device registry, patching and priority policy.
pub mod registry;
/// Cooperative single-threaded event loops.
pub mod runtime;
/// Universe merge engine and store.
pub mod universe;
/// USB serial widget discovery pipeline.
pub mod widget;

pub use clock::{Clock, TimeStamp};
pub use dmx::DmxBuffer;
pub use rdm::uid::Uid;

/// Errors returned by fallible luxd operations.
///
/// Control-flow outcomes (patch refused, priority ignored, frame dropped)
/// are expressed as `bool` returns or status enums, not as `Error`; this
/// enum covers genuine environment failures.
#[derive(Debug)]
pub enum Error {
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// Failed to bind the E1.31 receive socket.
    BindFailed(String),
    /// Failed to join an E1.31 multicast group.
    MulticastJoinFailed(String),
    /// A serial device could not be opened.
    DeviceOpenFailed(String),
    /// A serial device is locked by another process.
    DeviceLocked(String),
    /// Invalid state for the requested operation.
    InvalidState(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::BindFailed(msg) => write!(f, "Bind failed: {}", msg),
            Error::MulticastJoinFailed(msg) => write!(f, "Multicast join failed: {}", msg),
            Error::DeviceOpenFailed(path) => write!(f, "Failed to open device: {}", path),
            Error::DeviceLocked(path) => write!(f, "Device is locked: {}", path),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Convenient alias for API results using the public `Error` type.
pub type Result<T> = core::result::Result<T, Error>;
