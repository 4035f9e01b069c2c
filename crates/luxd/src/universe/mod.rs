// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The universe merge engine.
//!
//! A universe is a logical DMX channel. Input ports, network source clients
//! and a local override all publish frames into it; the universe elects the
//! highest priority among live sources, merges the frames at that priority
//! (HTP or LTP) and pushes the result to output ports and sink clients.
//!
//! # Invariants
//!
//! - `active_priority == 0` exactly when there are no live sources.
//! - The merged buffer always equals the merge-mode combination of the live
//!   sources at `active_priority`.
//! - Client sources expire [`SOURCE_EXPIRY`] after they were last heard.

pub mod store;

pub use store::UniverseStore;

use crate::clock::{Clock, TimeStamp};
use crate::dmx::DmxBuffer;
use crate::registry::port::{InputPort, OutputPort, PORT_PRIORITY_DEFAULT};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// How long a client source stays live without being heard from.
pub const SOURCE_EXPIRY: Duration = Duration::from_millis(2500);

/// Smallest allowed non-zero RDM discovery interval.
pub const MINIMUM_RDM_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// How frames from equal-priority sources combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Highest takes precedence: per-slot maximum.
    Htp,
    /// Latest takes precedence: the most recently updated source wins.
    Ltp,
}

/// Receives merged frames on behalf of a network client.
pub trait SinkClient {
    /// Deliver a frame. Returning false drops this sink from the universe.
    fn send_dmx(&mut self, universe_id: u16, priority: u8, buffer: &DmxBuffer) -> bool;
}

impl<F: FnMut(u16, u8, &DmxBuffer) -> bool> SinkClient for F {
    fn send_dmx(&mut self, universe_id: u16, priority: u8, buffer: &DmxBuffer) -> bool {
        self(universe_id, priority, buffer)
    }
}

/// A network client's contribution to a universe.
struct ClientSource {
    client_id: u64,
    buffer: DmxBuffer,
    priority: u8,
    sequence: u8,
    last_heard: TimeStamp,
}

struct LocalSource {
    buffer: DmxBuffer,
    last_updated: TimeStamp,
}

struct SinkEntry {
    client_id: u64,
    sink: Box<dyn SinkClient>,
}

/// Identifies one live source during a merge pass.
enum SourceKey {
    Port(usize),
    Client(usize),
    Local,
}

/// A single DMX universe.
pub struct Universe {
    id: u16,
    name: String,
    merge_mode: MergeMode,
    active_priority: u8,
    merged: DmxBuffer,
    input_ports: Vec<Rc<RefCell<InputPort>>>,
    output_ports: Vec<Rc<RefCell<OutputPort>>>,
    client_sources: Vec<ClientSource>,
    sink_clients: Vec<SinkEntry>,
    local_source: Option<LocalSource>,
    rdm_discovery_interval: Option<Duration>,
    clock: Clock,
}

impl Universe {
    pub fn new(id: u16, clock: Clock) -> Self {
        Universe {
            id,
            name: format!("Universe {}", id),
            merge_mode: MergeMode::Ltp,
            active_priority: 0,
            merged: DmxBuffer::new(),
            input_ports: Vec::new(),
            output_ports: Vec::new(),
            client_sources: Vec::new(),
            sink_clients: Vec::new(),
            local_source: None,
            rdm_discovery_interval: None,
            clock,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn merge_mode(&self) -> MergeMode {
        self.merge_mode
    }

    pub fn set_merge_mode(&mut self, mode: MergeMode) {
        self.merge_mode = mode;
    }

    /// The RDM discovery interval, or None when periodic discovery is off.
    pub fn rdm_discovery_interval(&self) -> Option<Duration> {
        self.rdm_discovery_interval
    }

    /// Zero disables periodic discovery; non-zero values below the minimum
    /// are clamped up to it.
    pub fn set_rdm_discovery_interval(&mut self, interval: Duration) {
        if interval.is_zero() {
            self.rdm_discovery_interval = None;
        } else if interval < MINIMUM_RDM_DISCOVERY_INTERVAL {
            log::warn!(
                "[UNIVERSE] discovery interval for universe {} below the minimum, clamping",
                self.id
            );
            self.rdm_discovery_interval = Some(MINIMUM_RDM_DISCOVERY_INTERVAL);
        } else {
            self.rdm_discovery_interval = Some(interval);
        }
    }

    /// The priority elected among currently-live sources; 0 when there are
    /// none.
    pub fn active_priority(&self) -> u8 {
        self.active_priority
    }

    /// The current merged frame.
    pub fn get_dmx(&self) -> &DmxBuffer {
        &self.merged
    }

    /// A universe with no ports and no clients is idle and eligible for
    /// garbage collection.
    pub fn is_active(&self) -> bool {
        !self.input_ports.is_empty()
            || !self.output_ports.is_empty()
            || !self.client_sources.is_empty()
            || !self.sink_clients.is_empty()
    }

    pub fn port_count(&self) -> usize {
        self.input_ports.len() + self.output_ports.len()
    }

    pub fn source_client_count(&self) -> usize {
        self.client_sources.len()
    }

    pub fn sink_client_count(&self) -> usize {
        self.sink_clients.len()
    }

    // ---- membership ------------------------------------------------------

    /// Bind an input port. Returns false if a port with the same unique id
    /// is already bound.
    pub fn add_input_port(&mut self, port: Rc<RefCell<InputPort>>) -> bool {
        let unique_id = port.borrow().unique_id().to_string();
        if self.find_input_port(&unique_id).is_some() {
            return false;
        }
        log::debug!("[UNIVERSE] added input port {} to universe {}", unique_id, self.id);
        self.input_ports.push(port);
        true
    }

    /// Unbind an input port and re-merge without its contribution.
    pub fn remove_input_port(&mut self, unique_id: &str) -> bool {
        match self.find_input_port(unique_id) {
            Some(index) => {
                self.input_ports.remove(index);
                log::debug!(
                    "[UNIVERSE] removed input port {} from universe {}",
                    unique_id,
                    self.id
                );
                self.merge();
                true
            }
            None => false,
        }
    }

    /// Bind an output port; it receives frames from the next merge on.
    pub fn add_output_port(&mut self, port: Rc<RefCell<OutputPort>>) -> bool {
        let unique_id = port.borrow().unique_id().to_string();
        if self.find_output_port(&unique_id).is_some() {
            return false;
        }
        log::debug!(
            "[UNIVERSE] added output port {} to universe {}",
            unique_id,
            self.id
        );
        self.output_ports.push(port);
        true
    }

    pub fn remove_output_port(&mut self, unique_id: &str) -> bool {
        match self.find_output_port(unique_id) {
            Some(index) => {
                self.output_ports.remove(index);
                true
            }
            None => false,
        }
    }

    /// True if a port with this unique id is bound in either direction.
    pub fn contains_port(&self, unique_id: &str) -> bool {
        self.find_input_port(unique_id).is_some() || self.find_output_port(unique_id).is_some()
    }

    /// Register a source client. Its data arrives later through
    /// [`Universe::source_client_data_changed`].
    pub fn add_source_client(&mut self, client_id: u64) -> bool {
        if self.client_sources.iter().any(|s| s.client_id == client_id) {
            return false;
        }
        self.client_sources.push(ClientSource {
            client_id,
            buffer: DmxBuffer::new(),
            priority: PORT_PRIORITY_DEFAULT,
            sequence: 0,
            last_heard: self.clock.now(),
        });
        true
    }

    pub fn remove_source_client(&mut self, client_id: u64) -> bool {
        let before = self.client_sources.len();
        self.client_sources.retain(|s| s.client_id != client_id);
        if self.client_sources.len() != before {
            self.merge();
            true
        } else {
            false
        }
    }

    pub fn add_sink_client(&mut self, client_id: u64, sink: Box<dyn SinkClient>) -> bool {
        if self.sink_clients.iter().any(|s| s.client_id == client_id) {
            return false;
        }
        self.sink_clients.push(SinkEntry { client_id, sink });
        true
    }

    pub fn remove_sink_client(&mut self, client_id: u64) -> bool {
        let before = self.sink_clients.len();
        self.sink_clients.retain(|s| s.client_id != client_id);
        self.sink_clients.len() != before
    }

    // ---- data ------------------------------------------------------------

    /// Write the local override source. Empty frames are refused.
    pub fn set_dmx(&mut self, buffer: &DmxBuffer) -> bool {
        if buffer.is_empty() {
            log::warn!("[UNIVERSE] empty local write to universe {} refused", self.id);
            return false;
        }
        self.local_source = Some(LocalSource {
            buffer: buffer.clone(),
            last_updated: self.clock.now(),
        });
        self.merge();
        true
    }

    /// An input port has new data; re-merge.
    pub fn port_data_changed(&mut self, unique_id: &str) {
        if self.find_input_port(unique_id).is_none() {
            log::error!(
                "[UNIVERSE] data change for port {} not bound to universe {}",
                unique_id,
                self.id
            );
            return;
        }
        self.merge();
    }

    /// A source client published a frame.
    pub fn source_client_data_changed(
        &mut self,
        client_id: u64,
        buffer: &DmxBuffer,
        priority: u8,
        sequence: u8,
    ) {
        let now = self.clock.now();
        let priority = priority.min(crate::registry::port::PORT_PRIORITY_MAX);
        match self
            .client_sources
            .iter_mut()
            .find(|s| s.client_id == client_id)
        {
            Some(source) => {
                source.buffer = buffer.clone();
                source.priority = priority;
                source.sequence = sequence;
                source.last_heard = now;
            }
            None => {
                self.client_sources.push(ClientSource {
                    client_id,
                    buffer: buffer.clone(),
                    priority,
                    sequence,
                    last_heard: now,
                });
            }
        }
        self.merge();
    }

    /// Drop expired client sources and re-merge if anything changed. Called
    /// periodically by the store's housekeeping.
    pub fn clean_stale_sources(&mut self) {
        let before = self.client_sources.len();
        self.expire_client_sources(self.clock.now());
        if self.client_sources.len() != before {
            self.merge();
        }
    }

    // ---- merge -----------------------------------------------------------

    fn find_input_port(&self, unique_id: &str) -> Option<usize> {
        self.input_ports
            .iter()
            .position(|p| p.borrow().unique_id() == unique_id)
    }

    fn find_output_port(&self, unique_id: &str) -> Option<usize> {
        self.output_ports
            .iter()
            .position(|p| p.borrow().unique_id() == unique_id)
    }

    fn expire_client_sources(&mut self, now: TimeStamp) {
        let universe_id = self.id;
        self.client_sources.retain(|source| {
            let live = now <= source.last_heard + SOURCE_EXPIRY;
            if !live {
                log::info!(
                    "[UNIVERSE] source client {} expired from universe {}",
                    source.client_id,
                    universe_id
                );
            }
            live
        });
    }

    /// Re-run priority election and merging, notifying sinks on change.
    fn merge(&mut self) {
        let now = self.clock.now();
        self.expire_client_sources(now);

        // enumerate live sources in stable order: ports, clients, local
        let mut live: Vec<(u8, TimeStamp, SourceKey)> = Vec::new();
        for (index, port) in self.input_ports.iter().enumerate() {
            let port = port.borrow();
            if let Some(updated) = port.last_updated() {
                live.push((port.effective_priority(), updated, SourceKey::Port(index)));
            }
        }
        for (index, source) in self.client_sources.iter().enumerate() {
            if !source.buffer.is_empty() {
                live.push((source.priority, source.last_heard, SourceKey::Client(index)));
            }
        }
        if let Some(local) = &self.local_source {
            live.push((PORT_PRIORITY_DEFAULT, local.last_updated, SourceKey::Local));
        }

        let old_priority = self.active_priority;
        let old_buffer = self.merged.clone();

        match live.iter().map(|(priority, _, _)| *priority).max() {
            None => {
                self.active_priority = 0;
                self.merged.reset();
            }
            Some(top) => {
                self.active_priority = top;
                let winners: Vec<&(u8, TimeStamp, SourceKey)> =
                    live.iter().filter(|(priority, _, _)| *priority == top).collect();
                self.merged.reset();
                if winners.len() == 1 {
                    self.copy_from(&winners[0].2);
                } else {
                    match self.merge_mode {
                        MergeMode::Htp => {
                            for entry in &winners {
                                self.htp_from(&entry.2);
                            }
                        }
                        MergeMode::Ltp => {
                            // strictly-greater keeps ties stable on the
                            // earliest-registered source
                            let mut best = 0;
                            for (index, entry) in winners.iter().enumerate().skip(1) {
                                if entry.1 > winners[best].1 {
                                    best = index;
                                }
                            }
                            self.copy_from(&winners[best].2);
                        }
                    }
                }
            }
        }

        if self.merged != old_buffer || self.active_priority != old_priority {
            self.update_sinks();
        }
    }

    fn copy_from(&mut self, key: &SourceKey) {
        match key {
            SourceKey::Port(index) => {
                let port = self.input_ports[*index].borrow();
                self.merged = port.buffer().clone();
            }
            SourceKey::Client(index) => {
                self.merged = self.client_sources[*index].buffer.clone();
            }
            SourceKey::Local => {
                if let Some(local) = &self.local_source {
                    self.merged = local.buffer.clone();
                }
            }
        }
    }

    fn htp_from(&mut self, key: &SourceKey) {
        match key {
            SourceKey::Port(index) => {
                let port = self.input_ports[*index].borrow();
                self.merged.htp_merge(port.buffer());
            }
            SourceKey::Client(index) => {
                let buffer = self.client_sources[*index].buffer.clone();
                self.merged.htp_merge(&buffer);
            }
            SourceKey::Local => {
                if let Some(local) = &self.local_source {
                    self.merged.htp_merge(&local.buffer);
                }
            }
        }
    }

    /// Push the merged frame to output ports and sink clients. Failed sink
    /// clients are dropped; failed ports are logged and left patched.
    fn update_sinks(&mut self) {
        for port in &self.output_ports {
            let mut port = port.borrow_mut();
            if !port.write_dmx(&self.merged, self.active_priority) {
                log::warn!(
                    "[UNIVERSE] output port {} refused a write on universe {}",
                    port.unique_id(),
                    self.id
                );
            }
        }

        let universe_id = self.id;
        let priority = self.active_priority;
        let merged = &self.merged;
        self.sink_clients.retain_mut(|entry| {
            let ok = entry.sink.send_dmx(universe_id, priority, merged);
            if !ok {
                log::warn!(
                    "[UNIVERSE] sink client {} failed on universe {}, dropping",
                    entry.client_id,
                    universe_id
                );
            }
            ok
        });
    }
}

impl std::fmt::Debug for Universe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Universe")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("merge_mode", &self.merge_mode)
            .field("active_priority", &self.active_priority)
            .field("ports", &self.port_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::port::{PriorityCapability, PriorityMode};

    fn input_port(id: &str) -> Rc<RefCell<InputPort>> {
        Rc::new(RefCell::new(InputPort::new(
            id,
            0,
            PriorityCapability::Full,
        )))
    }

    fn recording_output(
        id: &str,
    ) -> (Rc<RefCell<OutputPort>>, Rc<RefCell<Vec<(DmxBuffer, u8)>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let port = OutputPort::new(
            id,
            0,
            PriorityCapability::None,
            Box::new(move |buffer: &DmxBuffer, priority: u8| {
                sink.borrow_mut().push((buffer.clone(), priority));
                true
            }),
        );
        (Rc::new(RefCell::new(port)), seen)
    }

    #[test]
    fn test_new_universe_defaults() {
        let universe = Universe::new(1, Clock::system());
        assert_eq!(universe.merge_mode(), MergeMode::Ltp);
        assert_eq!(universe.active_priority(), 0);
        assert!(universe.get_dmx().is_empty());
        assert!(!universe.is_active());
    }

    #[test]
    fn test_set_get_dmx() {
        let mut universe = Universe::new(1, Clock::system());
        let buffer = DmxBuffer::from_slice(&[1, 2, 3]);
        assert!(universe.set_dmx(&buffer));
        assert_eq!(universe.get_dmx(), &buffer);
        assert_eq!(universe.active_priority(), PORT_PRIORITY_DEFAULT);
        // empty writes are refused
        assert!(!universe.set_dmx(&DmxBuffer::new()));
    }

    #[test]
    fn test_port_data_reaches_output() {
        let mut universe = Universe::new(1, Clock::system());
        let input = input_port("in-0");
        let (output, seen) = recording_output("out-0");
        universe.add_input_port(input.clone());
        universe.add_output_port(output);
        assert!(universe.is_active());

        let frame = DmxBuffer::from_slice(&[10, 20]);
        input
            .borrow_mut()
            .write_dmx(&frame, PORT_PRIORITY_DEFAULT, Clock::system().now());
        universe.port_data_changed("in-0");

        assert_eq!(universe.get_dmx(), &frame);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, frame);
        assert_eq!(seen[0].1, PORT_PRIORITY_DEFAULT);
    }

    #[test]
    fn test_htp_merge_two_ports() {
        let (clock, _source) = Clock::mock();
        let mut universe = Universe::new(1, clock.clone());
        universe.set_merge_mode(MergeMode::Htp);
        let a = input_port("a");
        let b = input_port("b");
        universe.add_input_port(a.clone());
        universe.add_input_port(b.clone());

        a.borrow_mut().write_dmx(
            &DmxBuffer::from_slice(&[10, 0, 0]),
            PORT_PRIORITY_DEFAULT,
            clock.now(),
        );
        universe.port_data_changed("a");
        b.borrow_mut().write_dmx(
            &DmxBuffer::from_slice(&[0, 20, 30]),
            PORT_PRIORITY_DEFAULT,
            clock.now(),
        );
        universe.port_data_changed("b");

        assert_eq!(universe.get_dmx().as_slice(), &[10, 20, 30]);
        assert_eq!(universe.active_priority(), PORT_PRIORITY_DEFAULT);
    }

    #[test]
    fn test_ltp_latest_wins() {
        let (clock, source) = Clock::mock();
        let mut universe = Universe::new(2, clock.clone());
        let a = input_port("a");
        let b = input_port("b");
        universe.add_input_port(a.clone());
        universe.add_input_port(b.clone());

        a.borrow_mut().write_dmx(
            &DmxBuffer::from_slice(&[1, 2, 3]),
            PORT_PRIORITY_DEFAULT,
            clock.now(),
        );
        universe.port_data_changed("a");
        source.advance(Duration::from_millis(10));
        b.borrow_mut().write_dmx(
            &DmxBuffer::from_slice(&[4, 5, 6]),
            PORT_PRIORITY_DEFAULT,
            clock.now(),
        );
        universe.port_data_changed("b");
        assert_eq!(universe.get_dmx().as_slice(), &[4, 5, 6]);

        source.advance(Duration::from_millis(10));
        a.borrow_mut().write_dmx(
            &DmxBuffer::from_slice(&[7, 7, 7]),
            PORT_PRIORITY_DEFAULT,
            clock.now(),
        );
        universe.port_data_changed("a");
        assert_eq!(universe.get_dmx().as_slice(), &[7, 7, 7]);
    }

    #[test]
    fn test_priority_election_ignores_lower_sources() {
        let (clock, _source) = Clock::mock();
        let mut universe = Universe::new(3, clock.clone());
        let low = input_port("low");
        let high = input_port("high");
        high.borrow_mut().priority_mut().set_mode(PriorityMode::Override);
        high.borrow_mut().priority_mut().set_value(150);
        universe.add_input_port(low.clone());
        universe.add_input_port(high.clone());

        low.borrow_mut().write_dmx(
            &DmxBuffer::from_slice(&[1, 1, 1]),
            PORT_PRIORITY_DEFAULT,
            clock.now(),
        );
        universe.port_data_changed("low");
        assert_eq!(universe.active_priority(), PORT_PRIORITY_DEFAULT);

        high.borrow_mut().write_dmx(
            &DmxBuffer::from_slice(&[9, 9, 9]),
            PORT_PRIORITY_DEFAULT,
            clock.now(),
        );
        universe.port_data_changed("high");
        assert_eq!(universe.active_priority(), 150);
        assert_eq!(universe.get_dmx().as_slice(), &[9, 9, 9]);
    }

    #[test]
    fn test_client_source_expiry_reverts_priority() {
        let (clock, source) = Clock::mock();
        let mut universe = Universe::new(3, clock.clone());
        let port = input_port("steady");
        universe.add_input_port(port.clone());
        port.borrow_mut().write_dmx(
            &DmxBuffer::from_slice(&[1, 1, 1]),
            PORT_PRIORITY_DEFAULT,
            clock.now(),
        );
        universe.port_data_changed("steady");

        // a higher-priority client takes over
        universe.source_client_data_changed(7, &DmxBuffer::from_slice(&[9, 9, 9]), 150, 0);
        assert_eq!(universe.active_priority(), 150);
        assert_eq!(universe.get_dmx().as_slice(), &[9, 9, 9]);

        // it goes silent past the expiry window
        source.advance(Duration::from_millis(3000));
        universe.clean_stale_sources();
        assert_eq!(universe.active_priority(), PORT_PRIORITY_DEFAULT);
        assert_eq!(universe.get_dmx().as_slice(), &[1, 1, 1]);
    }

    #[test]
    fn test_sink_client_dropped_on_failure() {
        let mut universe = Universe::new(1, Clock::system());
        universe.add_sink_client(1, Box::new(|_: u16, _: u8, _: &DmxBuffer| false));
        universe.add_sink_client(2, Box::new(|_: u16, _: u8, _: &DmxBuffer| true));
        assert_eq!(universe.sink_client_count(), 2);

        universe.set_dmx(&DmxBuffer::from_slice(&[1]));
        assert_eq!(universe.sink_client_count(), 1);
    }

    #[test]
    fn test_duplicate_memberships_rejected() {
        let mut universe = Universe::new(1, Clock::system());
        let port = input_port("p");
        assert!(universe.add_input_port(port.clone()));
        assert!(!universe.add_input_port(port));
        assert!(universe.add_source_client(9));
        assert!(!universe.add_source_client(9));
    }

    #[test]
    fn test_remove_last_source_clears_buffer() {
        let mut universe = Universe::new(1, Clock::system());
        universe.source_client_data_changed(5, &DmxBuffer::from_slice(&[8, 8]), 100, 0);
        assert_eq!(universe.active_priority(), 100);
        universe.remove_source_client(5);
        assert_eq!(universe.active_priority(), 0);
        assert!(universe.get_dmx().is_empty());
    }

    #[test]
    fn test_discovery_interval_clamping() {
        let mut universe = Universe::new(1, Clock::system());
        universe.set_rdm_discovery_interval(Duration::from_secs(10));
        assert_eq!(
            universe.rdm_discovery_interval(),
            Some(MINIMUM_RDM_DISCOVERY_INTERVAL)
        );
        universe.set_rdm_discovery_interval(Duration::ZERO);
        assert_eq!(universe.rdm_discovery_interval(), None);
        universe.set_rdm_discovery_interval(Duration::from_secs(60));
        assert_eq!(universe.rdm_discovery_interval(), Some(Duration::from_secs(60)));
    }
}
