// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The DMP-over-E1.31 inflator.
//!
//! For every subscribed universe the inflator tracks the set of live
//! network sources (by CID), arbitrates their priorities, filters stale
//! sequence numbers, and maintains an HTP pre-merge of the sources at the
//! winning priority. Whenever that pre-merge changes, the registered
//! handler fires with the buffer and the active priority.
//!
//! Priority semantics: a source above the current active priority evicts
//! everything tracked below it; a source below is ignored (unless it is
//! the only one left). At most [`MAX_MERGE_SOURCES`] equal-priority
//! sources merge; later arrivals are logged and ignored rather than
//! evicting someone mid-stream.

use super::dmp::{self, AddressSize, AddressType, DmpHeader};
use super::header::{self, E131Header};
use super::rdm::E133RdmInflator;
use super::Cid;
use crate::clock::{Clock, TimeStamp};
use crate::counters::{Counter, CounterMap};
use crate::dmx::DmxBuffer;
use crate::rdm::RDM_START_CODE;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

/// Sources expire this long after their last frame.
pub const EXPIRY_INTERVAL: Duration = Duration::from_millis(2500);

/// Cap on concurrently merged sources per universe.
pub const MAX_MERGE_SOURCES: usize = 6;

/// Highest valid E1.31 priority.
pub const MAX_E131_PRIORITY: u8 = 200;

/// Sequence deltas in (this, 0] are stale duplicates.
const SEQUENCE_DIFF_THRESHOLD: i8 = -20;

/// Called with the merged buffer and the active priority whenever a
/// subscribed universe's E1.31 contribution changes.
pub type UniverseHandler = Box<dyn FnMut(&DmxBuffer, u8)>;

struct TrackedSource {
    cid: Cid,
    sequence: u8,
    last_heard: TimeStamp,
    buffer: DmxBuffer,
}

struct UniverseState {
    sources: Vec<TrackedSource>,
    active_priority: u8,
    merged: DmxBuffer,
    handler: UniverseHandler,
}

enum TrackOutcome {
    /// Nothing to do for this frame.
    Ignore,
    /// Re-merge; `target` is the source buffer to copy slot data into, or
    /// None when a source was removed and only the merge must rerun.
    Merge { target: Option<usize> },
}

impl UniverseState {
    fn track_source(
        &mut self,
        cid: &Cid,
        e131: &E131Header,
        universe: u16,
        now: TimeStamp,
    ) -> TrackOutcome {
        // Expire everyone else first; the incoming CID is about to be
        // refreshed anyway.
        self.sources.retain(|source| {
            if source.cid == *cid {
                return true;
            }
            let live = now <= source.last_heard + EXPIRY_INTERVAL;
            if !live {
                log::info!("[E131] source {} has expired", source.cid);
            }
            live
        });
        if self.sources.is_empty() {
            self.active_priority = 0;
        }

        let priority = e131.priority;
        let position = self.sources.iter().position(|s| s.cid == *cid);

        let Some(mut index) = position else {
            // untracked source
            if e131.stream_terminated || priority < self.active_priority {
                return TrackOutcome::Ignore;
            }
            if priority > self.active_priority {
                log::info!(
                    "[E131] raising priority for universe {} from {} to {}",
                    universe,
                    self.active_priority,
                    priority
                );
                self.sources.clear();
                self.active_priority = priority;
            }
            if self.sources.len() == MAX_MERGE_SOURCES {
                log::warn!(
                    "[E131] max merge sources reached for universe {}, {} won't be tracked",
                    universe,
                    cid
                );
                return TrackOutcome::Ignore;
            }
            log::info!("[E131] added new source {} on universe {}", cid, universe);
            self.sources.push(TrackedSource {
                cid: *cid,
                sequence: e131.sequence,
                last_heard: now,
                buffer: DmxBuffer::new(),
            });
            return TrackOutcome::Merge {
                target: Some(self.sources.len() - 1),
            };
        };

        // known source: sequence filtering first
        let diff = e131.sequence.wrapping_sub(self.sources[index].sequence) as i8;
        if diff <= 0 && diff > SEQUENCE_DIFF_THRESHOLD {
            log::info!(
                "[E131] old packet from {}, this {} last {}",
                cid,
                e131.sequence,
                self.sources[index].sequence
            );
            return TrackOutcome::Ignore;
        }
        self.sources[index].sequence = e131.sequence;

        if e131.stream_terminated {
            log::info!(
                "[E131] {} sent a termination for universe {}",
                cid,
                universe
            );
            self.sources.remove(index);
            if self.sources.is_empty() {
                self.active_priority = 0;
            }
            // merge runs so the buffer isn't stale, but there is no data
            return TrackOutcome::Merge { target: None };
        }

        self.sources[index].last_heard = now;
        if priority < self.active_priority {
            if self.sources.len() == 1 {
                self.active_priority = priority;
            } else {
                self.sources.remove(index);
                return TrackOutcome::Merge { target: None };
            }
        } else if priority > self.active_priority {
            self.active_priority = priority;
            if self.sources.len() != 1 {
                // this source evicts everything tracked below it
                let winner = self.sources.remove(index);
                self.sources.clear();
                self.sources.push(winner);
                index = 0;
            }
        }
        TrackOutcome::Merge {
            target: Some(index),
        }
    }

    /// Rebuild the HTP pre-merge and fire the handler.
    fn merge_and_notify(&mut self) {
        match self.sources.len() {
            0 => self.merged.reset(),
            1 => {
                self.merged = self.sources[0].buffer.clone();
                (self.handler)(&self.merged, self.active_priority);
            }
            _ => {
                self.merged.reset();
                for source in &self.sources {
                    self.merged.htp_merge(&source.buffer);
                }
                (self.handler)(&self.merged, self.active_priority);
            }
        }
    }
}

/// Inflates DMP PDUs into per-universe DMX contributions.
///
/// Frames carrying the RDM start code are not DMX: they leave the merge
/// path and go to the [`E133RdmInflator`] installed with
/// [`DmpE131Inflator::set_rdm_inflator`].
pub struct DmpE131Inflator {
    handlers: BTreeMap<u16, UniverseState>,
    ignore_preview: bool,
    clock: Clock,
    last_vector: Option<u8>,
    last_header: Option<DmpHeader>,
    rdm_inflator: Option<Rc<RefCell<E133RdmInflator>>>,
    dropped: Counter,
}

impl DmpE131Inflator {
    pub fn new(ignore_preview: bool, clock: Clock, counters: &CounterMap) -> Self {
        DmpE131Inflator {
            handlers: BTreeMap::new(),
            ignore_preview,
            clock,
            last_vector: None,
            last_header: None,
            rdm_inflator: None,
            dropped: counters.counter("e131.dropped_frames"),
        }
    }

    /// Install the inflator that receives 0xCC-carrier frames. Without one,
    /// RDM frames are skipped like any other alternate start code.
    pub fn set_rdm_inflator(&mut self, rdm_inflator: Rc<RefCell<E133RdmInflator>>) {
        self.rdm_inflator = Some(rdm_inflator);
    }

    /// Subscribe a universe. Replacing an existing handler keeps the
    /// tracked sources.
    pub fn set_handler(&mut self, universe: u16, handler: UniverseHandler) -> bool {
        match self.handlers.get_mut(&universe) {
            Some(state) => state.handler = handler,
            None => {
                self.handlers.insert(
                    universe,
                    UniverseState {
                        sources: Vec::new(),
                        active_priority: 0,
                        merged: DmxBuffer::new(),
                        handler,
                    },
                );
            }
        }
        true
    }

    /// Unsubscribe a universe. Returns false if it wasn't subscribed.
    pub fn remove_handler(&mut self, universe: u16) -> bool {
        self.handlers.remove(&universe).is_some()
    }

    pub fn registered_universes(&self) -> Vec<u16> {
        self.handlers.keys().copied().collect()
    }

    /// The active priority currently elected for a universe.
    pub fn active_priority(&self, universe: u16) -> Option<u8> {
        self.handlers.get(&universe).map(|s| s.active_priority)
    }

    /// Forget the cached vector/header used for PDU inheritance.
    pub fn reset_pdu_state(&mut self) {
        self.last_vector = None;
        self.last_header = None;
    }

    /// Parse a full wire packet and feed it through the inflator.
    pub fn handle_packet(&mut self, data: &[u8]) {
        let Some(frame) = header::parse_packet(data) else {
            self.dropped.increment();
            return;
        };
        self.handle_frame(&frame.cid, &frame.header, frame.dmp.vector, frame.dmp.header, frame.dmp.payload);
    }

    /// Handle one DMP PDU, with vector/header inheritance already split
    /// out by the packet parser.
    pub fn handle_frame(
        &mut self,
        cid: &Cid,
        e131: &E131Header,
        vector: Option<u8>,
        header_byte: Option<u8>,
        payload: &[u8],
    ) {
        let vector = match vector.or(self.last_vector) {
            Some(vector) => vector,
            None => {
                log::info!("[E131] PDU without a vector to inherit, dropping");
                self.dropped.increment();
                return;
            }
        };
        self.last_vector = Some(vector);
        if vector != dmp::DMP_SET_PROPERTY_VECTOR {
            log::debug!("[E131] not a set property message: {}", vector);
            return;
        }

        let dmp_header = match header_byte.map(DmpHeader::from_byte).or(self.last_header) {
            Some(header) => header,
            None => {
                log::info!("[E131] PDU without a header to inherit, dropping");
                self.dropped.increment();
                return;
            }
        };
        self.last_header = Some(dmp_header);

        let Some(state) = self.handlers.get_mut(&e131.universe) else {
            return; // not subscribed
        };

        if e131.preview && self.ignore_preview {
            log::debug!("[E131] ignoring preview data");
            return;
        }

        if !dmp_header.is_valid_for_dmx() {
            log::info!(
                "[E131] malformed DMP header {:#04x}, dropping",
                dmp_header.to_byte()
            );
            self.dropped.increment();
            return;
        }

        if e131.priority > MAX_E131_PRIORITY {
            log::info!(
                "[E131] priority {} above the maximum {}, dropping",
                e131.priority,
                MAX_E131_PRIORITY
            );
            self.dropped.increment();
            return;
        }

        let Some((address, used)) =
            dmp::decode_address(AddressSize::TwoBytes, AddressType::RangeEqual, payload)
        else {
            log::info!("[E131] DMP address parsing failed, dropping");
            self.dropped.increment();
            return;
        };
        if address.increment != 1 {
            log::info!(
                "[E131] DMP packet with increment {}, discarding",
                address.increment
            );
            self.dropped.increment();
            return;
        }

        let remaining = payload.len() - used;
        let start_code: Option<u8> = if e131.rev2 {
            Some(address.start as u8)
        } else if remaining > 0 && address.number > 0 {
            Some(payload[used])
        } else {
            None
        };

        // RDM rides the same carrier; route it out of the merge path.
        if start_code == Some(RDM_START_CODE) {
            match &self.rdm_inflator {
                Some(rdm_inflator) => {
                    let channels = remaining.min(address.number as usize);
                    let frame = if e131.rev2 {
                        &payload[used..used + channels]
                    } else {
                        // the first payload octet is the start code
                        &payload[used + 1..used + channels]
                    };
                    rdm_inflator.borrow_mut().handle_frame(
                        cid,
                        e131.universe,
                        RDM_START_CODE,
                        frame,
                    );
                }
                None => {
                    log::debug!(
                        "[E131] RDM frame on universe {} with no RDM inflator installed",
                        e131.universe
                    );
                }
            }
            return;
        }

        // Any other non-zero start code only matters when it carries a
        // terminate.
        if start_code != Some(0) && !e131.stream_terminated {
            log::info!(
                "[E131] skipping frame with start code {:?} on universe {}",
                start_code,
                e131.universe
            );
            return;
        }

        let now = self.clock.now();
        match state.track_source(cid, e131, e131.universe, now) {
            TrackOutcome::Ignore => {}
            TrackOutcome::Merge { target } => {
                if let (Some(index), Some(0)) = (target, start_code) {
                    let channels = remaining.min(address.number as usize);
                    let slots = if e131.rev2 {
                        &payload[used..used + channels]
                    } else {
                        // the first payload octet is the start code
                        &payload[used + 1..used + channels]
                    };
                    state.sources[index].buffer.set(slots);
                }
                state.merge_and_notify();
            }
        }
    }
}
