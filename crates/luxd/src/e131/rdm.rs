// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RDM-over-ACN inflation.
//!
//! RDM responses can ride the same DMP carrier as DMX, distinguished by
//! the 0xCC start code in the PDU vector position (E1.33 style). This
//! inflator routes those frames to a per-universe handler instead of the
//! DMX merge path. It is fed by
//! [`DmpE131Inflator`](super::DmpE131Inflator), which diverts 0xCC frames
//! here once an instance is installed with
//! [`set_rdm_inflator`](super::DmpE131Inflator::set_rdm_inflator).

use super::Cid;
use crate::rdm::RDM_START_CODE;
use std::collections::BTreeMap;

/// Receives raw RDM frames (start code stripped) for one universe.
pub type RdmFrameHandler = Box<dyn FnMut(&Cid, &[u8])>;

/// Routes 0xCC-carrier frames to per-universe handlers.
#[derive(Default)]
pub struct E133RdmInflator {
    handlers: BTreeMap<u16, RdmFrameHandler>,
}

impl E133RdmInflator {
    pub fn new() -> Self {
        E133RdmInflator::default()
    }

    /// Install the handler for a universe, replacing any existing one.
    pub fn set_handler(&mut self, universe: u16, handler: RdmFrameHandler) {
        self.handlers.insert(universe, handler);
    }

    /// Remove a universe's handler. Returns false if none was installed.
    pub fn remove_handler(&mut self, universe: u16) -> bool {
        self.handlers.remove(&universe).is_some()
    }

    /// Handle one PDU addressed to `universe`.
    ///
    /// Frames whose vector is not the RDM start code are ignored; frames
    /// for universes without a handler are dropped with a log.
    pub fn handle_frame(&mut self, cid: &Cid, universe: u16, vector: u8, payload: &[u8]) {
        if vector != RDM_START_CODE {
            log::debug!("[E133] vector {:#04x} is not an RDM carrier, ignoring", vector);
            return;
        }
        match self.handlers.get_mut(&universe) {
            Some(handler) => handler(cid, payload),
            None => {
                log::info!(
                    "[E133] RDM frame for universe {} with no handler, dropping",
                    universe
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cid() -> Cid {
        Cid::from_bytes(&[7u8; 16]).unwrap()
    }

    #[test]
    fn test_routes_rdm_frames() {
        let mut inflator = E133RdmInflator::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        inflator.set_handler(
            5,
            Box::new(move |_: &Cid, frame: &[u8]| {
                sink.borrow_mut().push(frame.to_vec());
            }),
        );

        inflator.handle_frame(&cid(), 5, 0xcc, &[0x01, 0x02]);
        assert_eq!(*seen.borrow(), vec![vec![0x01, 0x02]]);
    }

    #[test]
    fn test_ignores_non_rdm_vectors() {
        let mut inflator = E133RdmInflator::new();
        let seen = Rc::new(RefCell::new(0u32));
        let sink = seen.clone();
        inflator.set_handler(5, Box::new(move |_, _| *sink.borrow_mut() += 1));

        inflator.handle_frame(&cid(), 5, 0x02, &[0x01]);
        assert_eq!(*seen.borrow(), 0);
    }

    #[test]
    fn test_unhandled_universe_dropped() {
        let mut inflator = E133RdmInflator::new();
        // no handler installed; must not panic
        inflator.handle_frame(&cid(), 9, 0xcc, &[0x01]);
        assert!(!inflator.remove_handler(9));
    }
}
