// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The universe store.
//!
//! Universes are created on first reference and survive until a garbage
//! collection sweep finds them idle. Settings (name, merge mode, RDM
//! discovery interval) persist across that lifecycle through the
//! preferences store under `uni_<id>_*` keys.

use super::{MergeMode, Universe};
use crate::clock::Clock;
use crate::prefs::Preferences;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;

/// Owns every active universe, keyed by 16-bit id.
pub struct UniverseStore {
    universes: BTreeMap<u16, Rc<RefCell<Universe>>>,
    gc_candidates: BTreeSet<u16>,
    prefs: Option<Rc<RefCell<dyn Preferences>>>,
    clock: Clock,
}

impl UniverseStore {
    pub fn new(prefs: Option<Rc<RefCell<dyn Preferences>>>, clock: Clock) -> Self {
        UniverseStore {
            universes: BTreeMap::new(),
            gc_candidates: BTreeSet::new(),
            prefs,
            clock,
        }
    }

    pub fn universe_count(&self) -> usize {
        self.universes.len()
    }

    /// Look up an existing universe.
    pub fn get_universe(&self, universe_id: u16) -> Option<Rc<RefCell<Universe>>> {
        self.universes.get(&universe_id).cloned()
    }

    /// Look up a universe, creating it with restored settings if absent.
    pub fn get_universe_or_create(&mut self, universe_id: u16) -> Rc<RefCell<Universe>> {
        if let Some(universe) = self.universes.get(&universe_id) {
            return universe.clone();
        }
        let universe = Rc::new(RefCell::new(Universe::new(universe_id, self.clock.clone())));
        self.restore_universe_settings(&mut universe.borrow_mut());
        log::info!("[STORE] created universe {}", universe_id);
        self.universes.insert(universe_id, universe.clone());
        universe
    }

    /// All universes, in id order.
    pub fn get_list(&self) -> Vec<Rc<RefCell<Universe>>> {
        self.universes.values().cloned().collect()
    }

    /// Record a universe as a candidate for the next GC sweep.
    pub fn add_universe_garbage_collection(&mut self, universe_id: u16) {
        self.gc_candidates.insert(universe_id);
    }

    /// Destroy every candidate that is still idle, persisting its settings.
    pub fn garbage_collect_universes(&mut self) {
        let candidates = std::mem::take(&mut self.gc_candidates);
        for universe_id in candidates {
            let idle = match self.universes.get(&universe_id) {
                Some(universe) => !universe.borrow().is_active(),
                None => false,
            };
            if idle {
                if let Some(universe) = self.universes.remove(&universe_id) {
                    self.save_universe_settings(&universe.borrow());
                    log::info!("[STORE] garbage collected universe {}", universe_id);
                }
            }
        }
    }

    /// Persist and destroy everything.
    pub fn delete_all(&mut self) {
        let universes = std::mem::take(&mut self.universes);
        for universe in universes.values() {
            self.save_universe_settings(&universe.borrow());
        }
        self.gc_candidates.clear();
    }

    /// Periodic housekeeping: expire stale client sources everywhere.
    pub fn clean_stale_sources(&mut self) {
        for universe in self.universes.values() {
            universe.borrow_mut().clean_stale_sources();
        }
    }

    fn restore_universe_settings(&self, universe: &mut Universe) {
        let Some(prefs) = &self.prefs else { return };
        let prefs = prefs.borrow();
        let universe_id = universe.id();

        if let Some(name) = prefs.get_value(&format!("uni_{}_name", universe_id)) {
            if !name.is_empty() {
                universe.set_name(&name);
            }
        }

        if let Some(mode) = prefs.get_value(&format!("uni_{}_merge", universe_id)) {
            let mode = if mode == "HTP" {
                MergeMode::Htp
            } else {
                MergeMode::Ltp
            };
            universe.set_merge_mode(mode);
        }

        let interval_key = format!("uni_{}_rdm_discovery_interval", universe_id);
        if let Some(interval) = prefs.get_value(&interval_key) {
            match interval.parse::<u64>() {
                Ok(seconds) => {
                    universe.set_rdm_discovery_interval(Duration::from_secs(seconds));
                }
                Err(_) => {
                    log::warn!(
                        "[STORE] invalid RDM discovery interval for universe {}: {:?}",
                        universe_id,
                        interval
                    );
                }
            }
        }
    }

    fn save_universe_settings(&self, universe: &Universe) {
        let Some(prefs) = &self.prefs else { return };
        let mut prefs = prefs.borrow_mut();
        let universe_id = universe.id();

        prefs.set_value(&format!("uni_{}_name", universe_id), universe.name());
        let mode = match universe.merge_mode() {
            MergeMode::Htp => "HTP",
            MergeMode::Ltp => "LTP",
        };
        prefs.set_value(&format!("uni_{}_merge", universe_id), mode);
        // The discovery interval is only ever set from the config file, so
        // it is not written back here.
    }
}

impl Drop for UniverseStore {
    fn drop(&mut self) {
        self.delete_all();
    }
}
