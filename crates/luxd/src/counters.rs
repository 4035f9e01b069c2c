// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named counters for frame and drop accounting.
//!
//! Wire-parse failures never bubble up; they are logged and counted. The
//! counter map is the diagnostic surface those counts land on. Counters are
//! cheap atomic handles so the receive paths can bump them without holding
//! a lock.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle to a single named counter.
#[derive(Debug, Clone)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Registry of named counters.
///
/// Registration takes a lock; increments do not. Counter names are dotted
/// paths, e.g. `e131.malformed_headers` or `universe.1.frames`.
#[derive(Debug, Default)]
pub struct CounterMap {
    counters: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
}

impl CounterMap {
    pub fn new() -> Self {
        CounterMap::default()
    }

    /// Get or create the counter with the given name.
    pub fn counter(&self, name: &str) -> Counter {
        let mut counters = self.counters.lock();
        let value = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        Counter { value }
    }

    /// Snapshot of all counters, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        self.counters
            .lock()
            .iter()
            .map(|(name, value)| (name.clone(), value.load(Ordering::Relaxed)))
            .collect()
    }
}
