//! Per-category loss counters
//!
//! Counters only ever grow during a session; they are shared between the
//! drain loop and the aggregator and read by reporting without locking.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{DropCounts, ProbeType};

#[derive(Debug, Default)]
struct CategoryCounters {
    dropped: AtomicU64,
    decode_errors: AtomicU64,
    sampled_out: AtomicU64,
}

#[derive(Debug, Default)]
pub struct DropCounters {
    categories: [CategoryCounters; 4],
}

impl DropCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dropped(&self, probe: ProbeType, count: u64) {
        if count > 0 {
            self.categories[probe.index()]
                .dropped
                .fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn add_decode_error(&self, probe: ProbeType) {
        self.categories[probe.index()]
            .decode_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sampled_out(&self, probe: ProbeType) {
        self.categories[probe.index()]
            .sampled_out
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, probe: ProbeType) -> DropCounts {
        let c = &self.categories[probe.index()];
        DropCounts {
            dropped: c.dropped.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            sampled_out: c.sampled_out.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<ProbeType, DropCounts> {
        ProbeType::ALL.iter().map(|p| (*p, self.get(*p))).collect()
    }

    /// Records lost before reaching the aggregator, across all categories
    pub fn total_dropped(&self) -> u64 {
        ProbeType::ALL.iter().map(|p| self.get(*p).dropped).sum()
    }
}
