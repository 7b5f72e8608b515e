//! Per-process metric aggregation
//!
//! Buckets live in a sharded map keyed by thread-group id. Ingestion locks
//! one shard for one update; snapshots copy shard by shard, so a snapshot
//! never stalls the drain loop for longer than a single bucket clone.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::models::{Event, EventKind, IoDirection, NetDirection, ProcessMetrics};
use crate::probes::syscalls::{self, SyscallClass};
use crate::probes::DropCounters;

/// Rough heap footprint of one bucket including its syscall name map
const APPROX_BUCKET_BYTES: u64 = 4096;

pub struct Aggregator {
    buckets: DashMap<u32, ProcessMetrics>,
    max_buckets: usize,
    drops: Arc<DropCounters>,
}

impl Aggregator {
    pub fn new(max_buckets: usize, drops: Arc<DropCounters>) -> Self {
        Self {
            buckets: DashMap::new(),
            max_buckets: max_buckets.max(1),
            drops,
        }
    }

    /// Size the bucket cap from a memory budget
    pub fn with_memory_limit(memory_limit_mb: u64, drops: Arc<DropCounters>) -> Self {
        let max = (memory_limit_mb.saturating_mul(1024 * 1024) / APPROX_BUCKET_BYTES) as usize;
        Self::new(max, drops)
    }

    pub fn max_buckets(&self) -> usize {
        self.max_buckets
    }

    /// Apply one event to its process bucket.
    ///
    /// Returns false when the event was rejected because the bucket cap is
    /// reached; the rejection is counted as a drop for its category.
    pub fn ingest(&self, event: &Event, comm: Option<&str>) -> bool {
        if let Some(mut bucket) = self.buckets.get_mut(&event.tgid) {
            apply(&mut bucket, event, comm);
            return true;
        }

        if self.buckets.len() >= self.max_buckets {
            self.drops.add_dropped(event.probe_type(), 1);
            return false;
        }

        let mut bucket = self.buckets.entry(event.tgid).or_insert_with(|| {
            debug!(tgid = event.tgid, "Tracking new process");
            ProcessMetrics {
                first_seen_ns: event.timestamp_ns,
                last_seen_ns: event.timestamp_ns,
                ..Default::default()
            }
        });
        apply(&mut bucket, event, comm);
        true
    }

    pub fn get(&self, tgid: u32) -> Option<ProcessMetrics> {
        self.buckets.get(&tgid).map(|r| r.clone())
    }

    /// Deep copy of every bucket
    pub fn snapshot(&self) -> BTreeMap<u32, ProcessMetrics> {
        self.buckets
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect()
    }

    /// Sum of the given processes' buckets; unknown PIDs contribute nothing
    pub fn sum<I>(&self, pids: I) -> ProcessMetrics
    where
        I: IntoIterator<Item = u32>,
    {
        let mut total = ProcessMetrics::default();
        for pid in pids {
            if let Some(bucket) = self.buckets.get(&pid) {
                total.absorb(&bucket);
            }
        }
        total
    }

    /// Tracked processes, ascending
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.buckets.iter().map(|r| *r.key()).collect();
        pids.sort_unstable();
        pids
    }

    /// Free the buckets of processes that have exited and whose job is final
    pub fn reclaim<I>(&self, pids: I) -> usize
    where
        I: IntoIterator<Item = u32>,
    {
        let removed = pids
            .into_iter()
            .filter(|pid| self.buckets.remove(pid).is_some())
            .count();
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Reclaimed process buckets");
        }
        removed
    }

    pub fn reset(&self) {
        self.buckets.clear();
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn apply(m: &mut ProcessMetrics, event: &Event, comm: Option<&str>) {
    if let Some(comm) = comm {
        if event.timestamp_ns >= m.last_seen_ns || m.comm.is_empty() {
            m.comm = comm.to_string();
        }
    }
    m.first_seen_ns = m.first_seen_ns.min(event.timestamp_ns);
    m.last_seen_ns = m.last_seen_ns.max(event.timestamp_ns);

    match event.kind {
        EventKind::Syscall {
            syscall_id,
            duration_ns,
        } => {
            m.syscalls_total += 1;
            *m.syscalls_by_name
                .entry(syscalls::name(syscall_id).into_owned())
                .or_insert(0) += 1;
            m.syscall_duration.record(duration_ns);
            match syscalls::classify(syscall_id) {
                SyscallClass::Io => {
                    m.io_syscalls += 1;
                    m.io_syscall_time_ns += duration_ns;
                }
                SyscallClass::Net => m.net_syscalls += 1,
                SyscallClass::Other => {}
            }
        }
        EventKind::Sched {
            run_ns,
            wait_ns,
            switches,
        } => {
            m.cpu_time_ns += run_ns;
            m.wait_time_ns += wait_ns;
            m.context_switches += u64::from(switches);
        }
        EventKind::Io {
            direction,
            bytes,
            ops,
        } => {
            match direction {
                IoDirection::Read => m.io_bytes_read += bytes,
                IoDirection::Write => m.io_bytes_write += bytes,
            }
            m.io_ops += u64::from(ops);
        }
        EventKind::Net { direction, bytes } => {
            match direction {
                NetDirection::Send => m.net_bytes_send += bytes,
                NetDirection::Recv => m.net_bytes_recv += bytes,
            }
            m.net_ops += 1;
        }
    }
}
