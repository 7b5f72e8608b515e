//! In-memory tracer backend
//!
//! Stands in for the kernel: each attached probe gets a bounded ring of
//! encoded records, and `emit` plays the role of the probe program. Used for
//! trace replay and throughout the test suite.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::record::{encode, KernelVersion};
use super::tracer::{AttachError, KernelTracer, PollBatch, ProbeHandle, ProbeSpec};
use crate::models::{Event, ProbeType};

#[derive(Debug)]
struct SimProbe {
    spec: ProbeSpec,
    ring: VecDeque<Vec<u8>>,
    lost: u64,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    probes: HashMap<u64, SimProbe>,
}

/// Outcome of writing one record into the simulated kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Buffered,
    /// The ring was full; the record was counted as lost
    Dropped,
    /// No probe of that category is attached, or the kernel-side allow-list rejected it
    NotTraced,
}

pub struct SimulatedTracer {
    kernel: KernelVersion,
    failures: HashMap<ProbeType, AttachError>,
    state: Mutex<SimState>,
}

impl SimulatedTracer {
    pub fn new(kernel: KernelVersion) -> Self {
        Self {
            kernel,
            failures: HashMap::new(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Make attaching `probe` fail with `error`
    pub fn with_attach_failure(mut self, probe: ProbeType, error: AttachError) -> Self {
        self.failures.insert(probe, error);
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `event` into the buffer of its category, as the probe would
    pub fn emit(&self, event: &Event, comm: &str) -> EmitOutcome {
        let category = event.probe_type();
        let mut state = self.state();
        let Some(probe) = state
            .probes
            .values_mut()
            .find(|p| p.spec.probe_type == category)
        else {
            return EmitOutcome::NotTraced;
        };

        if let (Some(id), Some(allowed)) = (event.syscall_id(), &probe.spec.syscall_allow_list) {
            if !allowed.contains(&id) {
                return EmitOutcome::NotTraced;
            }
        }

        let record = encode(probe.spec.layout, event, comm);
        push_bounded(probe, record)
    }

    /// Write pre-encoded bytes, bypassing the encoder
    pub fn emit_raw(&self, category: ProbeType, record: Vec<u8>) -> EmitOutcome {
        let mut state = self.state();
        match state
            .probes
            .values_mut()
            .find(|p| p.spec.probe_type == category)
        {
            Some(probe) => push_bounded(probe, record),
            None => EmitOutcome::NotTraced,
        }
    }

    /// Records currently waiting in the buffer of `category`
    pub fn pending(&self, category: ProbeType) -> usize {
        self.state()
            .probes
            .values()
            .filter(|p| p.spec.probe_type == category)
            .map(|p| p.ring.len())
            .sum()
    }
}

fn push_bounded(probe: &mut SimProbe, record: Vec<u8>) -> EmitOutcome {
    if probe.ring.len() >= probe.spec.buffer_capacity {
        probe.lost += 1;
        return EmitOutcome::Dropped;
    }
    probe.ring.push_back(record);
    EmitOutcome::Buffered
}

impl KernelTracer for SimulatedTracer {
    fn name(&self) -> &str {
        "simulated"
    }

    fn kernel_version(&self) -> KernelVersion {
        self.kernel
    }

    fn attach(&self, spec: &ProbeSpec) -> Result<ProbeHandle, AttachError> {
        if let Some(error) = self.failures.get(&spec.probe_type) {
            return Err(error.clone());
        }

        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.probes.insert(
            id,
            SimProbe {
                spec: spec.clone(),
                ring: VecDeque::with_capacity(spec.buffer_capacity),
                lost: 0,
            },
        );
        Ok(ProbeHandle::new(id, spec.probe_type))
    }

    fn poll(&self, handle: &ProbeHandle, max_records: usize) -> PollBatch {
        let mut state = self.state();
        let Some(probe) = state.probes.get_mut(&handle.id()) else {
            return PollBatch::default();
        };

        let take = max_records.min(probe.ring.len());
        PollBatch {
            records: probe.ring.drain(..take).collect(),
            lost: std::mem::take(&mut probe.lost),
        }
    }

    fn detach(&self, handle: ProbeHandle) {
        self.state().probes.remove(&handle.id());
    }

    fn attached_count(&self) -> usize {
        self.state().probes.len()
    }
}
