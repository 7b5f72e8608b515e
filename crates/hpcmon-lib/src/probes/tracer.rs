//! Kernel instrumentation seam
//!
//! A `KernelTracer` owns the kernel-side buffers. Calls are synchronous and
//! must return promptly: `poll` hands back what is already buffered and never
//! waits for new records.

use std::collections::BTreeSet;
use thiserror::Error;

use super::record::{KernelVersion, RecordLayout};
use crate::models::ProbeType;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("missing capability: {0}")]
    PermissionDenied(String),
    #[error("{probe} probes are not supported by this backend: {reason}")]
    Unsupported { probe: ProbeType, reason: String },
    #[error("tracer backend error: {0}")]
    Backend(String),
}

/// What to attach for one category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub probe_type: ProbeType,
    /// Records the kernel-side buffer holds before dropping
    pub buffer_capacity: usize,
    pub layout: RecordLayout,
    /// Syscall numbers to trace; `None` traces all. Only meaningful for syscall probes.
    pub syscall_allow_list: Option<BTreeSet<u32>>,
}

/// An attached probe
///
/// Deliberately not `Clone`: the handle is surrendered to `detach`, so a
/// probe cannot be detached twice or polled afterwards.
#[derive(Debug, PartialEq, Eq)]
pub struct ProbeHandle {
    id: u64,
    probe_type: ProbeType,
}

impl ProbeHandle {
    /// Backends mint handles; ids only need to be unique per tracer
    pub fn new(id: u64, probe_type: ProbeType) -> Self {
        Self { id, probe_type }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn probe_type(&self) -> ProbeType {
        self.probe_type
    }
}

/// Records drained from one buffer in one poll
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollBatch {
    pub records: Vec<Vec<u8>>,
    /// Records the kernel side discarded since the previous poll
    pub lost: u64,
}

pub trait KernelTracer: Send + Sync {
    /// Backend name for logs and `system_info`
    fn name(&self) -> &str;

    fn kernel_version(&self) -> KernelVersion;

    fn attach(&self, spec: &ProbeSpec) -> Result<ProbeHandle, AttachError>;

    /// Take at most `max_records` buffered records
    fn poll(&self, handle: &ProbeHandle, max_records: usize) -> PollBatch;

    fn detach(&self, handle: ProbeHandle);

    /// Number of probes currently attached through this tracer
    fn attached_count(&self) -> usize;
}
