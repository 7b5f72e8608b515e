//! Capability-free tracer backend built on procfs
//!
//! Synthesizes scheduler and I/O records from per-process counter deltas:
//! - /proc/<pid>/schedstat for on-CPU time, run-queue wait and timeslices
//! - /proc/<pid>/io for bytes and calls through read/write syscalls
//!
//! Syscall and network probes need real kernel instrumentation and are
//! rejected at attach time, leaving those categories degraded.

use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::record::{encode, KernelVersion};
use super::tracer::{AttachError, KernelTracer, PollBatch, ProbeHandle, ProbeSpec};
use crate::models::{Event, EventKind, IoDirection, ProbeType};

/// Counters from /proc/<pid>/schedstat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedSample {
    pub run_ns: u64,
    pub wait_ns: u64,
    pub timeslices: u64,
}

/// Counters from /proc/<pid>/io
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoSample {
    pub rchar: u64,
    pub wchar: u64,
    pub syscr: u64,
    pub syscw: u64,
}

#[derive(Debug)]
struct ProcProbe {
    spec: ProbeSpec,
    pending: VecDeque<Vec<u8>>,
    lost: u64,
}

#[derive(Debug, Default)]
struct ProcState {
    next_id: u64,
    probes: HashMap<u64, ProcProbe>,
    last_scan: Option<Instant>,
    sched: HashMap<u32, SchedSample>,
    io: HashMap<u32, IoSample>,
}

pub struct ProcfsTracer {
    proc_path: PathBuf,
    kernel: KernelVersion,
    scan_interval: Duration,
    state: Mutex<ProcState>,
}

impl ProcfsTracer {
    /// Tracer over the host /proc
    pub fn new() -> Result<Self> {
        let proc_path = PathBuf::from("/proc");
        let kernel = KernelVersion::detect(&proc_path)?;
        Ok(Self::with_proc_path(proc_path, kernel))
    }

    /// Tracer over a custom proc tree (for testing)
    pub fn with_proc_path(proc_path: impl Into<PathBuf>, kernel: KernelVersion) -> Self {
        Self {
            proc_path: proc_path.into(),
            kernel,
            scan_interval: Duration::from_secs(1),
            state: Mutex::new(ProcState::default()),
        }
    }

    /// Minimum time between two scans of the proc tree
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    fn state(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parse schedstat contents: `<run_ns> <wait_ns> <timeslices>`
    pub fn parse_schedstat(content: &str) -> Option<SchedSample> {
        let mut fields = content.split_whitespace().map(|f| f.parse::<u64>());
        Some(SchedSample {
            run_ns: fields.next()?.ok()?,
            wait_ns: fields.next()?.ok()?,
            timeslices: fields.next()?.ok()?,
        })
    }

    /// Parse io contents (`key: value` lines); missing keys read as zero
    pub fn parse_io(content: &str) -> IoSample {
        let mut sample = IoSample::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().parse().unwrap_or(0);
            match key.trim() {
                "rchar" => sample.rchar = value,
                "wchar" => sample.wchar = value,
                "syscr" => sample.syscr = value,
                "syscw" => sample.syscw = value,
                _ => {}
            }
        }
        sample
    }

    fn list_pids(&self) -> Result<Vec<u32>> {
        let entries = fs::read_dir(&self.proc_path)
            .with_context(|| format!("Failed to read {}", self.proc_path.display()))?;
        let mut pids: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn read_proc_file(&self, pid: u32, name: &str) -> Option<String> {
        fs::read_to_string(proc_file(&self.proc_path, pid, name)).ok()
    }

    /// Sample every process and queue records for the deltas since the last scan.
    /// The first sighting of a process only establishes its baseline.
    fn scan(&self, state: &mut ProcState) -> Result<()> {
        let want_sched = state
            .probes
            .values()
            .any(|p| p.spec.probe_type == ProbeType::Sched);
        let want_io = state
            .probes
            .values()
            .any(|p| p.spec.probe_type == ProbeType::Io);

        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let mut sched_seen = HashMap::new();
        let mut io_seen = HashMap::new();
        let mut records: Vec<(ProbeType, Event, String)> = Vec::new();

        for pid in self.list_pids()? {
            // Processes can vanish between listing and reading
            let comm = self
                .read_proc_file(pid, "comm")
                .map(|c| c.trim().to_string())
                .unwrap_or_default();

            if want_sched {
                if let Some(cur) = self
                    .read_proc_file(pid, "schedstat")
                    .and_then(|c| Self::parse_schedstat(&c))
                {
                    if let Some(prev) = state.sched.get(&pid) {
                        let run = cur.run_ns.saturating_sub(prev.run_ns);
                        let wait = cur.wait_ns.saturating_sub(prev.wait_ns);
                        let slices = cur.timeslices.saturating_sub(prev.timeslices);
                        if slices > 0 || run > 0 || wait > 0 {
                            records.push((
                                ProbeType::Sched,
                                Event {
                                    timestamp_ns: now_ns,
                                    pid,
                                    tgid: pid,
                                    kind: EventKind::Sched {
                                        run_ns: run,
                                        wait_ns: wait,
                                        switches: slices.min(u64::from(u32::MAX)) as u32,
                                    },
                                },
                                comm.clone(),
                            ));
                        }
                    }
                    sched_seen.insert(pid, cur);
                }
            }

            if want_io {
                if let Some(content) = self.read_proc_file(pid, "io") {
                    let cur = Self::parse_io(&content);
                    if let Some(prev) = state.io.get(&pid) {
                        for (direction, bytes, ops) in [
                            (
                                IoDirection::Read,
                                cur.rchar.saturating_sub(prev.rchar),
                                cur.syscr.saturating_sub(prev.syscr),
                            ),
                            (
                                IoDirection::Write,
                                cur.wchar.saturating_sub(prev.wchar),
                                cur.syscw.saturating_sub(prev.syscw),
                            ),
                        ] {
                            if bytes > 0 || ops > 0 {
                                records.push((
                                    ProbeType::Io,
                                    Event {
                                        timestamp_ns: now_ns,
                                        pid,
                                        tgid: pid,
                                        kind: EventKind::Io {
                                            direction,
                                            bytes,
                                            ops: ops.min(u64::from(u32::MAX)) as u32,
                                        },
                                    },
                                    comm.clone(),
                                ));
                            }
                        }
                    }
                    io_seen.insert(pid, cur);
                }
            }
        }

        state.sched = sched_seen;
        state.io = io_seen;

        let queued = records.len();
        for (category, event, comm) in records {
            for probe in state
                .probes
                .values_mut()
                .filter(|p| p.spec.probe_type == category)
            {
                if probe.pending.len() >= probe.spec.buffer_capacity {
                    probe.lost += 1;
                } else {
                    probe
                        .pending
                        .push_back(encode(probe.spec.layout, &event, &comm));
                }
            }
        }
        debug!(records = queued, "procfs scan complete");
        Ok(())
    }
}

fn proc_file(proc_path: &Path, pid: u32, name: &str) -> PathBuf {
    proc_path.join(pid.to_string()).join(name)
}

impl KernelTracer for ProcfsTracer {
    fn name(&self) -> &str {
        "procfs"
    }

    fn kernel_version(&self) -> KernelVersion {
        self.kernel
    }

    fn attach(&self, spec: &ProbeSpec) -> Result<ProbeHandle, AttachError> {
        match spec.probe_type {
            ProbeType::Sched | ProbeType::Io => {}
            ProbeType::Syscall | ProbeType::Net => {
                return Err(AttachError::Unsupported {
                    probe: spec.probe_type,
                    reason: "requires kernel instrumentation".to_string(),
                });
            }
        }
        if !self.proc_path.is_dir() {
            return Err(AttachError::Backend(format!(
                "{} is not readable",
                self.proc_path.display()
            )));
        }

        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.probes.insert(
            id,
            ProcProbe {
                spec: spec.clone(),
                pending: VecDeque::new(),
                lost: 0,
            },
        );
        Ok(ProbeHandle::new(id, spec.probe_type))
    }

    fn poll(&self, handle: &ProbeHandle, max_records: usize) -> PollBatch {
        let mut state = self.state();

        let due = state
            .last_scan
            .map_or(true, |at| at.elapsed() >= self.scan_interval);
        if due {
            state.last_scan = Some(Instant::now());
            if let Err(e) = self.scan(&mut state) {
                debug!(error = %e, "procfs scan failed");
            }
        }

        let Some(probe) = state.probes.get_mut(&handle.id()) else {
            return PollBatch::default();
        };
        let take = max_records.min(probe.pending.len());
        PollBatch {
            records: probe.pending.drain(..take).collect(),
            lost: std::mem::take(&mut probe.lost),
        }
    }

    fn detach(&self, handle: ProbeHandle) {
        let mut state = self.state();
        state.probes.remove(&handle.id());
        if state.probes.is_empty() {
            state.sched.clear();
            state.io.clear();
            state.last_scan = None;
        }
    }

    fn attached_count(&self) -> usize {
        self.state().probes.len()
    }
}
