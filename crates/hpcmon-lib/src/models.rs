//! Core data models for the HPC monitor

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Kernel event category, one probe attachment per variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    Syscall,
    Sched,
    Io,
    Net,
}

impl ProbeType {
    pub const ALL: [ProbeType; 4] = [
        ProbeType::Syscall,
        ProbeType::Sched,
        ProbeType::Io,
        ProbeType::Net,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeType::Syscall => "syscall",
            ProbeType::Sched => "sched",
            ProbeType::Io => "io",
            ProbeType::Net => "net",
        }
    }

    /// Dense index used for per-category counter arrays
    pub fn index(self) -> usize {
        match self {
            ProbeType::Syscall => 0,
            ProbeType::Sched => 1,
            ProbeType::Io => 2,
            ProbeType::Net => 3,
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoDirection {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetDirection {
    Send,
    Recv,
}

/// Payload of a decoded kernel record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A completed syscall
    Syscall { syscall_id: u32, duration_ns: u64 },
    /// The task left the CPU after `run_ns` on-CPU, having waited `wait_ns` before it ran.
    /// `switches` is at least 1; sampling backends may fold several switches into one record.
    Sched {
        run_ns: u64,
        wait_ns: u64,
        switches: u32,
    },
    /// File I/O; `ops` is at least 1
    Io {
        direction: IoDirection,
        bytes: u64,
        ops: u32,
    },
    /// Socket traffic
    Net { direction: NetDirection, bytes: u64 },
}

/// A typed kernel event
///
/// `pid` is the kernel task id (thread), `tgid` the thread-group id, which is
/// the process id user space sees. Metrics are bucketed by `tgid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tgid: u32,
    pub kind: EventKind,
}

impl Event {
    pub fn probe_type(&self) -> ProbeType {
        match self.kind {
            EventKind::Syscall { .. } => ProbeType::Syscall,
            EventKind::Sched { .. } => ProbeType::Sched,
            EventKind::Io { .. } => ProbeType::Io,
            EventKind::Net { .. } => ProbeType::Net,
        }
    }

    pub fn syscall_id(&self) -> Option<u32> {
        match self.kind {
            EventKind::Syscall { syscall_id, .. } => Some(syscall_id),
            _ => None,
        }
    }
}

/// Running syscall duration statistics
///
/// The average is derived from an exact integer sum, so it does not depend
/// on the order events arrive in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub count: u64,
    #[serde(skip)]
    sum_ns: u128,
}

impl DurationStats {
    pub fn record(&mut self, duration_ns: u64) {
        if self.count == 0 {
            self.min_ns = duration_ns;
            self.max_ns = duration_ns;
        } else {
            self.min_ns = self.min_ns.min(duration_ns);
            self.max_ns = self.max_ns.max(duration_ns);
        }
        self.count += 1;
        self.sum_ns += u128::from(duration_ns);
    }

    pub fn merge(&mut self, other: &DurationStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.min_ns = self.min_ns.min(other.min_ns);
        self.max_ns = self.max_ns.max(other.max_ns);
        self.count += other.count;
        self.sum_ns += other.sum_ns;
    }

    pub fn avg_ns(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ns as f64 / self.count as f64
        }
    }
}

/// Per-process counters maintained by the aggregator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    /// Command name, when the record layout carries one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comm: String,
    pub cpu_time_ns: u64,
    pub wait_time_ns: u64,
    pub context_switches: u64,
    pub syscalls_total: u64,
    pub syscalls_by_name: BTreeMap<String, u64>,
    pub io_syscalls: u64,
    pub net_syscalls: u64,
    /// Time spent inside I/O-class syscalls
    pub io_syscall_time_ns: u64,
    pub io_bytes_read: u64,
    pub io_bytes_write: u64,
    pub io_ops: u64,
    pub net_bytes_send: u64,
    pub net_bytes_recv: u64,
    pub net_ops: u64,
    pub syscall_duration: DurationStats,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
}

impl ProcessMetrics {
    /// Add another bucket's counters into this one
    pub fn absorb(&mut self, other: &ProcessMetrics) {
        if self.comm.is_empty() {
            self.comm.clone_from(&other.comm);
        }
        self.cpu_time_ns += other.cpu_time_ns;
        self.wait_time_ns += other.wait_time_ns;
        self.context_switches += other.context_switches;
        self.syscalls_total += other.syscalls_total;
        for (name, count) in &other.syscalls_by_name {
            *self.syscalls_by_name.entry(name.clone()).or_insert(0) += count;
        }
        self.io_syscalls += other.io_syscalls;
        self.net_syscalls += other.net_syscalls;
        self.io_syscall_time_ns += other.io_syscall_time_ns;
        self.io_bytes_read += other.io_bytes_read;
        self.io_bytes_write += other.io_bytes_write;
        self.io_ops += other.io_ops;
        self.net_bytes_send += other.net_bytes_send;
        self.net_bytes_recv += other.net_bytes_recv;
        self.net_ops += other.net_ops;
        self.syscall_duration.merge(&other.syscall_duration);

        if other.first_seen_ns != 0
            && (self.first_seen_ns == 0 || other.first_seen_ns < self.first_seen_ns)
        {
            self.first_seen_ns = other.first_seen_ns;
        }
        self.last_seen_ns = self.last_seen_ns.max(other.last_seen_ns);
    }

    pub fn io_bytes_total(&self) -> u64 {
        self.io_bytes_read + self.io_bytes_write
    }

    pub fn net_bytes_total(&self) -> u64 {
        self.net_bytes_send + self.net_bytes_recv
    }

    pub fn is_empty(&self) -> bool {
        self.syscalls_total == 0
            && self.context_switches == 0
            && self.io_ops == 0
            && self.net_ops == 0
    }
}

/// Where a job's identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Scheduler,
    Fallback,
}

/// Job identity as reported by the scheduler or synthesized locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub user: String,
    pub job_name: String,
    pub partition: String,
    pub nodes: Vec<String>,
    pub state: String,
}

/// Output of one resolution query: identity plus the PIDs currently believed to own it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedJob {
    pub info: JobInfo,
    pub source: JobSource,
    pub pids: BTreeSet<u32>,
}

/// A job tracked across reporting ticks
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    #[serde(flatten)]
    pub info: JobInfo,
    pub source: JobSource,
    pub pid_set: BTreeSet<u32>,
    /// Members confirmed exited; their counters still belong to the job
    pub exited_pids: BTreeSet<u32>,
    /// Members still alive when the job finalized, handed back for other jobs to claim
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub released_pids: BTreeSet<u32>,
    /// Counters frozen from members that left the job
    #[serde(skip)]
    pub retired_metrics: ProcessMetrics,
    #[serde(skip)]
    pub aggregated_metrics: ProcessMetrics,
    /// Set once the job is no longer reported running; metrics are frozen from then on
    pub finalized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounting: Option<BTreeMap<String, String>>,
}

impl Job {
    pub fn new(info: JobInfo, source: JobSource) -> Self {
        Self {
            info,
            source,
            pid_set: BTreeSet::new(),
            exited_pids: BTreeSet::new(),
            released_pids: BTreeSet::new(),
            retired_metrics: ProcessMetrics::default(),
            aggregated_metrics: ProcessMetrics::default(),
            finalized: false,
            accounting: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.info.job_id
    }

    /// Every process that has counted toward this job
    pub fn process_count(&self) -> usize {
        self.pid_set.len() + self.exited_pids.len() + self.released_pids.len()
    }

    /// Resume a finalized job. Everything counted so far carries over and
    /// new members start from fresh buckets.
    pub fn reopen(&mut self) {
        self.retired_metrics = std::mem::take(&mut self.aggregated_metrics);
        self.released_pids.clear();
        self.finalized = false;
        self.accounting = None;
    }
}

/// Workload class assigned by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobClass {
    #[serde(rename = "Idle-heavy")]
    IdleHeavy,
    #[serde(rename = "IO-bound")]
    IoBound,
    #[serde(rename = "CPU-bound")]
    CpuBound,
    #[serde(rename = "Network-bound")]
    NetworkBound,
    #[serde(rename = "Balanced")]
    Balanced,
}

impl JobClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobClass::IdleHeavy => "Idle-heavy",
            JobClass::IoBound => "IO-bound",
            JobClass::CpuBound => "CPU-bound",
            JobClass::NetworkBound => "Network-bound",
            JobClass::Balanced => "Balanced",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub resource: String,
    pub severity: Severity,
    /// Points above the threshold; count resources use percent above it
    pub margin: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub class: JobClass,
    pub confidence: f64,
    pub efficiency_score: f64,
    pub bottlenecks: Vec<Bottleneck>,
    pub recommendations: Vec<String>,
}

/// Lifecycle state of a monitoring session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Per-category loss accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounts {
    /// Records lost to buffer saturation or rejected for lack of capacity
    pub dropped: u64,
    pub decode_errors: u64,
    pub sampled_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_stats_merge() {
        let mut a = DurationStats::default();
        a.record(10);
        a.record(30);
        let mut b = DurationStats::default();
        b.record(5);

        a.merge(&b);
        assert_eq!(a.min_ns, 5);
        assert_eq!(a.max_ns, 30);
        assert_eq!(a.count, 3);
        assert!((a.avg_ns() - 15.0).abs() < f64::EPSILON);

        let mut empty = DurationStats::default();
        empty.merge(&DurationStats::default());
        assert_eq!(empty.count, 0);
        assert_eq!(empty.avg_ns(), 0.0);
    }

    #[test]
    fn test_process_metrics_absorb() {
        let mut total = ProcessMetrics::default();
        let mut one = ProcessMetrics {
            cpu_time_ns: 100,
            io_bytes_read: 4096,
            first_seen_ns: 50,
            last_seen_ns: 90,
            ..Default::default()
        };
        one.syscalls_by_name.insert("read".to_string(), 2);
        let mut two = one.clone();
        two.first_seen_ns = 20;
        two.last_seen_ns = 200;

        total.absorb(&one);
        total.absorb(&two);

        assert_eq!(total.cpu_time_ns, 200);
        assert_eq!(total.io_bytes_total(), 8192);
        assert_eq!(total.syscalls_by_name["read"], 4);
        assert_eq!(total.first_seen_ns, 20);
        assert_eq!(total.last_seen_ns, 200);
    }

    #[test]
    fn test_job_class_serializes_with_display_names() {
        let json = serde_json::to_string(&JobClass::IoBound).unwrap();
        assert_eq!(json, "\"IO-bound\"");
        assert_eq!(JobClass::IdleHeavy.to_string(), "Idle-heavy");
    }
}
