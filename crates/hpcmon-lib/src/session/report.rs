//! Final session report

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::classifier::{round_to, ClassifierInput, JobComparison};
use crate::models::{
    Classification, DropCounts, Job, JobSource, ProbeType, ProcessMetrics, SessionStatus,
};
use crate::probes::{ProbeStatus, RecordLayout};
use crate::resolver::JobError;

/// A finalized monitoring session, immutable once produced
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSession {
    pub monitoring_session: SessionInfo,
    pub system_info: SystemInfo,
    pub jobs: Vec<JobReport>,
    pub summary: SessionSummary,
}

impl MonitoringSession {
    pub fn status(&self) -> SessionStatus {
        self.monitoring_session.status
    }

    pub fn job(&self, job_id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: SessionStatus,
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub backend: String,
    pub kernel_version: String,
    pub record_layout: RecordLayout,
    pub scheduler_available: bool,
    pub fallback_used: bool,
    pub probes: BTreeMap<ProbeType, ProbeStatus>,
}

/// Counters summed over a job's member processes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobMetrics {
    pub process_count: usize,
    pub cpu_time_ns: u64,
    pub wait_time_ns: u64,
    pub context_switches: u64,
    pub syscalls_total: u64,
    pub io_syscalls: u64,
    pub net_syscalls: u64,
    pub io_syscall_time_ns: u64,
    pub io_bytes_read: u64,
    pub io_bytes_write: u64,
    pub io_ops: u64,
    pub net_bytes_send: u64,
    pub net_bytes_recv: u64,
    pub net_ops: u64,
    pub syscall_duration_min_ns: u64,
    pub syscall_duration_max_ns: u64,
    pub syscall_duration_avg_ns: f64,
    pub syscall_duration_count: u64,
}

impl JobMetrics {
    pub fn new(m: &ProcessMetrics, process_count: usize) -> Self {
        Self {
            process_count,
            cpu_time_ns: m.cpu_time_ns,
            wait_time_ns: m.wait_time_ns,
            context_switches: m.context_switches,
            syscalls_total: m.syscalls_total,
            io_syscalls: m.io_syscalls,
            net_syscalls: m.net_syscalls,
            io_syscall_time_ns: m.io_syscall_time_ns,
            io_bytes_read: m.io_bytes_read,
            io_bytes_write: m.io_bytes_write,
            io_ops: m.io_ops,
            net_bytes_send: m.net_bytes_send,
            net_bytes_recv: m.net_bytes_recv,
            net_ops: m.net_ops,
            syscall_duration_min_ns: m.syscall_duration.min_ns,
            syscall_duration_max_ns: m.syscall_duration.max_ns,
            syscall_duration_avg_ns: round_to(m.syscall_duration.avg_ns(), 1),
            syscall_duration_count: m.syscall_duration.count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyscallCount {
    pub name: String,
    pub count: u64,
    pub percent: f64,
}

/// Syscalls by count, most frequent first; ties in name order
pub fn syscall_breakdown(m: &ProcessMetrics) -> Vec<SyscallCount> {
    let mut counts: Vec<SyscallCount> = m
        .syscalls_by_name
        .iter()
        .map(|(name, count)| SyscallCount {
            name: name.clone(),
            count: *count,
            percent: if m.syscalls_total == 0 {
                0.0
            } else {
                round_to(100.0 * *count as f64 / m.syscalls_total as f64, 2)
            },
        })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    counts
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceAnalysis {
    pub cpu_percent: f64,
    pub io_percent: f64,
    pub wait_percent: f64,
    pub net_operations: u64,
    pub context_switches_per_sec: f64,
    pub syscalls_per_sec: f64,
    pub io_throughput_bytes_per_sec: f64,
    pub net_throughput_bytes_per_sec: f64,
}

impl PerformanceAnalysis {
    pub fn new(input: &ClassifierInput, m: &ProcessMetrics, monitored_ns: u64) -> Self {
        let secs = monitored_ns as f64 / 1e9;
        let rate = |value: u64| {
            if secs > 0.0 {
                round_to(value as f64 / secs, 2)
            } else {
                0.0
            }
        };
        Self {
            cpu_percent: round_to(input.cpu_percent, 2),
            io_percent: round_to(input.io_percent, 2),
            wait_percent: round_to(input.wait_percent, 2),
            net_operations: input.net_operations,
            context_switches_per_sec: rate(m.context_switches),
            syscalls_per_sec: rate(m.syscalls_total),
            io_throughput_bytes_per_sec: rate(m.io_bytes_total()),
            net_throughput_bytes_per_sec: rate(m.net_bytes_total()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub user: String,
    pub job_name: String,
    pub partition: String,
    pub nodes: Vec<String>,
    pub state: String,
    pub source: JobSource,
    pub duration_seconds: f64,
    pub pids: BTreeSet<u32>,
    pub exited_pids: BTreeSet<u32>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub released_pids: BTreeSet<u32>,
    pub finalized: bool,
    pub metrics: JobMetrics,
    pub classification: Classification,
    pub syscall_breakdown: Vec<SyscallCount>,
    pub performance_analysis: PerformanceAnalysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounting: Option<BTreeMap<String, String>>,
}

impl JobReport {
    pub fn new(
        job: &Job,
        input: &ClassifierInput,
        classification: Classification,
        monitored_ns: u64,
    ) -> Self {
        let m = &job.aggregated_metrics;
        Self {
            job_id: job.info.job_id.clone(),
            user: job.info.user.clone(),
            job_name: job.info.job_name.clone(),
            partition: job.info.partition.clone(),
            nodes: job.info.nodes.clone(),
            state: job.info.state.clone(),
            source: job.source,
            duration_seconds: round_to(monitored_ns as f64 / 1e9, 3),
            pids: job.pid_set.clone(),
            exited_pids: job.exited_pids.clone(),
            released_pids: job.released_pids.clone(),
            finalized: job.finalized,
            metrics: JobMetrics::new(m, job.process_count()),
            classification,
            syscall_breakdown: syscall_breakdown(m),
            performance_analysis: PerformanceAnalysis::new(input, m, monitored_ns),
            accounting: job.accounting.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub total_jobs: usize,
    /// `None` when no job was monitored
    pub comparison: Option<JobComparison>,
    pub drop_counts_by_probe_type: BTreeMap<ProbeType, DropCounts>,
    pub events_processed: u64,
    pub tracked_processes: usize,
    pub errors: Vec<JobError>,
}
