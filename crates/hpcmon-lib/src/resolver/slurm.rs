//! Slurm scheduler client
//!
//! Job identity comes from squeue. Owning PIDs are looked up in order:
//! sstat, then the job's cgroup (v1 and v2 layouts), then the environment
//! of every process on the node.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use super::command::{CommandError, CommandRunner};
use super::procfs::ProcessTable;
use crate::models::JobInfo;

const SQUEUE_FORMAT: &str = "--format=%i|%j|%u|%P|%T|%N";

/// Controllers that carry a slurm hierarchy on cgroup v1 hosts
const V1_CONTROLLERS: [&str; 6] = [
    "systemd",
    "memory",
    "cpuset",
    "cpu,cpuacct",
    "cpuacct",
    "freezer",
];

/// Which jobs to ask squeue for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobQuery {
    Job(String),
    User(String),
    Running,
}

pub struct SlurmClient {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    cgroup_root: PathBuf,
    processes: ProcessTable,
    accounting_fields: Vec<String>,
}

impl SlurmClient {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            processes: ProcessTable::new(),
            accounting_fields: Vec::new(),
        }
    }

    /// Use a custom cgroup root (for testing)
    pub fn cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    pub fn process_table(mut self, processes: ProcessTable) -> Self {
        self.processes = processes;
        self
    }

    pub fn accounting_fields(mut self, fields: Vec<String>) -> Self {
        self.accounting_fields = fields;
        self
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<String, CommandError> {
        self.runner.run(program, &args, self.timeout).await
    }

    /// True when squeue can be executed
    pub async fn probe(&self) -> Result<(), CommandError> {
        self.run("squeue", vec!["--version".to_string()]).await.map(|_| ())
    }

    pub async fn jobs(&self, query: &JobQuery) -> Result<Vec<JobInfo>, CommandError> {
        let mut args = vec!["--noheader".to_string(), SQUEUE_FORMAT.to_string()];
        match query {
            JobQuery::Job(id) => {
                args.push("--job".to_string());
                args.push(id.clone());
            }
            JobQuery::User(user) => {
                args.push("--user".to_string());
                args.push(user.clone());
                args.push("--states=RUNNING".to_string());
            }
            JobQuery::Running => args.push("--states=RUNNING".to_string()),
        }
        let stdout = self.run("squeue", args).await?;
        Ok(parse_squeue(&stdout))
    }

    /// PIDs owned by a job; empty when no source knows the job
    pub async fn job_pids(&self, job_id: &str) -> BTreeSet<u32> {
        let args = vec![
            "--job".to_string(),
            job_id.to_string(),
            "--parsable2".to_string(),
            "--noheader".to_string(),
            "--format=JobID,AvePID".to_string(),
        ];
        match self.run("sstat", args).await {
            Ok(stdout) => {
                let pids = parse_sstat(&stdout);
                if !pids.is_empty() {
                    return pids;
                }
            }
            Err(e) => debug!(job_id, error = %e, "sstat lookup failed"),
        }

        let pids = self.cgroup_pids(job_id).await;
        if !pids.is_empty() {
            return pids;
        }

        let processes = self.processes.clone();
        let wanted = job_id.to_string();
        let scan = tokio::task::spawn_blocking(move || {
            processes.pids_with_env(&["SLURM_JOB_ID", "SLURM_JOBID"], &wanted)
        });
        match scan.await {
            Ok(Ok(pids)) => pids,
            Ok(Err(e)) => {
                debug!(job_id, error = %e, "environment scan failed");
                BTreeSet::new()
            }
            Err(e) => {
                debug!(job_id, error = %e, "environment scan task failed");
                BTreeSet::new()
            }
        }
    }

    /// Every PID listed under the job's cgroup directories, including step sub-cgroups
    pub async fn cgroup_pids(&self, job_id: &str) -> BTreeSet<u32> {
        let job_dir = format!("job_{job_id}");
        let mut candidates = Vec::new();

        // v2: system.slice/slurmstepd.scope/job_<id>
        candidates.push(
            self.cgroup_root
                .join("system.slice/slurmstepd.scope")
                .join(&job_dir),
        );
        // v1: <controller>/slurm/uid_<uid>/job_<id>
        for controller in V1_CONTROLLERS {
            let slurm = self.cgroup_root.join(controller).join("slurm");
            candidates.extend(uid_dirs(&slurm).await.into_iter().map(|d| d.join(&job_dir)));
        }
        candidates.extend(
            uid_dirs(&self.cgroup_root.join("slurm"))
                .await
                .into_iter()
                .map(|d| d.join(&job_dir)),
        );

        let mut pids = BTreeSet::new();
        for dir in candidates {
            collect_procs(&dir, &mut pids).await;
        }
        pids
    }

    /// Accounting fields for a job, keyed by field name
    pub async fn accounting(&self, job_id: &str) -> Result<BTreeMap<String, String>, CommandError> {
        if self.accounting_fields.is_empty() {
            return Ok(BTreeMap::new());
        }
        let args = vec![
            "--job".to_string(),
            job_id.to_string(),
            "--parsable2".to_string(),
            "--noheader".to_string(),
            format!("--format={}", self.accounting_fields.join(",")),
        ];
        let stdout = self.run("sacct", args).await?;
        Ok(parse_sacct(&stdout, &self.accounting_fields))
    }
}

async fn uid_dirs(slurm_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let Ok(mut entries) = fs::read_dir(slurm_dir).await else {
        return dirs;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with("uid_") {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    dirs
}

async fn collect_procs(root: &Path, pids: &mut BTreeSet<u32>) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Ok(content) = fs::read_to_string(dir.join("cgroup.procs")).await {
            pids.extend(content.lines().filter_map(|l| l.trim().parse::<u32>().ok()));
        }
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(entry.path());
            }
        }
    }
}

/// Parse `%i|%j|%u|%P|%T|%N` lines
pub fn parse_squeue(stdout: &str) -> Vec<JobInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split('|').collect();
            if parts.len() < 6 || parts[0].is_empty() {
                return None;
            }
            Some(JobInfo {
                job_id: parts[0].to_string(),
                job_name: parts[1].to_string(),
                user: parts[2].to_string(),
                partition: parts[3].to_string(),
                state: parts[4].to_string(),
                nodes: expand_nodelist(parts[5]),
            })
        })
        .collect()
}

/// Parse `JobID|AvePID` lines, skipping steps that report no PID
pub fn parse_sstat(stdout: &str) -> BTreeSet<u32> {
    stdout
        .lines()
        .filter_map(|line| line.split('|').nth(1))
        .filter_map(|pid| pid.trim().parse().ok())
        .filter(|pid| *pid > 0)
        .collect()
}

/// Zip the first sacct line (the job allocation itself) with the requested field names
pub fn parse_sacct(stdout: &str, fields: &[String]) -> BTreeMap<String, String> {
    let Some(line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
        return BTreeMap::new();
    };
    fields
        .iter()
        .cloned()
        .zip(line.split('|').map(|v| v.trim().to_string()))
        .collect()
}

/// Expand a Slurm hostlist such as `node[01-03,07],gpu1`
pub fn expand_nodelist(list: &str) -> Vec<String> {
    let mut nodes = Vec::new();
    for item in split_top_level(list.trim()) {
        if item.is_empty() || item == "(null)" {
            continue;
        }
        let (Some(open), Some(close)) = (item.find('['), item.rfind(']')) else {
            nodes.push(item.to_string());
            continue;
        };
        let prefix = &item[..open];
        let suffix = &item[close + 1..];
        for range in item[open + 1..close].split(',') {
            match range.split_once('-') {
                Some((lo, hi)) => {
                    let width = lo.len();
                    match (lo.parse::<u64>(), hi.parse::<u64>()) {
                        (Ok(lo), Ok(hi)) if lo <= hi => {
                            for n in lo..=hi {
                                nodes.push(format!("{prefix}{n:0width$}{suffix}"));
                            }
                        }
                        _ => nodes.push(format!("{prefix}{range}{suffix}")),
                    }
                }
                None => nodes.push(format!("{prefix}{range}{suffix}")),
            }
        }
    }
    nodes
}

/// Split on commas that are not inside brackets
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}
