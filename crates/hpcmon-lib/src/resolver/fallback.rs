//! Scheduler-free job resolution
//!
//! Inclusion policy: a process belongs to a user's synthetic job when its
//! real uid is the user's uid. Parentage is not required, so
//! re-parented and daemonized children stay in the job. Kernel threads,
//! zombies and the configured PID/command-name exclusions never do.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::procfs::{with_descendants, ProcessInfo, ProcessTable, UserDb};
use super::{MonitorTarget, ResolveError};
use crate::config::EbpfConfig;
use crate::models::{JobInfo, JobSource, ResolvedJob};

/// First uid handed to regular accounts
const FIRST_REGULAR_UID: u32 = 1000;

const SYSTEM_ACCOUNTS: [&str; 3] = ["root", "daemon", "nobody"];

#[derive(Debug, Clone)]
pub struct FallbackResolver {
    processes: ProcessTable,
    passwd_path: PathBuf,
    max_jobs: usize,
    excluded_pids: BTreeSet<u32>,
    excluded_prefixes: Vec<String>,
}

impl FallbackResolver {
    pub fn new(processes: ProcessTable, max_jobs: usize) -> Self {
        Self {
            processes,
            passwd_path: PathBuf::from("/etc/passwd"),
            max_jobs,
            excluded_pids: BTreeSet::new(),
            excluded_prefixes: Vec::new(),
        }
    }

    /// Read accounts from a custom passwd file (for testing)
    pub fn passwd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.passwd_path = path.into();
        self
    }

    pub fn exclusions(mut self, config: &EbpfConfig) -> Self {
        self.excluded_pids = config.excluded_pids.iter().copied().collect();
        self.excluded_prefixes = config.excluded_processes.clone();
        self
    }

    pub fn process_table(&self) -> &ProcessTable {
        &self.processes
    }

    fn users(&self) -> Result<UserDb, ResolveError> {
        UserDb::load(&self.passwd_path).map_err(|e| ResolveError::Procfs(format!("{e:#}")))
    }

    fn candidates(&self) -> Result<Vec<ProcessInfo>, ResolveError> {
        let all = self
            .processes
            .list()
            .map_err(|e| ResolveError::Procfs(format!("{e:#}")))?;
        Ok(all.into_iter().filter(|p| self.eligible(p)).collect())
    }

    fn eligible(&self, p: &ProcessInfo) -> bool {
        !p.kernel_thread
            && p.state != 'Z'
            && !self.excluded_pids.contains(&p.pid)
            && !self
                .excluded_prefixes
                .iter()
                .any(|prefix| p.comm.starts_with(prefix.as_str()))
    }

    fn synthetic(&self, job_id: String, user: &str, pids: BTreeSet<u32>) -> ResolvedJob {
        ResolvedJob {
            info: JobInfo {
                job_id,
                user: user.to_string(),
                job_name: format!("{user}-processes"),
                partition: "fallback".to_string(),
                nodes: vec![self.processes.hostname()],
                state: "RUNNING".to_string(),
            },
            source: JobSource::Fallback,
            pids,
        }
    }

    /// Jobs for `target` from the process table alone
    pub fn resolve(&self, target: &MonitorTarget) -> Result<Vec<ResolvedJob>, ResolveError> {
        match target {
            MonitorTarget::Job(id) => self.for_job(id).map(|j| vec![j]),
            MonitorTarget::User(user) => self.for_user(user).map(|j| vec![j]),
            MonitorTarget::All => self.all(),
        }
    }

    /// Every eligible process of `user` as one job
    pub fn for_user(&self, user: &str) -> Result<ResolvedJob, ResolveError> {
        let users = self.users()?;
        let uid = users
            .uid_of(user)
            .ok_or_else(|| ResolveError::UnknownUser(user.to_string()))?;

        let pids: BTreeSet<u32> = self
            .candidates()?
            .into_iter()
            .filter(|p| p.uid == uid)
            .map(|p| p.pid)
            .collect();
        if pids.is_empty() {
            return Err(ResolveError::NoProcesses(format!("user:{user}")));
        }
        Ok(self.synthetic(format!("fallback-{user}"), user, pids))
    }

    /// Processes whose environment names the job, and their descendants
    pub fn for_job(&self, job_id: &str) -> Result<ResolvedJob, ResolveError> {
        let candidates = self.candidates()?;
        let roots: BTreeSet<u32> = candidates
            .iter()
            .filter(|p| {
                self.processes.environ(p.pid).map_or(false, |env| {
                    ["SLURM_JOB_ID", "SLURM_JOBID"]
                        .iter()
                        .any(|k| env.get(*k).map(String::as_str) == Some(job_id))
                })
            })
            .map(|p| p.pid)
            .collect();
        let pids = with_descendants(&candidates, roots);

        let Some(owner) = pids
            .iter()
            .find_map(|pid| candidates.iter().find(|p| p.pid == *pid))
            .map(|p| p.uid)
        else {
            return Err(ResolveError::NoProcesses(format!("job:{job_id}")));
        };
        let user = self.users().map(|u| u.name_of(owner)).unwrap_or_else(|_| owner.to_string());
        Ok(self.synthetic(job_id.to_string(), &user, pids))
    }

    /// One synthetic job per regular user with live processes, capped
    pub fn all(&self) -> Result<Vec<ResolvedJob>, ResolveError> {
        let users = self.users()?;
        let mut by_uid: BTreeMap<u32, BTreeSet<u32>> = BTreeMap::new();
        for p in self.candidates()? {
            if p.uid >= FIRST_REGULAR_UID {
                by_uid.entry(p.uid).or_default().insert(p.pid);
            }
        }

        Ok(by_uid
            .into_iter()
            .map(|(uid, pids)| (users.name_of(uid), pids))
            .filter(|(name, _)| !SYSTEM_ACCOUNTS.contains(&name.as_str()))
            .take(self.max_jobs)
            .map(|(name, pids)| self.synthetic(format!("fallback-{name}"), &name, pids))
            .collect())
    }
}
