//! Job membership across reporting ticks
//!
//! Each tick the live member set of a job becomes
//! `(current truth ∪ previous members) − confirmed exited`.
//! A PID is owned by at most one job: existing ownership wins, and new
//! claims are settled in job-id order. Reconciling the same resolution
//! twice leaves the book unchanged.
//!
//! When a member exits, its counters are folded into the job and the PID
//! loses its owner. If the number comes back, the new process starts from a
//! fresh bucket under whichever job names it. A finalized job hands its live
//! PIDs back the same way, and reopens if a later resolution lists it with
//! live processes nobody else owns.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::collector::Aggregator;
use crate::models::{Job, ProcessMetrics, ResolvedJob};

/// Jobs whose lifecycle changed during one reconcile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub finalized: Vec<String>,
    pub reopened: Vec<String>,
}

#[derive(Debug, Default)]
pub struct JobBook {
    jobs: BTreeMap<String, Job>,
    owner: HashMap<u32, String>,
    /// PIDs whose bucket is already folded into some job's frozen counters
    retired: HashSet<u32>,
}

impl JobBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one resolution into the book. `complete` says whether the
    /// resolution covered the whole target, in which case tracked jobs it no
    /// longer lists are finalized.
    pub fn reconcile<F>(
        &mut self,
        resolved: &[ResolvedJob],
        complete: bool,
        alive: F,
        aggregator: &Aggregator,
    ) -> Reconciled
    where
        F: Fn(u32) -> bool,
    {
        let mut outcome = Reconciled::default();
        let mut ordered: Vec<&ResolvedJob> = resolved.iter().collect();
        ordered.sort_by(|a, b| a.info.job_id.cmp(&b.info.job_id));

        for r in &ordered {
            let job_id = r.info.job_id.clone();
            let job = self.jobs.entry(job_id.clone()).or_insert_with(|| {
                info!(job_id = %r.info.job_id, source = ?r.source, "Tracking job");
                Job::new(r.info.clone(), r.source)
            });
            if job.finalized {
                let claimable = r
                    .pids
                    .iter()
                    .any(|pid| alive(*pid) && !self.owner.contains_key(pid));
                if !claimable {
                    continue;
                }
                info!(job_id = %job_id, "Job has live processes again, reopening");
                job.reopen();
                outcome.reopened.push(job_id.clone());
            }
            job.info = r.info.clone();
            job.source = r.source;

            let candidates: BTreeSet<u32> = job.pid_set.union(&r.pids).copied().collect();
            let mut live = BTreeSet::new();
            for pid in candidates {
                if job.exited_pids.contains(&pid) {
                    // Only a fresh listing brings an exited number back
                    if !r.pids.contains(&pid) || !alive(pid) {
                        continue;
                    }
                    debug!(pid, job_id = %job_id, "Exited PID is live again");
                    job.exited_pids.remove(&pid);
                }
                if !alive(pid) {
                    if self.owner.get(&pid) == Some(&job_id) {
                        retire_exited(job, pid, &mut self.owner, &mut self.retired, aggregator);
                    }
                    continue;
                }
                match self.owner.get(&pid) {
                    Some(owner) if *owner != job_id => {
                        debug!(pid, job_id = %job_id, owner = %owner, "PID already owned by another job");
                    }
                    Some(_) => {
                        live.insert(pid);
                    }
                    None => {
                        if self.retired.remove(&pid) {
                            debug!(pid, job_id = %job_id, "Claiming reused PID with a fresh bucket");
                            aggregator.reclaim([pid]);
                        }
                        self.owner.insert(pid, job_id.clone());
                        live.insert(pid);
                    }
                }
            }
            job.pid_set = live;
        }

        if complete {
            let listed: BTreeSet<&str> = ordered.iter().map(|r| r.info.job_id.as_str()).collect();
            let ended: Vec<String> = self
                .jobs
                .values()
                .filter(|j| !j.finalized && !listed.contains(j.job_id()))
                .map(|j| j.job_id().to_string())
                .collect();
            for job_id in ended {
                self.finalize(&job_id, &alive, aggregator);
                outcome.finalized.push(job_id);
            }
        }
        outcome
    }

    /// Freeze a job's metrics and release its live PIDs
    fn finalize<F>(&mut self, job_id: &str, alive: &F, aggregator: &Aggregator)
    where
        F: Fn(u32) -> bool,
    {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let members: Vec<u32> = job.pid_set.iter().copied().collect();
        for pid in members {
            if !alive(pid) {
                retire_exited(job, pid, &mut self.owner, &mut self.retired, aggregator);
            }
        }
        job.aggregated_metrics = current_metrics(job, aggregator);
        job.finalized = true;
        for pid in std::mem::take(&mut job.pid_set) {
            self.owner.remove(&pid);
            self.retired.insert(pid);
            job.released_pids.insert(pid);
        }
        info!(
            job_id,
            exited = job.exited_pids.len(),
            released = job.released_pids.len(),
            "Job finalized"
        );
    }

    /// Recompute the sums of every job still running
    pub fn refresh_metrics(&mut self, aggregator: &Aggregator) {
        for job in self.jobs.values_mut().filter(|j| !j.finalized) {
            job.aggregated_metrics = current_metrics(job, aggregator);
        }
    }

    /// Free buckets of exited members of finalized jobs. Their counts are
    /// frozen in the job, so nothing reads these buckets again.
    pub fn reclaim_exited(&mut self, aggregator: &Aggregator) -> usize {
        let pids: Vec<u32> = self
            .jobs
            .values()
            .filter(|j| j.finalized)
            .flat_map(|j| j.exited_pids.iter().copied())
            .filter(|pid| self.retired.contains(pid) && !self.owner.contains_key(pid))
            .collect();
        for pid in &pids {
            self.retired.remove(pid);
        }
        aggregator.reclaim(pids)
    }

    /// Live members of running jobs, the PIDs the next reconcile checks
    pub fn tracked_pids(&self) -> BTreeSet<u32> {
        self.jobs
            .values()
            .filter(|j| !j.finalized)
            .flat_map(|j| j.pid_set.iter().copied())
            .collect()
    }

    /// Attach scheduler accounting to a finalized job
    pub fn set_accounting(&mut self, job_id: &str, fields: BTreeMap<String, String>) {
        if let Some(job) = self.jobs.get_mut(job_id).filter(|j| j.finalized) {
            job.accounting = Some(fields);
        }
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    /// Jobs in job-id order
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn owner_of(&self, pid: u32) -> Option<&str> {
        self.owner.get(&pid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Move an exited member out of the live set and freeze its counters
fn retire_exited(
    job: &mut Job,
    pid: u32,
    owner: &mut HashMap<u32, String>,
    retired: &mut HashSet<u32>,
    aggregator: &Aggregator,
) {
    job.pid_set.remove(&pid);
    job.exited_pids.insert(pid);
    if let Some(bucket) = aggregator.get(pid) {
        job.retired_metrics.absorb(&bucket);
    }
    owner.remove(&pid);
    retired.insert(pid);
}

fn current_metrics(job: &Job, aggregator: &Aggregator) -> ProcessMetrics {
    let mut metrics = job.retired_metrics.clone();
    metrics.absorb(&aggregator.sum(job.pid_set.iter().copied()));
    metrics
}
