//! Job resolution
//!
//! Maps the monitoring target to jobs and their PIDs, through Slurm when it
//! answers and through local process inspection when it does not. Queries
//! run on their own cadence in a refresh task; reporting reads the last
//! published result and never waits on a scheduler command.

pub mod cache;
pub mod command;
pub mod fallback;
pub mod membership;
pub mod procfs;
pub mod slurm;

#[cfg(test)]
mod tests;

pub use cache::TtlCache;
pub use command::{CommandError, CommandRunner, ProcessCommandRunner};
pub use fallback::FallbackResolver;
pub use membership::{JobBook, Reconciled};
pub use procfs::{ProcessInfo, ProcessTable, UserDb};
pub use slurm::{JobQuery, SlurmClient};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::models::{JobSource, ResolvedJob};
use crate::observability::StructuredLogger;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("no processes found for {0}")]
    NoProcesses(String),
    #[error("job {0} is not known to the scheduler")]
    JobNotFound(String),
    #[error("process table unavailable: {0}")]
    Procfs(String),
}

/// What a session monitors
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MonitorTarget {
    Job(String),
    User(String),
    All,
}

impl FromStr for MonitorTarget {
    type Err = String;

    /// `all`, `job:<id>` or `user:<name>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(MonitorTarget::All);
        }
        match s.split_once(':') {
            Some(("job", id)) if !id.is_empty() => Ok(MonitorTarget::Job(id.to_string())),
            Some(("user", name)) if !name.is_empty() => Ok(MonitorTarget::User(name.to_string())),
            _ => Err(format!(
                "invalid target '{s}', expected 'all', 'job:<id>' or 'user:<name>'"
            )),
        }
    }
}

impl TryFrom<String> for MonitorTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonitorTarget> for String {
    fn from(target: MonitorTarget) -> Self {
        target.to_string()
    }
}

impl fmt::Display for MonitorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorTarget::Job(id) => write!(f, "job:{id}"),
            MonitorTarget::User(name) => write!(f, "user:{name}"),
            MonitorTarget::All => f.write_str("all"),
        }
    }
}

/// A target that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub target: String,
    pub error: String,
}

/// One published resolution result
#[derive(Debug, Clone)]
pub struct Resolution {
    pub jobs: Vec<ResolvedJob>,
    pub errors: Vec<JobError>,
    /// True when the result is authoritative for the whole target, so jobs
    /// missing from it have ended
    pub complete: bool,
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    pub fn empty() -> Self {
        Self {
            jobs: Vec::new(),
            errors: Vec::new(),
            complete: false,
            resolved_at: Utc::now(),
        }
    }

    pub fn used_fallback(&self) -> bool {
        self.jobs.iter().any(|j| j.source == JobSource::Fallback)
    }
}

pub struct JobResolver {
    slurm: Option<SlurmClient>,
    fallback: Arc<FallbackResolver>,
    enable_fallback: bool,
    cache: TtlCache<MonitorTarget, Resolution>,
    scheduler_up: OnceCell<bool>,
    logger: StructuredLogger,
}

impl JobResolver {
    /// `slurm` is `None` when the scheduler integration is disabled
    pub fn new(
        slurm: Option<SlurmClient>,
        fallback: FallbackResolver,
        enable_fallback: bool,
        cache: TtlCache<MonitorTarget, Resolution>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            slurm,
            fallback: Arc::new(fallback),
            enable_fallback,
            cache,
            scheduler_up: OnceCell::new(),
            logger,
        }
    }

    /// Resolver over the local host: real `/proc`, `/etc/passwd` and Slurm commands
    pub fn from_config(config: &MonitorConfig, logger: StructuredLogger) -> Self {
        let slurm_config = &config.slurm;
        let slurm = slurm_config.enabled.then(|| {
            SlurmClient::new(
                Arc::new(ProcessCommandRunner),
                Duration::from_secs(slurm_config.command_timeout),
            )
            .accounting_fields(slurm_config.accounting.fields.clone())
        });
        let fallback = FallbackResolver::new(ProcessTable::new(), slurm_config.max_fallback_jobs)
            .exclusions(&config.ebpf);

        Self::new(
            slurm,
            fallback,
            slurm_config.enable_fallback,
            TtlCache::new(Duration::from_secs(slurm_config.cache_timeout)),
            logger,
        )
    }

    pub fn process_table(&self) -> &ProcessTable {
        self.fallback.process_table()
    }

    pub async fn scheduler_available(&self) -> bool {
        self.scheduler().await.is_some()
    }

    /// Probe the scheduler once; later calls reuse the answer
    async fn scheduler(&self) -> Option<&SlurmClient> {
        let slurm = self.slurm.as_ref()?;
        let up = *self
            .scheduler_up
            .get_or_init(|| async {
                match slurm.probe().await {
                    Ok(()) => {
                        info!("Slurm scheduler available");
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "Slurm scheduler unavailable");
                        false
                    }
                }
            })
            .await;
        up.then_some(slurm)
    }

    /// Cached resolution; a stale or missing entry is refreshed before returning
    pub async fn resolve(&self, target: &MonitorTarget) -> Resolution {
        if let Some(hit) = self.cache.get(target) {
            debug!(target = %target, "Resolution cache hit");
            return hit;
        }
        let fresh = self.query(target).await;
        self.cache.insert(target.clone(), fresh.clone());
        fresh
    }

    async fn query(&self, target: &MonitorTarget) -> Resolution {
        let mut resolution = Resolution::empty();
        // Set when a scheduler that answers failed this one query. The fallback
        // cannot name scheduler jobs, so its result says nothing about them.
        let mut query_failed = false;

        let scheduler_error = match self.scheduler().await {
            Some(slurm) => match self.query_scheduler(slurm, target).await {
                Ok(jobs) => {
                    resolution.complete = true;
                    if jobs.is_empty() {
                        if let MonitorTarget::Job(id) = target {
                            resolution.errors.push(JobError {
                                target: target.to_string(),
                                error: ResolveError::JobNotFound(id.clone()).to_string(),
                            });
                        }
                    }
                    resolution.jobs = jobs;
                    resolution.resolved_at = Utc::now();
                    return resolution;
                }
                Err(e) => {
                    query_failed = true;
                    ResolveError::from(e)
                }
            },
            None if self.slurm.is_some() => {
                ResolveError::SchedulerUnavailable("squeue probe failed".to_string())
            }
            None => ResolveError::SchedulerUnavailable("scheduler integration disabled".to_string()),
        };

        if !self.enable_fallback {
            warn!(target = %target, error = %scheduler_error, "Omitting target, fallback disabled");
            resolution.errors.push(JobError {
                target: target.to_string(),
                error: scheduler_error.to_string(),
            });
            return resolution;
        }

        self.logger
            .log_fallback_activated(&target.to_string(), &scheduler_error.to_string());
        match self.query_fallback(target).await {
            Ok(jobs) => {
                resolution.jobs = jobs;
                resolution.complete = !query_failed;
            }
            Err(e) => {
                // A target whose processes are all gone has ended; anything else is unknown
                resolution.complete = !query_failed && matches!(e, ResolveError::NoProcesses(_));
                resolution.errors.push(JobError {
                    target: target.to_string(),
                    error: e.to_string(),
                });
            }
        }
        resolution.resolved_at = Utc::now();
        resolution
    }

    async fn query_scheduler(
        &self,
        slurm: &SlurmClient,
        target: &MonitorTarget,
    ) -> Result<Vec<ResolvedJob>, CommandError> {
        let query = match target {
            MonitorTarget::Job(id) => JobQuery::Job(id.clone()),
            MonitorTarget::User(user) => JobQuery::User(user.clone()),
            MonitorTarget::All => JobQuery::Running,
        };

        let mut jobs = Vec::new();
        for info in slurm.jobs(&query).await? {
            let pids = slurm.job_pids(&info.job_id).await;
            jobs.push(ResolvedJob {
                info,
                source: JobSource::Scheduler,
                pids,
            });
        }
        Ok(jobs)
    }

    /// The `/proc` scan runs on the blocking pool
    async fn query_fallback(&self, target: &MonitorTarget) -> Result<Vec<ResolvedJob>, ResolveError> {
        let fallback = self.fallback.clone();
        let target = target.clone();
        tokio::task::spawn_blocking(move || fallback.resolve(&target))
            .await
            .map_err(|e| ResolveError::Procfs(format!("process scan failed: {e}")))?
    }

    /// Accounting fields for a finished job; empty without a scheduler
    pub async fn accounting(&self, job_id: &str) -> Option<BTreeMap<String, String>> {
        let slurm = self.scheduler().await?;
        match slurm.accounting(job_id).await {
            Ok(fields) if !fields.is_empty() => Some(fields),
            Ok(_) => None,
            Err(e) => {
                debug!(job_id, error = %e, "sacct lookup failed");
                None
            }
        }
    }

    /// Publish `initial` at once, then re-resolve `target` every cache TTL.
    /// Cancellation abandons a resolution in flight; the last published
    /// value stays current.
    pub fn spawn_refresh(
        self: Arc<Self>,
        target: MonitorTarget,
        initial: Resolution,
        cancel: CancellationToken,
    ) -> (watch::Receiver<Arc<Resolution>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        let period = self.cache.ttl();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Stopping resolver refresh");
                        break;
                    }
                    _ = ticker.tick() => {
                        let resolution = tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(target = %target, "Abandoning in-flight resolution");
                                break;
                            }
                            resolution = self.resolve(&target) => resolution,
                        };
                        debug!(
                            target = %target,
                            jobs = resolution.jobs.len(),
                            errors = resolution.errors.len(),
                            "Resolution refreshed"
                        );
                        if tx.send(Arc::new(resolution)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        (rx, handle)
    }
}
