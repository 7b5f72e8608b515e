//! Session lifecycle
//!
//! Starting a session attaches the probes, spawns the drain loop and the
//! resolver refresh task, then reports on a fixed tick until the configured
//! duration passes or the session is cancelled. Teardown always runs in the
//! same order: stop the drain loop, detach every probe, flush a final
//! snapshot, mark the session finished.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::live::{LiveJob, LiveSnapshot};
use super::report::{JobReport, MonitoringSession, SessionInfo, SessionSummary, SystemInfo};
use crate::classifier::{compare_jobs, round_to, Classifier, ClassifierInput};
use crate::collector::{Aggregator, DrainConfig, DrainLoop, DrainStats};
use crate::config::{ConfigError, MonitorConfig};
use crate::health::{components, HealthRegistry};
use crate::models::{Job, JobSource, SessionStatus};
use crate::observability::StructuredLogger;
use crate::probes::{DropCounters, EventFilter, KernelTracer, ProbeSet, ProbeStatus, ProcfsTracer};
use crate::resolver::{JobBook, JobError, JobResolver, MonitorTarget, ProcessTable, Resolution};

/// How long teardown waits for accounting lookups still in flight
const ACCOUNTING_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("tracer backend unavailable: {0}")]
    Backend(String),
    #[error("no probe category could be attached ({0})")]
    NoUsableProbes(String),
    #[error("session task failed: {0}")]
    Task(String),
}

pub struct SessionBuilder {
    config: MonitorConfig,
    tracer: Option<Arc<dyn KernelTracer>>,
    resolver: Option<Arc<JobResolver>>,
    health: HealthRegistry,
    logger: Option<StructuredLogger>,
}

impl SessionBuilder {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            tracer: None,
            resolver: None,
            health: HealthRegistry::new(),
            logger: None,
        }
    }

    /// Tracer backend; defaults to the procfs sampler
    pub fn tracer(mut self, tracer: Arc<dyn KernelTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Job resolver; defaults to one over the local host
    pub fn resolver(mut self, resolver: JobResolver) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Attach probes, resolve the target once and start every session task.
    /// Fails without producing a session when the configuration is invalid
    /// or no probe category attaches.
    pub async fn start(self) -> Result<SessionHandle, SessionError> {
        let config = self.config;
        config.validate()?;

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(JobResolver::from_config(
                &config,
                StructuredLogger::new(ProcessTable::new().hostname()),
            )),
        };
        let hostname = resolver.process_table().hostname();
        let logger = self
            .logger
            .unwrap_or_else(|| StructuredLogger::new(hostname.clone()));
        let tracer: Arc<dyn KernelTracer> = match self.tracer {
            Some(tracer) => tracer,
            None => Arc::new(
                ProcfsTracer::new().map_err(|e| SessionError::Backend(format!("{e:#}")))?,
            ),
        };

        let drops = Arc::new(DropCounters::new());
        let aggregator = Arc::new(Aggregator::with_memory_limit(
            config.performance.memory_limit_mb,
            drops.clone(),
        ));
        aggregator.reset();
        debug!(max_buckets = aggregator.max_buckets(), "Process bucket cap");

        let filter = EventFilter::from_config(&config.ebpf);
        let probes = ProbeSet::attach(tracer, &config.ebpf, &filter);
        for (probe, status) in probes.statuses() {
            if let ProbeStatus::Degraded { reason } = status {
                logger.log_probe_attach_failed(*probe, reason);
            }
        }
        self.health.record_probes(probes.statuses()).await;
        if probes.active_count() == 0 {
            let detail = probes
                .statuses()
                .iter()
                .map(|(probe, status)| match status {
                    ProbeStatus::Degraded { reason } => format!("{probe}: {reason}"),
                    ProbeStatus::Disabled => format!("{probe}: disabled"),
                    ProbeStatus::Attached => format!("{probe}: attached"),
                })
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SessionError::NoUsableProbes(detail));
        }

        let system_info = SystemInfo {
            hostname,
            backend: probes.backend().to_string(),
            kernel_version: probes.kernel_version().to_string(),
            record_layout: probes.decode_table().layout(),
            scheduler_available: resolver.scheduler_available().await,
            fallback_used: false,
            probes: probes.statuses().clone(),
        };

        let target = config.session.target.clone();
        let initial = resolver.resolve(&target).await;
        if !initial.errors.is_empty() {
            warn!(target = %target, errors = initial.errors.len(), "Initial resolution incomplete");
        }

        let active_probes = probes.active_count();
        let start_time = Utc::now();
        let started = Instant::now();

        let drain_token = CancellationToken::new();
        let drain = DrainLoop::new(
            probes,
            aggregator.clone(),
            filter,
            drops.clone(),
            DrainConfig::from_monitor_config(&config),
        );
        let drain_task = tokio::spawn(drain.run(drain_token.clone()));

        let refresh_token = CancellationToken::new();
        let (resolution, refresh_task) =
            resolver
                .clone()
                .spawn_refresh(target.clone(), initial, refresh_token.clone());

        self.health.register(components::DRAIN).await;
        self.health.register(components::RESOLVER).await;
        self.health.set_ready(true).await;
        logger.log_session_started(
            &target.to_string(),
            &system_info.backend,
            active_probes,
            config.session.duration_secs,
        );

        let (live_tx, live_rx) = watch::channel(Arc::new(LiveSnapshot::starting(start_time)));
        let canceller = SessionCanceller {
            token: CancellationToken::new(),
            cancelled_at: Arc::new(OnceLock::new()),
        };

        let controller = Controller {
            classifier: Classifier::new(config.classification.clone()),
            config,
            target,
            resolver,
            aggregator,
            drops,
            book: JobBook::new(),
            finalized_at: HashMap::new(),
            accounting: JoinSet::new(),
            system_info,
            health: self.health,
            logger,
            start_time,
            started,
            resolution,
            live: live_tx,
            canceller: canceller.clone(),
            drain_task: Some(drain_task),
            drain_token,
            refresh_task: Some(refresh_task),
            refresh_token,
            resolver_degraded: false,
            tick: 0,
        };

        Ok(SessionHandle {
            canceller,
            live: live_rx,
            task: tokio::spawn(controller.run()),
        })
    }
}

/// Cloneable cancellation side of a session
#[derive(Debug, Clone)]
pub struct SessionCanceller {
    token: CancellationToken,
    cancelled_at: Arc<OnceLock<DateTime<Utc>>>,
}

impl SessionCanceller {
    /// Request cancellation and return the instant it was first requested,
    /// which becomes the session's end time.
    pub fn cancel(&self) -> DateTime<Utc> {
        let at = *self.cancelled_at.get_or_init(Utc::now);
        self.token.cancel();
        at
    }
}

pub struct SessionHandle {
    canceller: SessionCanceller,
    live: watch::Receiver<Arc<LiveSnapshot>>,
    task: JoinHandle<MonitoringSession>,
}

impl SessionHandle {
    pub fn cancel(&self) -> DateTime<Utc> {
        self.canceller.cancel()
    }

    pub fn canceller(&self) -> SessionCanceller {
        self.canceller.clone()
    }

    /// Receiver of the latest live snapshot
    pub fn live(&self) -> watch::Receiver<Arc<LiveSnapshot>> {
        self.live.clone()
    }

    /// Wait for the session to finish and return its report
    pub async fn wait(self) -> Result<MonitoringSession, SessionError> {
        self.task.await.map_err(|e| SessionError::Task(e.to_string()))
    }
}

struct Controller {
    config: MonitorConfig,
    target: MonitorTarget,
    resolver: Arc<JobResolver>,
    aggregator: Arc<Aggregator>,
    drops: Arc<DropCounters>,
    classifier: Classifier,
    book: JobBook,
    /// Monitored time at which each finalized job ended
    finalized_at: HashMap<String, u64>,
    /// `sacct` lookups for scheduler jobs that ended
    accounting: JoinSet<(String, Option<BTreeMap<String, String>>)>,
    system_info: SystemInfo,
    health: HealthRegistry,
    logger: StructuredLogger,
    start_time: DateTime<Utc>,
    started: Instant,
    resolution: watch::Receiver<Arc<Resolution>>,
    live: watch::Sender<Arc<LiveSnapshot>>,
    canceller: SessionCanceller,
    drain_task: Option<JoinHandle<(ProbeSet, DrainStats)>>,
    drain_token: CancellationToken,
    refresh_task: Option<JoinHandle<()>>,
    refresh_token: CancellationToken,
    resolver_degraded: bool,
    tick: u64,
}

impl Controller {
    async fn run(mut self) -> MonitoringSession {
        let shutdown = self.canceller.token.clone();
        let deadline = self
            .config
            .session
            .duration_secs
            .map(|secs| self.started + Duration::from_secs(secs));
        let expired = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut ticker = interval(Duration::from_millis(self.config.session.report_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let status = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Session cancelled");
                    break SessionStatus::Cancelled;
                }
                _ = &mut expired => {
                    info!("Session duration reached");
                    break SessionStatus::Completed;
                }
                _ = ticker.tick() => self.report_tick().await,
            }
        };

        self.finish(status).await
    }

    fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn monitored_ns(&self, job: &Job, now_ns: u64) -> u64 {
        self.finalized_at.get(job.job_id()).copied().unwrap_or(now_ns)
    }

    async fn reconcile(&mut self, resolution: &Resolution) {
        let now = self.elapsed_ns();
        let Some(alive) = self.live_pids(resolution).await else {
            return;
        };
        let outcome = self.book.reconcile(
            &resolution.jobs,
            resolution.complete,
            |pid| alive.contains(&pid),
            &self.aggregator,
        );
        for job_id in outcome.reopened {
            self.finalized_at.remove(&job_id);
        }
        for job_id in outcome.finalized {
            self.finalized_at.insert(job_id.clone(), now);
            self.fetch_accounting(job_id);
        }
        self.book.refresh_metrics(&self.aggregator);

        let reclaimed = self.book.reclaim_exited(&self.aggregator);
        if reclaimed > 0 {
            debug!(reclaimed, "Reclaimed metrics of exited processes");
        }
    }

    /// Which of the PIDs the next reconcile looks at are still running.
    /// The `/proc` checks run on the blocking pool.
    async fn live_pids(&self, resolution: &Resolution) -> Option<HashSet<u32>> {
        let mut pids = self.book.tracked_pids();
        pids.extend(resolution.jobs.iter().flat_map(|j| j.pids.iter().copied()));
        let table = self.resolver.process_table().clone();
        let checked = tokio::task::spawn_blocking(move || {
            pids.into_iter()
                .filter(|pid| table.is_alive(*pid))
                .collect::<HashSet<u32>>()
        })
        .await;
        match checked {
            Ok(alive) => Some(alive),
            Err(e) => {
                warn!(error = %e, "Process liveness check failed, skipping reconcile");
                None
            }
        }
    }

    fn fetch_accounting(&mut self, job_id: String) {
        let from_scheduler = self
            .book
            .get(&job_id)
            .map_or(false, |j| j.source == JobSource::Scheduler);
        if !from_scheduler {
            return;
        }
        let resolver = self.resolver.clone();
        self.accounting.spawn(async move {
            let fields = resolver.accounting(&job_id).await;
            (job_id, fields)
        });
    }

    async fn report_tick(&mut self) {
        self.tick += 1;
        let resolution = self.resolution.borrow().clone();
        self.reconcile(&resolution).await;

        let degraded = resolution.used_fallback() || !resolution.errors.is_empty();
        if degraded != self.resolver_degraded {
            self.resolver_degraded = degraded;
            if degraded {
                self.health
                    .set_degraded(components::RESOLVER, "scheduler unavailable or query failed")
                    .await;
            } else {
                self.health.set_healthy(components::RESOLVER).await;
            }
        }
        let snapshot = self.live_snapshot(SessionStatus::Running);
        debug!(
            tick = self.tick,
            jobs = snapshot.jobs.len(),
            tracked_processes = snapshot.tracked_processes,
            "Published live snapshot"
        );
        self.live.send_replace(Arc::new(snapshot));
    }

    fn live_snapshot(&self, status: SessionStatus) -> LiveSnapshot {
        let now = self.elapsed_ns();
        let jobs = self
            .book
            .jobs()
            .map(|job| {
                let input =
                    ClassifierInput::from_metrics(&job.aggregated_metrics, self.monitored_ns(job, now));
                let classification = self.classifier.classify(&input);
                LiveJob {
                    job_id: job.info.job_id.clone(),
                    user: job.info.user.clone(),
                    job_name: job.info.job_name.clone(),
                    processes: job.process_count(),
                    cpu_percent: round_to(input.cpu_percent, 2),
                    io_percent: round_to(input.io_percent, 2),
                    wait_percent: round_to(input.wait_percent, 2),
                    class: classification.class,
                    efficiency_score: classification.efficiency_score,
                    finalized: job.finalized,
                }
            })
            .collect();

        LiveSnapshot {
            taken_at: Utc::now(),
            elapsed_seconds: round_to(now as f64 / 1e9, 3),
            status,
            tick: self.tick,
            jobs,
            tracked_processes: self.aggregator.len(),
            drop_counts: self.drops.snapshot(),
        }
    }

    async fn finish(mut self, mut status: SessionStatus) -> MonitoringSession {
        let mut errors: Vec<JobError> = Vec::new();

        // Stop draining, then detach once the loop has made its last pass
        self.drain_token.cancel();
        let drain_stats = match self.drain_task.take() {
            Some(task) => match task.await {
                Ok((mut probes, stats)) => {
                    probes.detach_all();
                    stats
                }
                Err(e) => {
                    error!(error = %e, "Drain task failed");
                    self.health
                        .set_unhealthy(components::DRAIN, e.to_string())
                        .await;
                    errors.push(JobError {
                        target: components::DRAIN.to_string(),
                        error: e.to_string(),
                    });
                    status = SessionStatus::Failed;
                    DrainStats::default()
                }
            },
            None => DrainStats::default(),
        };

        self.refresh_token.cancel();
        if let Some(task) = self.refresh_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Resolver refresh task failed");
            }
        }

        let end_time = match status {
            SessionStatus::Cancelled => self
                .canceller
                .cancelled_at
                .get()
                .copied()
                .unwrap_or_else(Utc::now),
            _ => Utc::now(),
        };

        // Final consistent snapshot; nothing ingests any more
        let resolution = self.resolution.borrow().clone();
        self.reconcile(&resolution).await;
        errors.extend(resolution.errors.iter().cloned());
        self.collect_accounting().await;

        let now = self.elapsed_ns();
        let mut reports = Vec::with_capacity(self.book.len());
        let mut inputs = Vec::with_capacity(self.book.len());
        for job in self.book.jobs() {
            let monitored = self.monitored_ns(job, now);
            let input = ClassifierInput::from_metrics(&job.aggregated_metrics, monitored);
            let classification = self.classifier.classify(&input);
            self.logger.log_job_classified(job.job_id(), &classification);
            reports.push(JobReport::new(job, &input, classification, monitored));
            inputs.push(input);
        }
        let comparison = compare_jobs(
            reports
                .iter()
                .zip(&inputs)
                .map(|(r, input)| (r.job_id.as_str(), input, &r.classification)),
        );

        let mut system_info = self.system_info.clone();
        system_info.fallback_used = self.book.jobs().any(|j| j.source == JobSource::Fallback);

        let duration_seconds =
            ((end_time - self.start_time).num_milliseconds().max(0)) as f64 / 1000.0;
        let drop_counts = self.drops.snapshot();

        self.live.send_replace(Arc::new(self.live_snapshot(status)));
        self.health.set_ready(false).await;
        self.logger.log_session_finalized(
            status,
            reports.len(),
            self.drops.total_dropped(),
            duration_seconds,
        );
        info!(
            iterations = drain_stats.iterations,
            forwarded = drain_stats.forwarded,
            filtered = drain_stats.filtered,
            "Drain loop summary"
        );

        MonitoringSession {
            monitoring_session: SessionInfo {
                start_time: self.start_time,
                end_time,
                duration_seconds,
                status,
                target: self.target.to_string(),
            },
            system_info,
            summary: SessionSummary {
                total_jobs: reports.len(),
                comparison,
                drop_counts_by_probe_type: drop_counts,
                events_processed: drain_stats.forwarded,
                tracked_processes: self.aggregator.len(),
                errors,
            },
            jobs: reports,
        }
    }

    /// Attach the accounting lookups that finish within the grace period
    async fn collect_accounting(&mut self) {
        let grace = sleep(ACCOUNTING_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = self.accounting.join_next() => match joined {
                    Some(Ok((job_id, Some(fields)))) => self.book.set_accounting(&job_id, fields),
                    Some(Ok((_, None))) => {}
                    Some(Err(e)) => warn!(error = %e, "Accounting lookup failed"),
                    None => break,
                },
                _ = &mut grace => {
                    warn!(pending = self.accounting.len(), "Abandoning slow accounting lookups");
                    self.accounting.abort_all();
                    break;
                }
            }
        }
    }
}
