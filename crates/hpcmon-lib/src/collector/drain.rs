//! Event drain loop
//!
//! Polls every attached probe buffer on a fixed cadence, decodes records and
//! forwards the surviving events to the aggregator. The loop owns the
//! `ProbeSet` while it runs and hands it back on exit so the caller can
//! detach after the final drain pass.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::Aggregator;
use crate::config::MonitorConfig;
use crate::models::ProbeType;
use crate::probes::{DropCounters, EventFilter, ProbeSet};

/// Upper bound on extra passes made after cancellation
const FINAL_DRAIN_PASSES: usize = 16;

#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Time between polls (default: 100ms)
    pub poll_interval: Duration,
    /// Records taken from one buffer per poll
    pub max_events_per_poll: usize,
    /// Fraction of decoded events kept
    pub sampling_rate: f64,
    /// Emit a debug summary every N iterations
    pub stats_every: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_events_per_poll: 1000,
            sampling_rate: 1.0,
            stats_every: 100,
        }
    }
}

impl DrainConfig {
    pub fn from_monitor_config(config: &MonitorConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.ebpf.poll_interval_ms),
            max_events_per_poll: config.performance.max_events_per_poll,
            sampling_rate: config.performance.sampling_rate,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub iterations: u64,
    pub records: u64,
    pub forwarded: u64,
    pub filtered: u64,
}

/// Deterministic 1-in-N stride per category
#[derive(Debug, Clone)]
pub struct Sampler {
    stride: u64,
    seen: [u64; 4],
}

impl Sampler {
    pub fn new(rate: f64) -> Self {
        let stride = if rate >= 1.0 || rate <= 0.0 {
            1
        } else {
            (1.0 / rate).round().max(1.0) as u64
        };
        Self {
            stride,
            seen: [0; 4],
        }
    }

    pub fn keep(&mut self, probe: ProbeType) -> bool {
        let seen = &mut self.seen[probe.index()];
        let keep = *seen % self.stride == 0;
        *seen += 1;
        keep
    }
}

pub struct DrainLoop {
    probes: ProbeSet,
    aggregator: Arc<Aggregator>,
    filter: EventFilter,
    drops: Arc<DropCounters>,
    sampler: Sampler,
    config: DrainConfig,
    stats: DrainStats,
}

impl DrainLoop {
    pub fn new(
        probes: ProbeSet,
        aggregator: Arc<Aggregator>,
        filter: EventFilter,
        drops: Arc<DropCounters>,
        config: DrainConfig,
    ) -> Self {
        Self {
            probes,
            aggregator,
            filter,
            drops,
            sampler: Sampler::new(config.sampling_rate),
            config,
            stats: DrainStats::default(),
        }
    }

    pub fn stats(&self) -> DrainStats {
        self.stats
    }

    /// One pass over every attached buffer. Returns the number of records taken.
    pub fn poll_once(&mut self) -> usize {
        let table = *self.probes.decode_table();
        let active: Vec<ProbeType> = self.probes.active().collect();
        let mut taken = 0;

        for probe in active {
            let batch = self.probes.poll(probe, self.config.max_events_per_poll);
            self.drops.add_dropped(probe, batch.lost);
            taken += batch.records.len();

            for raw in &batch.records {
                let decoded = match table.decode(raw) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        trace!(probe = %probe, error = %e, "Skipping undecodable record");
                        self.drops.add_decode_error(probe);
                        continue;
                    }
                };

                if !self.filter.admits(&decoded.event, decoded.comm.as_deref()) {
                    self.stats.filtered += 1;
                    continue;
                }
                if !self.sampler.keep(probe) {
                    self.drops.add_sampled_out(probe);
                    continue;
                }
                if self
                    .aggregator
                    .ingest(&decoded.event, decoded.comm.as_deref())
                {
                    self.stats.forwarded += 1;
                }
            }
        }

        self.stats.iterations += 1;
        self.stats.records += taken as u64;
        taken
    }

    /// Run `pass` on the blocking pool, where tracer backends may read files
    async fn blocking<T, F>(self, pass: F) -> (Self, T)
    where
        F: FnOnce(&mut Self) -> T + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::task::spawn_blocking(move || {
            let mut drain = self;
            let out = pass(&mut drain);
            (drain, out)
        });
        match task.await {
            Ok(done) => done,
            // Surface a failed pass as a failure of the drain task itself
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    /// Drain until cancelled, then make a last bounded pass and return the probes
    pub async fn run(mut self, cancel: CancellationToken) -> (ProbeSet, DrainStats) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            max_events_per_poll = self.config.max_events_per_poll,
            probes = self.probes.active_count(),
            "Starting event drain loop"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Stopping event drain loop");
                    break;
                }
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let (drain, taken) = self.blocking(Self::poll_once).await;
                    self = drain;

                    if self.config.stats_every > 0 && self.stats.iterations % self.config.stats_every == 0 {
                        debug!(
                            iterations = self.stats.iterations,
                            records = self.stats.records,
                            forwarded = self.stats.forwarded,
                            last_batch = taken,
                            elapsed_us = start.elapsed().as_micros() as u64,
                            "Drain cycle complete"
                        );
                    }
                }
            }
        }

        let (drain, passes) = self
            .blocking(|drain| {
                let mut passes = 0;
                while passes < FINAL_DRAIN_PASSES && drain.poll_once() > 0 {
                    passes += 1;
                }
                passes
            })
            .await;
        self = drain;
        debug!(passes, forwarded = self.stats.forwarded, "Final drain pass complete");

        (self.probes, self.stats)
    }
}
