//! Monitor configuration
//!
//! Every field carries a default so that a partial file (or nothing at all)
//! yields a runnable configuration. `validate()` rejects values that would
//! make the pipeline misbehave rather than silently clamping them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ProbeType;
use crate::resolver::MonitorTarget;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("performance.sampling_rate must be in (0, 1], got {0}")]
    SamplingRate(f64),
    #[error("classification.{field} must be within 0..=100, got {value}")]
    ThresholdRange { field: &'static str, value: f64 },
    #[error("classification.efficiency_weights must be non-negative and sum to a positive value")]
    Weights,
}

/// Top-level library configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub ebpf: EbpfConfig,
    pub slurm: SlurmConfig,
    pub classification: ClassificationConfig,
    pub performance: PerformanceConfig,
    pub session: SessionConfig,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ebpf.poll_interval_ms == 0 {
            return Err(ConfigError::NotPositive {
                field: "ebpf.poll_interval_ms",
            });
        }
        if self.ebpf.buffer_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "ebpf.buffer_size",
            });
        }
        if self.performance.max_events_per_poll == 0 {
            return Err(ConfigError::NotPositive {
                field: "performance.max_events_per_poll",
            });
        }
        if self.performance.memory_limit_mb == 0 {
            return Err(ConfigError::NotPositive {
                field: "performance.memory_limit_mb",
            });
        }
        let rate = self.performance.sampling_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ConfigError::SamplingRate(rate));
        }
        if self.slurm.cache_timeout == 0 {
            return Err(ConfigError::NotPositive {
                field: "slurm.cache_timeout",
            });
        }
        if self.slurm.command_timeout == 0 {
            return Err(ConfigError::NotPositive {
                field: "slurm.command_timeout",
            });
        }
        if self.session.report_interval_ms == 0 {
            return Err(ConfigError::NotPositive {
                field: "session.report_interval_ms",
            });
        }
        if self.classification.context_switch_norm <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "classification.context_switch_norm",
            });
        }

        let t = &self.classification.thresholds;
        for (field, value) in [
            ("thresholds.cpu_bound", t.cpu_bound),
            ("thresholds.io_bound", t.io_bound),
            ("thresholds.idle_heavy", t.idle_heavy),
        ] {
            // 100 would make the confidence denominator zero
            if !(0.0..100.0).contains(&value) {
                return Err(ConfigError::ThresholdRange { field, value });
            }
        }
        if t.network_intensive <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "classification.thresholds.network_intensive",
            });
        }

        let w = &self.classification.efficiency_weights;
        let weights = [w.cpu, w.io, w.context_switch, w.syscall];
        if weights.iter().any(|v| *v < 0.0 || !v.is_finite()) || weights.iter().sum::<f64>() <= 0.0
        {
            return Err(ConfigError::Weights);
        }

        Ok(())
    }
}

/// Which probe categories to attach
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeFilter {
    #[default]
    All,
    Syscall,
    Sched,
    Io,
    Net,
}

impl ProbeFilter {
    pub fn admits(&self, probe: ProbeType) -> bool {
        match self {
            ProbeFilter::All => true,
            ProbeFilter::Syscall => probe == ProbeType::Syscall,
            ProbeFilter::Sched => probe == ProbeType::Sched,
            ProbeFilter::Io => probe == ProbeType::Io,
            ProbeFilter::Net => probe == ProbeType::Net,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSwitches {
    pub syscalls: bool,
    pub scheduler: bool,
    pub io: bool,
    pub network: bool,
}

impl Default for ProbeSwitches {
    fn default() -> Self {
        Self {
            syscalls: true,
            scheduler: true,
            io: true,
            network: true,
        }
    }
}

impl ProbeSwitches {
    pub fn enabled(&self, probe: ProbeType) -> bool {
        match probe {
            ProbeType::Syscall => self.syscalls,
            ProbeType::Sched => self.scheduler,
            ProbeType::Io => self.io,
            ProbeType::Net => self.network,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EbpfConfig {
    pub filter: ProbeFilter,
    pub poll_interval_ms: u64,
    /// Capacity of each per-category buffer, in records
    pub buffer_size: usize,
    pub probes: ProbeSwitches,
    /// Syscall allow-list by name; empty means every syscall
    pub monitored_syscalls: Vec<String>,
    pub excluded_pids: Vec<u32>,
    /// Command-name prefixes to ignore, e.g. kernel housekeeping threads
    pub excluded_processes: Vec<String>,
}

impl Default for EbpfConfig {
    fn default() -> Self {
        Self {
            filter: ProbeFilter::All,
            poll_interval_ms: 100,
            buffer_size: 1024,
            probes: ProbeSwitches::default(),
            monitored_syscalls: Vec::new(),
            excluded_pids: vec![0],
            excluded_processes: vec![
                "kthreadd".to_string(),
                "kworker".to_string(),
                "ksoftirqd".to_string(),
                "migration".to_string(),
                "rcu_".to_string(),
            ],
        }
    }
}

impl EbpfConfig {
    /// A category is attached only when both the filter and its switch allow it
    pub fn wants(&self, probe: ProbeType) -> bool {
        self.filter.admits(probe) && self.probes.enabled(probe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    pub fields: Vec<String>,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            fields: [
                "JobID", "User", "JobName", "Partition", "State", "CPUTime", "MaxRSS", "Elapsed",
            ]
            .iter()
            .map(|f| f.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    pub enabled: bool,
    /// Seconds a resolution result stays fresh
    pub cache_timeout: u64,
    /// Seconds before a scheduler command is abandoned
    pub command_timeout: u64,
    pub enable_fallback: bool,
    pub max_fallback_jobs: usize,
    pub accounting: AccountingConfig,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_timeout: 30,
            command_timeout: 10,
            enable_fallback: true,
            max_fallback_jobs: 50,
            accounting: AccountingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_bound: f64,
    pub io_bound: f64,
    pub idle_heavy: f64,
    pub context_switch: f64,
    pub network_intensive: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_bound: 70.0,
            io_bound: 30.0,
            idle_heavy: 50.0,
            context_switch: 1000.0,
            network_intensive: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EfficiencyWeights {
    pub cpu: f64,
    pub io: f64,
    pub context_switch: f64,
    pub syscall: f64,
}

impl Default for EfficiencyWeights {
    fn default() -> Self {
        Self {
            cpu: 0.4,
            io: 0.3,
            context_switch: 0.2,
            syscall: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub thresholds: Thresholds,
    pub efficiency_weights: EfficiencyWeights,
    /// Context switches at which the switch term of the score bottoms out
    pub context_switch_norm: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            efficiency_weights: EfficiencyWeights::default(),
            context_switch_norm: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub max_events_per_poll: usize,
    pub memory_limit_mb: u64,
    pub sampling_rate: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_events_per_poll: 1000,
            memory_limit_mb: 512,
            sampling_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wall-clock bound; `None` runs until cancelled
    pub duration_secs: Option<u64>,
    pub report_interval_ms: u64,
    pub target: MonitorTarget,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_secs: Some(60),
            report_interval_ms: 1000,
            target: MonitorTarget::All,
        }
    }
}
