//! Job classification and efficiency scoring
//!
//! A [`Classification`] is a pure function of a job's aggregated counters,
//! the monitored duration and the configured thresholds and weights.

mod compare;
mod rules;
mod score;

pub use compare::{compare_jobs, JobComparison, RankedJob};
pub use rules::{bottlenecks, confidence, decide, recommendations, severity};
pub use score::{
    context_switch_efficiency, cpu_efficiency, efficiency_score, io_efficiency,
    syscall_efficiency,
};

use serde::Serialize;

use crate::config::ClassificationConfig;
use crate::models::{Classification, ProcessMetrics};

/// Normalized classifier inputs. Percentages are shares of the monitored
/// duration and are always finite.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClassifierInput {
    pub cpu_percent: f64,
    pub io_percent: f64,
    pub wait_percent: f64,
    pub context_switches: u64,
    pub net_operations: u64,
    pub io_bytes_total: u64,
}

impl ClassifierInput {
    /// Derive percentages from raw counters.
    ///
    /// Off-CPU wait overlapping I/O syscalls is attributed to I/O, so the
    /// accounted time is `cpu + io + max(wait - io, 0)`. The denominator is
    /// the larger of that and the monitored duration; a zero denominator
    /// yields zero percentages.
    pub fn from_metrics(metrics: &ProcessMetrics, monitored_ns: u64) -> Self {
        let cpu = metrics.cpu_time_ns as f64;
        let io = metrics.io_syscall_time_ns as f64;
        let wait = metrics.wait_time_ns.saturating_sub(metrics.io_syscall_time_ns) as f64;
        let denom = (cpu + io + wait).max(monitored_ns as f64);

        let percent = |part: f64| {
            if denom > 0.0 {
                sanitize(100.0 * part / denom)
            } else {
                0.0
            }
        };

        Self {
            cpu_percent: percent(cpu),
            io_percent: percent(io),
            wait_percent: percent(wait),
            context_switches: metrics.context_switches,
            net_operations: metrics.net_ops.max(metrics.net_syscalls),
            io_bytes_total: metrics.io_bytes_total(),
        }
    }

    fn sanitized(&self) -> Self {
        Self {
            cpu_percent: sanitize(self.cpu_percent),
            io_percent: sanitize(self.io_percent),
            wait_percent: sanitize(self.wait_percent),
            ..self.clone()
        }
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

pub struct Classifier {
    config: ClassificationConfig,
}

impl Classifier {
    pub fn new(config: ClassificationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassificationConfig {
        &self.config
    }

    pub fn classify(&self, input: &ClassifierInput) -> Classification {
        let input = input.sanitized();
        let t = &self.config.thresholds;
        let ctx_norm = self.config.context_switch_norm;

        let class = decide(&input, t);
        Classification {
            class,
            confidence: round_to(confidence(class, &input, t), 3),
            efficiency_score: round_to(
                efficiency_score(&input, &self.config.efficiency_weights, ctx_norm),
                2,
            ),
            bottlenecks: bottlenecks(&input, t),
            recommendations: recommendations(class, &input, t, ctx_norm),
        }
    }

    pub fn classify_metrics(&self, metrics: &ProcessMetrics, monitored_ns: u64) -> Classification {
        self.classify(&ClassifierInput::from_metrics(metrics, monitored_ns))
    }
}

/// Round half away from zero to `places` decimals
pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
