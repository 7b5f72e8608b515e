//! Efficiency score
//!
//! `score = w_cpu·cpu_eff + w_io·io_eff + 100·w_ctx·(1 − min(cs/ctx_norm, 1)) + w_sys·syscall_eff`
//! clamped to 0..=100, where
//! - `cpu_eff` is CPU percent clamped to 0..=100
//! - `io_eff` is the share of off-CPU time spent in I/O, `100·io/(io + wait)`
//! - `syscall_eff` is `cpu + io − wait`, so idle time counts against the job

use super::ClassifierInput;
use crate::config::EfficiencyWeights;

pub fn cpu_efficiency(input: &ClassifierInput) -> f64 {
    input.cpu_percent.clamp(0.0, 100.0)
}

pub fn io_efficiency(input: &ClassifierInput) -> f64 {
    let off_cpu = input.io_percent + input.wait_percent;
    if off_cpu <= 0.0 {
        0.0
    } else {
        100.0 * input.io_percent / off_cpu
    }
}

pub fn syscall_efficiency(input: &ClassifierInput) -> f64 {
    input.cpu_percent + input.io_percent - input.wait_percent
}

/// Context-switch term before weighting, in points
pub fn context_switch_efficiency(input: &ClassifierInput, ctx_norm: f64) -> f64 {
    if ctx_norm <= 0.0 {
        return 0.0;
    }
    100.0 * (1.0 - (input.context_switches as f64 / ctx_norm).min(1.0))
}

pub fn efficiency_score(input: &ClassifierInput, weights: &EfficiencyWeights, ctx_norm: f64) -> f64 {
    let score = weights.cpu * cpu_efficiency(input)
        + weights.io * io_efficiency(input)
        + weights.context_switch * context_switch_efficiency(input, ctx_norm)
        + weights.syscall * syscall_efficiency(input);

    if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
