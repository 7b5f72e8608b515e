//! Classification precedence, confidence and templates

use super::{round_to, ClassifierInput};
use crate::config::Thresholds;
use crate::models::{Bottleneck, JobClass, Severity};

/// I/O volume above which a caching hint is added
const LARGE_IO_BYTES: u64 = 1_000_000_000;

/// Multiple of the context-switch threshold that marks thread churn in CPU-bound jobs
const CPU_CHURN_FACTOR: f64 = 5.0;

/// First matching rule wins
pub fn decide(input: &ClassifierInput, t: &Thresholds) -> JobClass {
    if input.wait_percent >= t.idle_heavy {
        JobClass::IdleHeavy
    } else if input.io_percent >= t.io_bound && input.io_percent > input.cpu_percent {
        JobClass::IoBound
    } else if input.cpu_percent >= t.cpu_bound {
        JobClass::CpuBound
    } else if input.net_operations as f64 >= t.network_intensive {
        JobClass::NetworkBound
    } else {
        JobClass::Balanced
    }
}

/// Margin of the winning metric over its threshold, scaled to 0..=1
pub fn confidence(class: JobClass, input: &ClassifierInput, t: &Thresholds) -> f64 {
    let raw = match class {
        JobClass::IdleHeavy => percent_margin(input.wait_percent, t.idle_heavy),
        JobClass::IoBound => percent_margin(input.io_percent, t.io_bound),
        JobClass::CpuBound => percent_margin(input.cpu_percent, t.cpu_bound),
        JobClass::NetworkBound => {
            if t.network_intensive > 0.0 {
                (input.net_operations as f64 - t.network_intensive) / t.network_intensive
            } else {
                1.0
            }
        }
        JobClass::Balanced => [
            (input.wait_percent, t.idle_heavy),
            (input.io_percent, t.io_bound),
            (input.cpu_percent, t.cpu_bound),
        ]
        .iter()
        .filter(|(_, threshold)| *threshold > 0.0)
        .map(|(metric, threshold)| (threshold - metric) / threshold)
        .fold(1.0, f64::min),
    };

    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn percent_margin(metric: f64, threshold: f64) -> f64 {
    let headroom = 100.0 - threshold;
    if headroom <= 0.0 {
        1.0
    } else {
        (metric - threshold) / headroom
    }
}

pub fn severity(margin: f64) -> Severity {
    if margin > 20.0 {
        Severity::High
    } else if margin > 10.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Percent above a count threshold, so count margins share the points scale
fn count_margin(value: u64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        0.0
    } else {
        (value as f64 - threshold) / threshold * 100.0
    }
}

/// One entry per exceeded threshold, in fixed order
pub fn bottlenecks(input: &ClassifierInput, t: &Thresholds) -> Vec<Bottleneck> {
    let mut found = Vec::new();
    let mut push = |resource: &str, margin: f64, description: String| {
        found.push(Bottleneck {
            resource: resource.to_string(),
            severity: severity(margin),
            margin: round_to(margin, 2),
            description,
        });
    };

    if input.cpu_percent >= t.cpu_bound {
        push(
            "cpu",
            input.cpu_percent - t.cpu_bound,
            format!(
                "CPU time {:.1}% is at or above the {:.1}% CPU-bound threshold",
                input.cpu_percent, t.cpu_bound
            ),
        );
    }
    if input.io_percent >= t.io_bound {
        push(
            "io",
            input.io_percent - t.io_bound,
            format!(
                "I/O time {:.1}% is at or above the {:.1}% I/O-bound threshold",
                input.io_percent, t.io_bound
            ),
        );
    }
    if input.wait_percent >= t.idle_heavy {
        push(
            "wait",
            input.wait_percent - t.idle_heavy,
            format!(
                "Wait time {:.1}% is at or above the {:.1}% idle threshold",
                input.wait_percent, t.idle_heavy
            ),
        );
    }
    if input.context_switches as f64 > t.context_switch {
        push(
            "context_switches",
            count_margin(input.context_switches, t.context_switch),
            format!(
                "{} context switches exceed the threshold of {:.0}",
                input.context_switches, t.context_switch
            ),
        );
    }
    if input.net_operations as f64 >= t.network_intensive {
        push(
            "network",
            count_margin(input.net_operations, t.network_intensive),
            format!(
                "{} network operations reach the threshold of {:.0}",
                input.net_operations, t.network_intensive
            ),
        );
    }
    found
}

pub fn recommendations(
    class: JobClass,
    input: &ClassifierInput,
    t: &Thresholds,
    ctx_norm: f64,
) -> Vec<String> {
    let mut out: Vec<&str> = Vec::new();
    let churning = input.context_switches as f64 > t.context_switch;

    match class {
        JobClass::CpuBound => {
            out.extend([
                "Job is CPU-intensive, consider using more CPU cores",
                "Optimize algorithms for better CPU utilization",
                "Consider CPU affinity settings for better cache locality",
            ]);
            if input.context_switches as f64 > t.context_switch * CPU_CHURN_FACTOR {
                out.push("High context switching detected, check for unnecessary thread creation");
            }
        }
        JobClass::IoBound => {
            out.extend([
                "Job is I/O intensive, consider faster storage or I/O optimization",
                "Use asynchronous I/O or buffering to improve performance",
                "Consider using SSDs or parallel file systems",
            ]);
            if input.io_bytes_total > LARGE_IO_BYTES {
                out.push("Large I/O volume detected, consider data compression or caching");
            }
        }
        JobClass::IdleHeavy => out.extend([
            "Job has significant idle time, investigate bottlenecks",
            "Consider reducing resource allocation if consistently idle",
            "Check for synchronization issues or external dependencies",
        ]),
        JobClass::NetworkBound => out.extend([
            "Job is network-intensive, review communication patterns and message sizes",
            "Consider aggregating small messages or overlapping communication with computation",
            "Check process placement against the interconnect topology",
        ]),
        JobClass::Balanced if churning => out.extend([
            "Job has mixed workload with high activity",
            "Consider hybrid optimization strategies",
            "Monitor resource usage patterns for fine-tuning",
        ]),
        JobClass::Balanced => {
            out.push("Resource usage is balanced, no dominant bottleneck detected")
        }
    }

    if class != JobClass::NetworkBound && input.net_operations as f64 >= t.network_intensive {
        out.push("High network activity detected, consider network optimization");
    }
    if input.context_switches as f64 > ctx_norm {
        out.push("Very high context switching, investigate thread/process management");
    }

    out.into_iter().map(String::from).collect()
}
