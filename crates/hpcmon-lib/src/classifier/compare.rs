//! Multi-job comparison summary

use serde::Serialize;
use std::collections::BTreeMap;

use super::{round_to, ClassifierInput};
use crate::models::{Classification, JobClass};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedJob {
    pub job_id: String,
    pub efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobComparison {
    pub total_jobs: usize,
    pub average_efficiency: f64,
    pub average_cpu_percent: f64,
    pub average_io_percent: f64,
    pub best_job: RankedJob,
    pub worst_job: RankedJob,
    pub classification_distribution: BTreeMap<JobClass, usize>,
    pub efficiency_scores: BTreeMap<String, f64>,
}

/// Summarize classified jobs. `None` when there is nothing to compare.
///
/// Ties for best or worst go to the job listed first.
pub fn compare_jobs<'a, I>(jobs: I) -> Option<JobComparison>
where
    I: IntoIterator<Item = (&'a str, &'a ClassifierInput, &'a Classification)>,
{
    let mut total = 0usize;
    let mut eff_sum = 0.0;
    let mut cpu_sum = 0.0;
    let mut io_sum = 0.0;
    let mut best: Option<RankedJob> = None;
    let mut worst: Option<RankedJob> = None;
    let mut distribution = BTreeMap::new();
    let mut scores = BTreeMap::new();

    for (job_id, input, classification) in jobs {
        let score = classification.efficiency_score;
        total += 1;
        eff_sum += score;
        cpu_sum += input.cpu_percent;
        io_sum += input.io_percent;
        *distribution.entry(classification.class).or_insert(0) += 1;
        scores.insert(job_id.to_string(), score);

        if best.as_ref().map_or(true, |b| score > b.efficiency) {
            best = Some(RankedJob { job_id: job_id.to_string(), efficiency: score });
        }
        if worst.as_ref().map_or(true, |w| score < w.efficiency) {
            worst = Some(RankedJob { job_id: job_id.to_string(), efficiency: score });
        }
    }

    let n = total as f64;
    Some(JobComparison {
        total_jobs: total,
        average_efficiency: round_to(eff_sum / n, 2),
        average_cpu_percent: round_to(cpu_sum / n, 2),
        average_io_percent: round_to(io_sum / n, 2),
        best_job: best?,
        worst_job: worst?,
        classification_distribution: distribution,
        efficiency_scores: scores,
    })
}
