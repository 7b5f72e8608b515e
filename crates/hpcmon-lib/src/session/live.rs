//! Read-only view of a running session, republished every reporting tick

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{DropCounts, JobClass, ProbeType, SessionStatus};

#[derive(Debug, Clone, Serialize)]
pub struct LiveJob {
    pub job_id: String,
    pub user: String,
    pub job_name: String,
    pub processes: usize,
    pub cpu_percent: f64,
    pub io_percent: f64,
    pub wait_percent: f64,
    pub class: JobClass,
    pub efficiency_score: f64,
    pub finalized: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveSnapshot {
    pub taken_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub status: SessionStatus,
    pub tick: u64,
    pub jobs: Vec<LiveJob>,
    pub tracked_processes: usize,
    pub drop_counts: BTreeMap<ProbeType, DropCounts>,
}

impl LiveSnapshot {
    pub fn starting(at: DateTime<Utc>) -> Self {
        Self {
            taken_at: at,
            elapsed_seconds: 0.0,
            status: SessionStatus::Running,
            tick: 0,
            jobs: Vec::new(),
            tracked_processes: 0,
            drop_counts: BTreeMap::new(),
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&LiveJob> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }
}
