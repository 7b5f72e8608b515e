//! Structured logging for monitor lifecycle events
//!
//! Every event carries an `event` name and the `node` it was produced on, so
//! JSON log pipelines can filter on them without parsing messages.

use tracing::{info, warn};

use crate::models::{Classification, ProbeType, SessionStatus};

#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_session_started(
        &self,
        target: &str,
        backend: &str,
        attached_probes: usize,
        duration_secs: Option<u64>,
    ) {
        info!(
            event = "session_started",
            node = %self.node_name,
            target = %target,
            backend = %backend,
            attached_probes = attached_probes,
            duration_secs = ?duration_secs,
            "Monitoring session started"
        );
    }

    pub fn log_probe_attach_failed(&self, probe: ProbeType, reason: &str) {
        warn!(
            event = "probe_attach_failed",
            node = %self.node_name,
            probe = %probe,
            reason = %reason,
            "Probe attach failed, category degraded"
        );
    }

    pub fn log_fallback_activated(&self, target: &str, reason: &str) {
        warn!(
            event = "fallback_activated",
            node = %self.node_name,
            target = %target,
            reason = %reason,
            "Scheduler unavailable for query, using process fallback"
        );
    }

    pub fn log_job_classified(&self, job_id: &str, classification: &Classification) {
        info!(
            event = "job_classified",
            node = %self.node_name,
            job_id = %job_id,
            class = %classification.class,
            confidence = classification.confidence,
            efficiency_score = classification.efficiency_score,
            bottlenecks = classification.bottlenecks.len(),
            "Job classified"
        );
    }

    pub fn log_session_finalized(
        &self,
        status: SessionStatus,
        jobs: usize,
        dropped_events: u64,
        duration_secs: f64,
    ) {
        match status {
            SessionStatus::Failed => warn!(
                event = "session_finalized",
                node = %self.node_name,
                status = ?status,
                jobs = jobs,
                dropped_events = dropped_events,
                duration_secs = duration_secs,
                "Monitoring session failed"
            ),
            _ => info!(
                event = "session_finalized",
                node = %self.node_name,
                status = ?status,
                jobs = jobs,
                dropped_events = dropped_events,
                duration_secs = duration_secs,
                "Monitoring session finalized"
            ),
        }
    }
}
