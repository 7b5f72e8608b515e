//! Kernel probe management
//!
//! A `ProbeSet` is the single owner of every attachment made for a session.
//! Each category attaches independently: a failure degrades that category
//! and is reported, but never prevents the others from attaching.

pub mod drops;
pub mod filter;
pub mod procfs;
pub mod record;
pub mod simulated;
pub mod syscalls;
pub mod tracer;

pub use drops::DropCounters;
pub use filter::EventFilter;
pub use procfs::ProcfsTracer;
pub use record::{DecodeError, DecodeTable, DecodedRecord, KernelVersion, RecordLayout};
pub use simulated::{EmitOutcome, SimulatedTracer};
pub use tracer::{AttachError, KernelTracer, PollBatch, ProbeHandle, ProbeSpec};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::EbpfConfig;
use crate::models::ProbeType;

/// Attachment state of one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProbeStatus {
    Attached,
    Degraded { reason: String },
    Disabled,
}

impl ProbeStatus {
    pub fn is_attached(&self) -> bool {
        matches!(self, ProbeStatus::Attached)
    }
}

pub struct ProbeSet {
    tracer: Arc<dyn KernelTracer>,
    table: DecodeTable,
    handles: BTreeMap<ProbeType, ProbeHandle>,
    statuses: BTreeMap<ProbeType, ProbeStatus>,
}

impl ProbeSet {
    /// Attach every category the configuration asks for
    pub fn attach(tracer: Arc<dyn KernelTracer>, config: &EbpfConfig, filter: &EventFilter) -> Self {
        let kernel = tracer.kernel_version();
        let table = DecodeTable::for_kernel(kernel);
        let mut handles = BTreeMap::new();
        let mut statuses = BTreeMap::new();

        for probe in ProbeType::ALL {
            if !config.wants(probe) {
                statuses.insert(probe, ProbeStatus::Disabled);
                continue;
            }

            let spec = ProbeSpec {
                probe_type: probe,
                buffer_capacity: config.buffer_size,
                layout: table.layout(),
                syscall_allow_list: match probe {
                    ProbeType::Syscall => filter.allowed_syscalls().cloned(),
                    _ => None,
                },
            };

            match tracer.attach(&spec) {
                Ok(handle) => {
                    info!(probe = %probe, backend = tracer.name(), "Probe attached");
                    handles.insert(probe, handle);
                    statuses.insert(probe, ProbeStatus::Attached);
                }
                Err(e) => {
                    debug!(probe = %probe, backend = tracer.name(), error = %e, "Probe attach failed");
                    statuses.insert(
                        probe,
                        ProbeStatus::Degraded {
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }

        info!(
            backend = tracer.name(),
            kernel = %kernel,
            layout = ?table.layout(),
            attached = handles.len(),
            "Probe set ready"
        );

        Self {
            tracer,
            table,
            handles,
            statuses,
        }
    }

    pub fn decode_table(&self) -> &DecodeTable {
        &self.table
    }

    pub fn backend(&self) -> &str {
        self.tracer.name()
    }

    pub fn kernel_version(&self) -> KernelVersion {
        self.tracer.kernel_version()
    }

    /// Status as established at attach time, for every category
    pub fn statuses(&self) -> &BTreeMap<ProbeType, ProbeStatus> {
        &self.statuses
    }

    /// Categories currently attached
    pub fn active(&self) -> impl Iterator<Item = ProbeType> + '_ {
        self.handles.keys().copied()
    }

    pub fn active_count(&self) -> usize {
        self.handles.len()
    }

    pub fn poll(&self, probe: ProbeType, max_records: usize) -> PollBatch {
        match self.handles.get(&probe) {
            Some(handle) => self.tracer.poll(handle, max_records),
            None => PollBatch::default(),
        }
    }

    /// Detach every probe. Idempotent.
    pub fn detach_all(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        let count = handles.len();
        for (_, handle) in handles {
            self.tracer.detach(handle);
        }
        if count > 0 {
            info!(detached = count, backend = self.tracer.name(), "Probes detached");
        }
    }
}

impl Drop for ProbeSet {
    fn drop(&mut self) {
        self.detach_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeFilter;

    fn tracer() -> SimulatedTracer {
        SimulatedTracer::new(KernelVersion::new(6, 1, 0))
    }

    #[test]
    fn test_attach_failure_degrades_only_that_category() {
        let sim = Arc::new(tracer().with_attach_failure(
            ProbeType::Net,
            AttachError::PermissionDenied("CAP_BPF".to_string()),
        ));
        let config = EbpfConfig::default();
        let probes = ProbeSet::attach(sim.clone(), &config, &EventFilter::from_config(&config));

        assert_eq!(probes.active_count(), 3);
        assert!(probes.statuses()[&ProbeType::Syscall].is_attached());
        assert!(matches!(
            probes.statuses()[&ProbeType::Net],
            ProbeStatus::Degraded { .. }
        ));
        assert_eq!(sim.attached_count(), 3);
    }

    #[test]
    fn test_filter_disables_categories() {
        let sim = Arc::new(tracer());
        let config = EbpfConfig {
            filter: ProbeFilter::Sched,
            ..Default::default()
        };
        let probes = ProbeSet::attach(sim, &config, &EventFilter::from_config(&config));

        assert_eq!(probes.active().collect::<Vec<_>>(), vec![ProbeType::Sched]);
        assert_eq!(probes.statuses()[&ProbeType::Io], ProbeStatus::Disabled);
    }

    #[test]
    fn test_detach_all_and_drop_release_probes() {
        let sim = Arc::new(tracer());
        let config = EbpfConfig::default();
        let filter = EventFilter::from_config(&config);

        let mut probes = ProbeSet::attach(sim.clone(), &config, &filter);
        assert_eq!(sim.attached_count(), 4);
        probes.detach_all();
        probes.detach_all();
        assert_eq!(sim.attached_count(), 0);
        assert_eq!(probes.active_count(), 0);

        {
            let _probes = ProbeSet::attach(sim.clone(), &config, &filter);
            assert_eq!(sim.attached_count(), 4);
        }
        assert_eq!(sim.attached_count(), 0);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(ProbeStatus::Degraded {
            reason: "no BTF".to_string(),
        })
        .unwrap();
        assert_eq!(json["state"], "degraded");
        assert_eq!(json["reason"], "no BTF");
    }
}
