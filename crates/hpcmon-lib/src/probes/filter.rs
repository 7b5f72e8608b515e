//! User-space event filtering
//!
//! Drops events from excluded PIDs or command-name prefixes and, for syscall
//! events, anything outside the configured allow-list. Backends may filter
//! the allow-list in the kernel already; applying it again here keeps
//! backends that cannot do so honest.

use std::collections::{BTreeSet, HashSet};
use tracing::warn;

use super::syscalls;
use crate::config::EbpfConfig;
use crate::models::Event;

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    excluded_pids: HashSet<u32>,
    excluded_prefixes: Vec<String>,
    allowed_syscalls: Option<BTreeSet<u32>>,
}

impl EventFilter {
    pub fn from_config(config: &EbpfConfig) -> Self {
        Self {
            excluded_pids: config.excluded_pids.iter().copied().collect(),
            excluded_prefixes: config.excluded_processes.clone(),
            allowed_syscalls: resolve_allow_list(&config.monitored_syscalls),
        }
    }

    pub fn allowed_syscalls(&self) -> Option<&BTreeSet<u32>> {
        self.allowed_syscalls.as_ref()
    }

    /// Whether `event` should reach the aggregator. `comm` is the command
    /// name if the record carried one.
    pub fn admits(&self, event: &Event, comm: Option<&str>) -> bool {
        if self.excluded_pids.contains(&event.pid) || self.excluded_pids.contains(&event.tgid) {
            return false;
        }
        if let Some(comm) = comm {
            if self.excluded_prefixes.iter().any(|p| comm.starts_with(p.as_str())) {
                return false;
            }
        }
        match (event.syscall_id(), &self.allowed_syscalls) {
            (Some(id), Some(allowed)) => allowed.contains(&id),
            _ => true,
        }
    }
}

/// Names to syscall numbers; an empty list means no restriction
fn resolve_allow_list(names: &[String]) -> Option<BTreeSet<u32>> {
    if names.is_empty() {
        return None;
    }
    let ids = names
        .iter()
        .filter_map(|name| {
            let id = syscalls::id_of(name);
            if id.is_none() {
                warn!(syscall = %name, "Ignoring unknown syscall in monitored_syscalls");
            }
            id
        })
        .collect();
    Some(ids)
}
