//! HPC job efficiency monitor
//!
//! This crate provides the core functionality for:
//! - Kernel event capture through pluggable tracer backends
//! - Loss-aware draining and per-process aggregation
//! - Job resolution through Slurm with a local process fallback
//! - Deterministic job classification and efficiency scoring
//! - Session lifecycle, health checks and structured logging

pub mod classifier;
pub mod collector;
pub mod config;
pub mod health;
pub mod models;
pub mod observability;
pub mod probes;
pub mod resolver;
pub mod session;

#[cfg(test)]
mod test_support;

pub use classifier::{Classifier, ClassifierInput};
pub use config::MonitorConfig;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::StructuredLogger;
pub use resolver::{JobResolver, MonitorTarget};
pub use session::{LiveSnapshot, MonitoringSession, SessionBuilder, SessionError, SessionHandle};
