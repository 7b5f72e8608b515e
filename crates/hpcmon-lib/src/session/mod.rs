//! Monitoring sessions
//!
//! A session is bounded by a wall-clock duration or an explicit
//! cancellation and always ends with a finalized [`MonitoringSession`].

mod controller;
mod live;
mod report;


pub use controller::{SessionBuilder, SessionCanceller, SessionError, SessionHandle};
pub use live::{LiveJob, LiveSnapshot};
pub use report::{
    syscall_breakdown, JobMetrics, JobReport, MonitoringSession, PerformanceAnalysis,
    SessionInfo, SessionSummary, SyscallCount, SystemInfo,
};
