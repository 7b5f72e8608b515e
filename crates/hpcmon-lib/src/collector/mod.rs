//! Event collection
//!
//! The drain loop moves records from probe buffers into the aggregator,
//! which keeps live per-process counters for the reporting side.

mod aggregator;
mod drain;

#[cfg(test)]
mod tests;

pub use aggregator::Aggregator;
pub use drain::{DrainConfig, DrainLoop, DrainStats, Sampler};
