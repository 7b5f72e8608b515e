//! hpcmon daemon internals, exposed for integration tests

pub mod api;
pub mod config;
