//! CLI command implementations.

pub mod config;
pub mod jobs;
pub mod serve;
