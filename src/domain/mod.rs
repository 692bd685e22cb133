//! Domain layer for the sluice job controller
//!
//! Models, port traits and errors. Nothing in here performs I/O.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
