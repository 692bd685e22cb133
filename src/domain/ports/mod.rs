//! Port trait definitions (Hexagonal Architecture)
//!
//! Async trait interfaces that adapters must implement:
//! - Catalog: feature-set and store definitions, readiness bookkeeping
//! - JobManager: physical job runtime
//! - JobRepository: job record persistence
//! - SpecPublisher / AckStream: notification channel

pub mod catalog;
pub mod job_manager;
pub mod job_repository;
pub mod spec_channel;

pub use catalog::{Catalog, FeatureSetFilter};
pub use job_manager::JobManager;
pub use job_repository::JobRepository;
pub use spec_channel::{AckStream, SpecPublisher};
