//! Sluice - feature ingestion job controller
//!
//! Sluice keeps a fleet of streaming ingestion jobs in line with the feature
//! sets and stores declared in a catalog. Each tick it computes which jobs
//! should exist, starts, updates, upgrades or retires jobs to match, and
//! publishes feature-set specs to the jobs that serve them. Acks from the
//! jobs mark a feature set ready in the catalog once every serving job has
//! confirmed the current version.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, port traits and errors
//! - **Service Layer** (`services`): reconciliation, notification and delivery tracking
//! - **Adapters** (`adapters`): catalog, job runtime, persistence and operator API
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    Config, ControllerVersion, FeatureSet, FeatureSetRef, FeatureSetSpecAck, Job, JobStatus,
    Source, SpecUpdate, Store,
};
pub use domain::ports::{AckStream, Catalog, JobManager, JobRepository, SpecPublisher};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{DeliveryTracker, Reconciler, ReconcilerConfig, TickReport};
