//! In-process adapters used for local runs and tests.

pub mod catalog;
pub mod job_manager;
pub mod spec_bus;

pub use catalog::InMemoryCatalog;
pub use job_manager::{InMemoryJobManager, RuntimeCalls, IN_MEMORY_RUNNER};
pub use spec_bus::{InMemorySpecBus, SpecBusConfig};
