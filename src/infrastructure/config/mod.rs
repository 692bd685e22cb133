//! Configuration management infrastructure
//!
//! Hierarchical configuration using figment:
//! - defaults, then `.sluice/config.yaml`, then `.sluice/local.yaml`
//! - `SLUICE_*` environment overrides
//! - validation of the merged result

pub mod loader;

pub use loader::{ConfigError, ConfigLoader, ENV_PREFIX, LOCAL_CONFIG_PATH, PROJECT_CONFIG_PATH};
