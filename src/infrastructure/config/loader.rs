use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use reqwest::Url;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::{Config, ControllerVersion, RunnerKind};

/// Project config file, created by the operator.
pub const PROJECT_CONFIG_PATH: &str = ".sluice/config.yaml";
/// Optional local overrides, never committed.
pub const LOCAL_CONFIG_PATH: &str = ".sluice/local.yaml";
/// Prefix for environment overrides. Nested keys are split on `__`.
pub const ENV_PREFIX: &str = "SLUICE_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid controller version '{0}': {1}")]
    InvalidControllerVersion(String, String),

    #[error("Invalid feature set selector: {0}")]
    InvalidSelector(String),

    #[error("Invalid polling_interval_ms: {0}. Must be positive")]
    InvalidPollingInterval(u64),

    #[error("Invalid action_timeout_ms: {0}. Must be positive")]
    InvalidActionTimeout(u64),

    #[error("Invalid catalog url '{0}'")]
    InvalidCatalogUrl(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("job_manager.command is required when the process runner is selected")]
    MissingJobCommand,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .sluice/config.yaml
    /// 3. .sluice/local.yaml (optional)
    /// 4. Environment variables (SLUICE_* prefix)
    pub fn load() -> Result<Config> {
        let config: Config = Self::layered(&[
            Path::new(PROJECT_CONFIG_PATH),
            Path::new(LOCAL_CONFIG_PATH),
        ])
        .extract()
        .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file. Environment overrides still
    /// apply on top of it.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file {} does not exist", path.display());
        }
        let config: Config = Self::layered(&[path])
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn layered(files: &[&Path]) -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        files
            .iter()
            .fold(figment, |figment, file| figment.merge(Yaml::file(file)))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let controller = &config.controller;
        ControllerVersion::parse(&controller.version).map_err(|e| {
            ConfigError::InvalidControllerVersion(controller.version.clone(), e)
        })?;

        for selector in &controller.feature_set_selectors {
            selector.validate().map_err(ConfigError::InvalidSelector)?;
        }

        if controller.polling_interval_ms == 0 {
            return Err(ConfigError::InvalidPollingInterval(0));
        }
        if controller.action_timeout_ms == 0 {
            return Err(ConfigError::InvalidActionTimeout(0));
        }

        if Url::parse(&config.catalog.url).is_err() {
            return Err(ConfigError::InvalidCatalogUrl(config.catalog.url.clone()));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(0));
        }

        if config.job_manager.runner == RunnerKind::Process
            && config.job_manager.command.trim().is_empty()
        {
            return Err(ConfigError::MissingJobCommand);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(
                config.logging.rotation.clone(),
            ));
        }

        Ok(())
    }
}
