use serde::{Deserialize, Serialize};

use super::selector::FeatureSetSelector;

/// Main configuration structure for sluice
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Reconciliation settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Catalog service connection
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Job record storage
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Physical job runtime
    #[serde(default)]
    pub job_manager: JobManagerConfig,

    /// Operator HTTP API
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ControllerConfig {
    /// Semantic version stamped on every job this controller launches
    #[serde(default = "default_controller_version")]
    pub version: String,

    /// Delay between reconciliation ticks
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Upper bound for a single job manager or repository call
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    /// Run one job per source instead of one per feature set
    #[serde(default = "default_true")]
    pub consolidate_jobs_per_source: bool,

    /// Feature sets the controller manages
    #[serde(default)]
    pub feature_set_selectors: Vec<FeatureSetSelector>,

    /// Stores the controller delivers to
    #[serde(default)]
    pub whitelisted_stores: Vec<String>,

    /// How long aborted job records are kept for inspection
    #[serde(default = "default_aborted_job_retention_secs")]
    pub aborted_job_retention_secs: u64,
}

fn default_controller_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

const fn default_polling_interval_ms() -> u64 {
    1000
}

const fn default_action_timeout_ms() -> u64 {
    5000
}

const fn default_true() -> bool {
    true
}

const fn default_aborted_job_retention_secs() -> u64 {
    86_400
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            version: default_controller_version(),
            polling_interval_ms: default_polling_interval_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            consolidate_jobs_per_source: default_true(),
            feature_set_selectors: vec![],
            whitelisted_stores: vec![],
            aborted_job_retention_secs: default_aborted_job_retention_secs(),
        }
    }
}

/// Catalog service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CatalogConfig {
    /// Base URL of the catalog REST API
    #[serde(default = "default_catalog_url")]
    pub url: String,

    /// Per-request timeout
    #[serde(default = "default_catalog_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_catalog_url() -> String {
    "http://localhost:6565".to_string()
}

const fn default_catalog_timeout_ms() -> u64 {
    3000
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            timeout_ms: default_catalog_timeout_ms(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".sluice/sluice.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Which job runtime backs the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// One local child process per job
    Process,
    /// Bookkeeping only; nothing is executed
    InMemory,
}

/// Job manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JobManagerConfig {
    #[serde(default = "default_runner")]
    pub runner: RunnerKind,

    /// Ingestion command launched per job (process runner)
    #[serde(default)]
    pub command: String,

    /// Extra arguments for the ingestion command
    #[serde(default)]
    pub args: Vec<String>,

    /// Directory holding one descriptor file per launched job
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
}

const fn default_runner() -> RunnerKind {
    RunnerKind::InMemory
}

fn default_work_dir() -> String {
    ".sluice/jobs".to_string()
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            command: String::new(),
            args: vec![],
            work_dir: default_work_dir(),
        }
    }
}

/// Operator API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default)]
    pub enable_cors: bool,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_api_port() -> u16 {
    6570
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            enable_cors: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
