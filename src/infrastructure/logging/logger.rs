use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::domain::models::LoggingConfig;

const LOG_FILE_NAME: &str = "sluice.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Stdout output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => anyhow::bail!("Invalid log format: {format}"),
        }
    }
}

/// How often the log file rolls over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPolicy {
    Daily,
    Hourly,
    Never,
}

impl RotationPolicy {
    pub fn parse(rotation: &str) -> Result<Self> {
        match rotation.to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "hourly" => Ok(Self::Hourly),
            "never" => Ok(Self::Never),
            _ => anyhow::bail!("Invalid log rotation: {rotation}"),
        }
    }
}

/// Logger implementation using tracing
///
/// Holds the appender guard; dropping it flushes and closes the log file.
pub struct LoggerImpl {
    _guard: Option<WorkerGuard>,
}

impl LoggerImpl {
    /// Install the global subscriber.
    ///
    /// `RUST_LOG` directives take precedence over the configured level. When
    /// `log_dir` is set, a JSON file layer is added next to stdout.
    ///
    /// # Errors
    /// Returns an error for unknown level, format or rotation values, or when
    /// a global subscriber is already installed.
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let level = parse_log_level(&config.level)?;
        let format = LogFormat::parse(&config.format)?;
        let filter = || {
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy()
        };

        let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
        let mut guard = None;

        if let Some(ref log_dir) = config.log_dir {
            let rotation = RotationPolicy::parse(&config.rotation)?;
            let (writer, file_guard) = tracing_appender::non_blocking(file_appender(log_dir, rotation));
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_filter(filter())
                    .boxed(),
            );
            guard = Some(file_guard);
        }

        layers.push(match format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stdout)
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true)
                .with_filter(filter())
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(io::stdout)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_filter(filter())
                .boxed(),
        });

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context("Failed to install tracing subscriber")?;

        tracing::info!(
            level = %config.level,
            format = ?format,
            file_output = config.log_dir.is_some(),
            "logger initialized"
        );

        Ok(Self { _guard: guard })
    }
}

fn file_appender(log_dir: &str, rotation: RotationPolicy) -> rolling::RollingFileAppender {
    let dir = Path::new(log_dir);
    match rotation {
        RotationPolicy::Daily => rolling::daily(dir, LOG_FILE_NAME),
        RotationPolicy::Hourly => rolling::hourly(dir, LOG_FILE_NAME),
        RotationPolicy::Never => rolling::never(dir, LOG_FILE_NAME),
    }
}

/// Parse log level string to Level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("Invalid log level: {level}"),
    }
}
