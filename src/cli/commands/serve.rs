//! `sluice serve`: run the controller.
//!
//! Wires the adapters selected by configuration into the reconciler, the
//! ack consumer and the operator API, then runs until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::adapters::http::{ApiState, JobsHttpServer};
use crate::adapters::memory::{InMemoryJobManager, InMemorySpecBus, SpecBusConfig};
use crate::adapters::sqlite::{database_url, initialize_database, PoolConfig, SqliteJobRepository};
use crate::adapters::{HttpCatalogClient, ProcessJobManager, ProcessJobManagerConfig};
use crate::cli::commands::config::load_config;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, RunnerKind};
use crate::domain::ports::{Catalog, JobManager, JobRepository};
use crate::infrastructure::logging::LoggerImpl;
use crate::services::{
    AckConsumer, ControllerDaemon, ControllerDaemonConfig, ControllerEvent, DeliveryTracker,
    KeyedLocks, Reconciler, ReconcilerConfig, SpecNotifier, TickReport,
};

/// How long shutdown waits for the daemon to finish its current tick.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Load configuration from this file instead of .sluice/
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run a single reconciliation tick, print its report and exit
    #[arg(long)]
    pub once: bool,
}

/// Everything `serve` runs, built from one configuration.
pub struct Controller {
    pub reconciler: Arc<Reconciler>,
    pub tracker: Arc<DeliveryTracker>,
    pub repository: Arc<dyn JobRepository>,
    pub bus: Arc<InMemorySpecBus>,
    pub daemon: ControllerDaemon,
}

impl Controller {
    pub async fn build(config: &Config) -> Result<Self> {
        let pool = initialize_database(
            &database_url(&config.database.path),
            Some(PoolConfig {
                max_connections: config.database.max_connections,
                ..PoolConfig::default()
            }),
        )
        .await
        .context("Failed to initialize database")?;
        let repository: Arc<dyn JobRepository> = Arc::new(SqliteJobRepository::new(pool));

        let catalog: Arc<dyn Catalog> = Arc::new(
            HttpCatalogClient::new(&config.catalog).context("Failed to create catalog client")?,
        );
        let job_manager = job_manager(config)?;

        let bus = Arc::new(InMemorySpecBus::new(SpecBusConfig::default()));
        let locks = Arc::new(KeyedLocks::new());
        let reconciler = Arc::new(Reconciler::new(
            catalog.clone(),
            job_manager,
            repository.clone(),
            SpecNotifier::new(catalog.clone(), bus.clone()),
            locks.clone(),
            ReconcilerConfig::from_controller_config(&config.controller)
                .context("Invalid controller configuration")?,
        ));
        let tracker = Arc::new(DeliveryTracker::new(catalog, repository.clone(), locks));
        let daemon = ControllerDaemon::new(
            reconciler.clone(),
            ControllerDaemonConfig::with_interval(Duration::from_millis(
                config.controller.polling_interval_ms,
            )),
        );

        Ok(Self {
            reconciler,
            tracker,
            repository,
            bus,
            daemon,
        })
    }
}

fn job_manager(config: &Config) -> Result<Arc<dyn JobManager>> {
    let manager: Arc<dyn JobManager> = match config.job_manager.runner {
        RunnerKind::Process => Arc::new(
            ProcessJobManager::new(ProcessJobManagerConfig::from_config(&config.job_manager))
                .context("Failed to create process job manager")?,
        ),
        RunnerKind::InMemory => {
            warn!("in-memory runner selected: jobs are tracked but nothing is executed");
            Arc::new(InMemoryJobManager::new())
        }
    };
    Ok(manager)
}

#[derive(Debug, serde::Serialize)]
struct TickOutput {
    report: TickReport,
}

impl CommandOutput for TickOutput {
    fn to_human(&self) -> String {
        let r = &self.report;
        let mut lines = vec![format!(
            "Tick finished in {}ms: {} started, {} upgraded, {} updated, {} retired, {} published",
            r.duration_ms,
            r.started.len(),
            r.upgraded.len(),
            r.updated.len(),
            r.retired.len(),
            r.notified.len(),
        )];
        for failure in &r.failures {
            lines.push(format!(
                "  failed {:?} {}: {}",
                failure.action, failure.target, failure.error
            ));
        }
        lines.join("\n")
    }
}

pub async fn execute(args: ServeArgs, json_mode: bool) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let _logger = LoggerImpl::init(&config.logging)?;
    let controller = Controller::build(&config).await?;

    if args.once {
        let report = controller
            .reconciler
            .reconcile_once()
            .await
            .context("Reconciliation tick failed")?;
        output(&TickOutput { report }, json_mode);
        return Ok(());
    }

    run(controller, &config).await
}

async fn run(controller: Controller, config: &Config) -> Result<()> {
    let Controller {
        reconciler,
        tracker,
        repository,
        bus,
        daemon,
    } = controller;

    let handle = daemon.handle();
    let events = daemon.run();
    let event_task = tokio::spawn(log_events(events));

    let ack_consumer = AckConsumer::new(bus.clone(), tracker.clone());
    let ack_stop = ack_consumer.stop_flag();
    let ack_task = ack_consumer.spawn();

    let server = JobsHttpServer::new(
        config.api.clone(),
        ApiState {
            repository,
            reconciler,
            tracker,
            daemon: Some(handle.clone()),
            spec_feed: Some(bus),
        },
    );
    let served = server
        .serve_with_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Operator API failed: {e}"));

    info!("shutting down");
    handle.stop();
    ack_stop.store(true, Ordering::Release);
    ack_task.abort();
    if tokio::time::timeout(SHUTDOWN_GRACE, event_task).await.is_err() {
        warn!("controller daemon did not stop within the grace period");
    }

    served
}

async fn log_events(mut events: mpsc::Receiver<ControllerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ControllerEvent::TickCompleted { tick, report } if report.changed() => info!(
                tick,
                started = report.started.len(),
                upgraded = report.upgraded.len(),
                updated = report.updated.len(),
                retired = report.retired.len(),
                published = report.notified.len(),
                failures = report.failures.len(),
                duration_ms = report.duration_ms,
                "reconciliation tick applied changes"
            ),
            ControllerEvent::TickCompleted { tick, report } => {
                debug!(tick, duration_ms = report.duration_ms, "reconciliation tick idle");
            }
            ControllerEvent::TickFailed { tick, error } => {
                error!(tick, error = %error, "reconciliation tick failed");
            }
            ControllerEvent::Started | ControllerEvent::Stopped => {}
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
