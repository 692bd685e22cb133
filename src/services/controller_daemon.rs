//! Controller background daemon.
//!
//! Drives the reconciler on a fixed interval. Ticks never overlap: the next
//! one is scheduled after the previous finished. Failures are recorded and
//! the loop keeps going.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::services::reconciler::{Reconciler, TickReport};

/// Configuration for the controller daemon.
#[derive(Debug, Clone)]
pub struct ControllerDaemonConfig {
    /// Delay between reconciliation ticks.
    pub polling_interval: Duration,
}

impl Default for ControllerDaemonConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
        }
    }
}

impl ControllerDaemonConfig {
    pub fn with_interval(polling_interval: Duration) -> Self {
        Self { polling_interval }
    }
}

/// Event emitted by the controller daemon.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    Started,
    TickCompleted { tick: u64, report: TickReport },
    TickFailed { tick: u64, error: String },
    Stopped,
}

/// Snapshot of the daemon's progress.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub total_ticks: u64,
    pub failed_ticks: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_tick_duration_ms: Option<u64>,
    pub jobs_started: u64,
    pub jobs_upgraded: u64,
    pub jobs_updated: u64,
    pub jobs_retired: u64,
    pub specs_published: u64,
    pub action_failures: u64,
}

impl DaemonStatus {
    fn record_report(&mut self, report: &TickReport) {
        self.consecutive_failures = 0;
        self.jobs_started += report.started.len() as u64;
        self.jobs_upgraded += report.upgraded.len() as u64;
        self.jobs_updated += report.updated.len() as u64;
        self.jobs_retired += report.retired.len() as u64;
        self.specs_published += report.notified.len() as u64;
        self.action_failures += report.failures.len() as u64;
        self.last_error = report.failures.last().map(|f| f.error.clone());
        self.last_tick_duration_ms = Some(report.duration_ms);
    }

    fn record_failure(&mut self, error: String) {
        self.failed_ticks += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error);
    }
}

/// Handle to control the controller daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    stop_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
    status: Arc<RwLock<DaemonStatus>>,
}

impl DaemonHandle {
    /// Request the daemon to stop after the current tick.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> DaemonStatus {
        self.status.read().await.clone()
    }
}

pub struct ControllerDaemon {
    reconciler: Arc<Reconciler>,
    config: ControllerDaemonConfig,
    status: Arc<RwLock<DaemonStatus>>,
    stop_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ControllerDaemon {
    pub fn new(reconciler: Arc<Reconciler>, config: ControllerDaemonConfig) -> Self {
        Self {
            reconciler,
            config,
            status: Arc::new(RwLock::new(DaemonStatus::default())),
            stop_flag: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            stop_flag: self.stop_flag.clone(),
            wake: self.wake.clone(),
            status: self.status.clone(),
        }
    }

    /// Spawn the daemon, returning a channel for events.
    pub fn run(self) -> mpsc::Receiver<ControllerEvent> {
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            self.run_loop(tx).await;
        });
        rx
    }

    async fn run_loop(self, tx: mpsc::Sender<ControllerEvent>) {
        self.status.write().await.running = true;
        let _ = tx.send(ControllerEvent::Started).await;
        info!(
            interval_ms = self.config.polling_interval.as_millis() as u64,
            version = %self.reconciler.controller_version(),
            "controller daemon started"
        );

        let mut timer = interval(self.config.polling_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = self.wake.notified() => {}
            }
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
            self.run_tick(&tx).await;
        }

        self.status.write().await.running = false;
        let _ = tx.send(ControllerEvent::Stopped).await;
        info!("controller daemon stopped");
    }

    async fn run_tick(&self, tx: &mpsc::Sender<ControllerEvent>) {
        let tick = {
            let mut status = self.status.write().await;
            status.total_ticks += 1;
            status.total_ticks
        };

        let started = Instant::now();
        let result = self.reconciler.reconcile_once().await;

        let mut status = self.status.write().await;
        status.last_tick_at = Some(Utc::now());
        match result {
            Ok(report) => {
                status.record_report(&report);
                drop(status);
                let _ = tx.send(ControllerEvent::TickCompleted { tick, report }).await;
            }
            Err(e) => {
                let message = e.to_string();
                status.record_failure(message.clone());
                status.last_tick_duration_ms = Some(started.elapsed().as_millis() as u64);
                let consecutive = status.consecutive_failures;
                drop(status);
                error!(tick, consecutive_failures = consecutive, error = %message, "reconciliation tick failed");
                let _ = tx.send(ControllerEvent::TickFailed { tick, error: message }).await;
            }
        }
    }

    /// Run a single tick outside the loop.
    pub async fn run_once(&self) {
        let (tx, _rx) = mpsc::channel(4);
        self.run_tick(&tx).await;
    }

    pub async fn status(&self) -> DaemonStatus {
        self.status.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryCatalog, InMemoryJobManager, InMemorySpecBus};
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteJobRepository};
    use crate::domain::models::{
        ControllerVersion, FeatureSet, FeatureSetSelector, Source, Store, StoreType, Subscription,
    };
    use crate::services::desired_state::DesiredStateConfig;
    use crate::services::key_locks::KeyedLocks;
    use crate::services::reconciler::ReconcilerConfig;
    use crate::services::spec_notifier::SpecNotifier;

    async fn daemon(interval_ms: u64) -> (ControllerDaemon, Arc<InMemoryCatalog>) {
        let catalog = Arc::new(InMemoryCatalog::new());
        let bus = Arc::new(InMemorySpecBus::default());
        let repository = Arc::new(SqliteJobRepository::new(
            create_migrated_test_pool().await.unwrap(),
        ));
        catalog
            .apply_store(
                Store::new("online", StoreType::Redis)
                    .with_subscription(Subscription::new("*", "*")),
            )
            .await;

        let reconciler = Reconciler::new(
            catalog.clone(),
            Arc::new(InMemoryJobManager::new()),
            repository,
            SpecNotifier::new(catalog.clone(), bus),
            Arc::new(KeyedLocks::new()),
            ReconcilerConfig {
                controller_version: ControllerVersion::new(1, 0, 0),
                desired: DesiredStateConfig::new(
                    vec![FeatureSetSelector::new("default", "*")],
                    ["online".to_string()],
                    true,
                ),
                action_timeout: Duration::from_secs(1),
                aborted_job_retention: Duration::from_secs(60),
            },
        );
        (
            ControllerDaemon::new(
                Arc::new(reconciler),
                ControllerDaemonConfig::with_interval(Duration::from_millis(interval_ms)),
            ),
            catalog,
        )
    }

    #[test]
    fn test_config_default() {
        let config = ControllerDaemonConfig::default();
        assert_eq!(config.polling_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_once_updates_status() {
        let (daemon, catalog) = daemon(1000).await;
        catalog
            .apply_feature_set(FeatureSet::new(
                "default",
                "test",
                Source::kafka("localhost:9092", "events"),
            ))
            .await;

        daemon.run_once().await;
        let status = daemon.status().await;
        assert_eq!(status.total_ticks, 1);
        assert_eq!(status.failed_ticks, 0);
        assert_eq!(status.jobs_started, 1);
        assert_eq!(status.specs_published, 1);
        assert!(status.last_tick_at.is_some());
    }

    #[tokio::test]
    async fn test_loop_emits_events_and_stops() {
        let (daemon, _catalog) = daemon(10).await;
        let handle = daemon.handle();
        let mut events = daemon.run();

        assert!(matches!(events.recv().await, Some(ControllerEvent::Started)));
        assert!(matches!(
            events.recv().await,
            Some(ControllerEvent::TickCompleted { tick: 1, .. })
        ));
        assert!(handle.status().await.running);

        handle.stop();
        assert!(handle.is_stop_requested());
        loop {
            match events.recv().await {
                Some(ControllerEvent::Stopped) | None => break,
                Some(_) => continue,
            }
        }
        assert!(!handle.status().await.running);
    }

    #[test]
    fn test_failure_accounting() {
        let mut status = DaemonStatus::default();
        status.record_failure("catalog down".to_string());
        status.record_failure("catalog down".to_string());
        assert_eq!(status.failed_ticks, 2);
        assert_eq!(status.consecutive_failures, 2);

        status.record_report(&TickReport::default());
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
    }
}
