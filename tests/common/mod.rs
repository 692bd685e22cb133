//! Common test utilities for integration tests
//!
//! A controller wired to in-memory adapters and an in-memory SQLite job
//! repository, plus catalog builders.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sluice::adapters::memory::{InMemoryCatalog, InMemoryJobManager, InMemorySpecBus};
use sluice::adapters::sqlite::{create_migrated_test_pool, SqliteJobRepository};
use sluice::domain::models::{
    ControllerVersion, FeatureSet, FeatureSetRef, FeatureSetSelector, FeatureSetSpecAck, Job,
    JobStatus, Source, Store, StoreType, Subscription, ValueType,
};
use sluice::domain::ports::{Catalog, JobRepository};
use sluice::services::{
    AckOutcome, DeliveryTracker, DesiredStateConfig, KeyedLocks, Reconciler, ReconcilerConfig,
    SpecNotifier, TickReport,
};

pub const PROJECT: &str = "default";

pub struct Harness {
    pub catalog: Arc<InMemoryCatalog>,
    pub manager: Arc<InMemoryJobManager>,
    pub bus: Arc<InMemorySpecBus>,
    pub repository: Arc<SqliteJobRepository>,
    pub reconciler: Arc<Reconciler>,
    pub tracker: Arc<DeliveryTracker>,
}

impl Harness {
    /// Controller 1.0.0 allowed to deliver to `online`, which exists in the
    /// catalog and subscribes to every feature set of the default project.
    pub async fn new() -> Self {
        Self::with_options(ControllerVersion::new(1, 0, 0), &["online"]).await
    }

    pub async fn with_options(version: ControllerVersion, allowed_stores: &[&str]) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        let manager = Arc::new(InMemoryJobManager::new());
        let bus = Arc::new(InMemorySpecBus::default());
        let repository = Arc::new(SqliteJobRepository::new(
            create_migrated_test_pool()
                .await
                .expect("Failed to create test pool"),
        ));
        let locks = Arc::new(KeyedLocks::new());

        catalog.apply_store(store("online")).await;

        let config = ReconcilerConfig {
            controller_version: version,
            desired: DesiredStateConfig::new(
                vec![FeatureSetSelector::new(PROJECT, "*")],
                allowed_stores.iter().map(|s| (*s).to_string()),
                true,
            ),
            action_timeout: Duration::from_secs(2),
            aborted_job_retention: Duration::from_secs(3600),
        };
        let reconciler = Arc::new(Reconciler::new(
            catalog.clone(),
            manager.clone(),
            repository.clone(),
            SpecNotifier::new(catalog.clone(), bus.clone()),
            locks.clone(),
            config,
        ));
        let tracker = Arc::new(DeliveryTracker::new(
            catalog.clone(),
            repository.clone(),
            locks,
        ));

        Self {
            catalog,
            manager,
            bus,
            repository,
            reconciler,
            tracker,
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.reconciler
            .reconcile_once()
            .await
            .expect("Reconciliation tick failed")
    }

    pub async fn running(&self) -> Vec<Job> {
        self.repository
            .find_by_status(JobStatus::Running)
            .await
            .expect("Failed to list running jobs")
    }

    pub async fn job(&self, id: &str) -> Job {
        self.repository
            .find_by_id(id)
            .await
            .expect("Failed to load job")
            .expect("Job should exist")
    }

    pub async fn feature_set(&self, name: &str) -> FeatureSet {
        self.catalog
            .get_feature_set(&FeatureSetRef::new(PROJECT, name))
            .await
            .expect("Failed to load feature set")
            .expect("Feature set should exist")
    }

    pub async fn ack(&self, name: &str, version: u64, job_id: &str) -> AckOutcome {
        self.tracker
            .handle_ack(&FeatureSetSpecAck::new(
                format!("{PROJECT}/{name}"),
                version,
                job_id,
            ))
            .await
            .expect("Ack handling failed")
    }
}

/// Store subscribed to every feature set in the default project.
pub fn store(name: &str) -> Store {
    Store::new(name, StoreType::Redis).with_subscription(Subscription::new(PROJECT, "*"))
}

pub fn source(topic: &str) -> Source {
    Source::kafka("kafka:9092", topic)
}

pub fn feature_set(name: &str, topic: &str) -> FeatureSet {
    FeatureSet::new(PROJECT, name, source(topic))
        .with_entity("driver_id", ValueType::Int64)
        .with_feature("trips_today", ValueType::Int64)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
