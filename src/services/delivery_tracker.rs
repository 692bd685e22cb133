//! Delivery tracker.
//!
//! Applies acknowledgements from running jobs. The catalog version of the
//! feature set is the ordering authority: only an ack for exactly the
//! current version can mark a feature set ready, so duplicated or
//! reordered acks never regress state.

use backoff::ExponentialBackoffBuilder;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{DeliveryState, FeatureSetRef, FeatureSetSpecAck, FeatureSetStatus, Job};
use crate::domain::ports::{Catalog, JobRepository};
use crate::services::key_locks::KeyedLocks;

/// How an acknowledgement was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// Job delivery recorded and feature set marked ready.
    Applied,
    /// Already applied; nothing changed.
    Duplicate,
    /// Version older than the current one.
    Stale,
    /// Version newer than anything published.
    Anomalous,
    /// The acking job is gone, not running, or does not serve the feature set.
    Orphaned,
    /// Malformed reference or unknown feature set.
    Discarded,
}

impl AckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Stale => "stale",
            Self::Anomalous => "anomalous",
            Self::Orphaned => "orphaned",
            Self::Discarded => "discarded",
        }
    }
}

/// Snapshot of tracker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub received: u64,
    pub applied: u64,
    pub duplicate: u64,
    pub stale: u64,
    pub anomalous: u64,
    pub orphaned: u64,
    pub discarded: u64,
    /// Acks whose handling failed on infrastructure errors.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    applied: AtomicU64,
    duplicate: AtomicU64,
    stale: AtomicU64,
    anomalous: AtomicU64,
    orphaned: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: AckOutcome) {
        let counter = match outcome {
            AckOutcome::Applied => &self.applied,
            AckOutcome::Duplicate => &self.duplicate,
            AckOutcome::Stale => &self.stale,
            AckOutcome::Anomalous => &self.anomalous,
            AckOutcome::Orphaned => &self.orphaned,
            AckOutcome::Discarded => &self.discarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Retry budget for optimistic job updates.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub initial_retry_interval: Duration,
    pub max_retry_elapsed: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            initial_retry_interval: Duration::from_millis(10),
            max_retry_elapsed: Duration::from_secs(2),
        }
    }
}

pub struct DeliveryTracker {
    catalog: Arc<dyn Catalog>,
    repository: Arc<dyn JobRepository>,
    locks: Arc<KeyedLocks>,
    config: TrackerConfig,
    counters: Counters,
}

impl DeliveryTracker {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        repository: Arc<dyn JobRepository>,
        locks: Arc<KeyedLocks>,
    ) -> Self {
        Self::with_config(catalog, repository, locks, TrackerConfig::default())
    }

    pub fn with_config(
        catalog: Arc<dyn Catalog>,
        repository: Arc<dyn JobRepository>,
        locks: Arc<KeyedLocks>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            catalog,
            repository,
            locks,
            config,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> TrackerStats {
        let c = &self.counters;
        TrackerStats {
            received: c.received.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            duplicate: c.duplicate.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            anomalous: c.anomalous.load(Ordering::Relaxed),
            orphaned: c.orphaned.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Handle one acknowledgement.
    ///
    /// Errors are infrastructure failures; protocol problems are reported
    /// through the returned outcome.
    pub async fn handle_ack(&self, ack: &FeatureSetSpecAck) -> DomainResult<AckOutcome> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match self.apply(ack).await {
            Ok(outcome) => {
                self.counters.record(outcome);
                Ok(outcome)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    async fn apply(&self, ack: &FeatureSetSpecAck) -> DomainResult<AckOutcome> {
        let reference = match FeatureSetRef::parse(&ack.feature_set_reference) {
            Ok(reference) => reference,
            Err(e) => {
                debug!(job_id = %ack.job_id, error = %e, "discarding ack with malformed reference");
                return Ok(AckOutcome::Discarded);
            }
        };

        let _feature_set_guard = self.locks.lock_feature_set(&reference.to_string()).await;

        let Some(feature_set) = self.catalog.get_feature_set(&reference).await? else {
            debug!(feature_set = %reference, "discarding ack for unknown feature set");
            return Ok(AckOutcome::Discarded);
        };

        let acked = ack.feature_set_version;
        let current = feature_set.version();
        if acked < current {
            debug!(feature_set = %reference, acked, current, job_id = %ack.job_id, "stale ack");
            return Ok(AckOutcome::Stale);
        }
        if acked > current {
            warn!(
                feature_set = %reference,
                acked,
                current,
                job_id = %ack.job_id,
                "ack for a version that was never published"
            );
            return Ok(AckOutcome::Anomalous);
        }

        let _job_guard = self.locks.lock_job(&ack.job_id).await;

        let Some(job) = self.repository.find_by_id(&ack.job_id).await? else {
            debug!(feature_set = %reference, job_id = %ack.job_id, "ack from unknown job");
            return Ok(AckOutcome::Orphaned);
        };
        if !serves(&job, &reference) {
            debug!(feature_set = %reference, job_id = %job.id, status = job.status.as_str(), "ack from job not serving feature set");
            return Ok(AckOutcome::Orphaned);
        }

        let already_delivered = job.delivery_statuses.get(&reference).is_some_and(|entry| {
            entry.delivered_version == acked && entry.status == DeliveryState::Delivered
        });
        if already_delivered && feature_set.status() == FeatureSetStatus::Ready {
            return Ok(AckOutcome::Duplicate);
        }

        if !already_delivered && !self.record_delivery(job, &reference, acked).await? {
            return Ok(AckOutcome::Orphaned);
        }

        match self
            .catalog
            .update_feature_set_status(&reference, acked, FeatureSetStatus::Ready)
            .await
        {
            Ok(()) => {}
            Err(DomainError::ConcurrencyConflict { .. }) => {
                debug!(feature_set = %reference, acked, "feature set moved on while applying ack");
                return Ok(AckOutcome::Stale);
            }
            Err(err) => return Err(err),
        }

        info!(feature_set = %reference, version = acked, job_id = %ack.job_id, "feature set ready");
        Ok(AckOutcome::Applied)
    }

    /// Persist the delivery on the job, reloading on optimistic conflicts.
    /// Returns `false` when the job stopped serving the feature set meanwhile.
    async fn record_delivery(
        &self,
        job: Job,
        reference: &FeatureSetRef,
        version: u64,
    ) -> DomainResult<bool> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_retry_interval)
            .with_max_elapsed_time(Some(self.config.max_retry_elapsed))
            .build();

        let job_id = job.id.clone();
        let initial = std::sync::Mutex::new(Some(job));
        let repository = &self.repository;

        backoff::future::retry(policy, || async {
            // The caller's copy is used first; retries reload the record.
            let cached = initial.lock().ok().and_then(|mut slot| slot.take());
            let job = match cached {
                Some(job) => Some(job),
                None => repository
                    .find_by_id(&job_id)
                    .await
                    .map_err(backoff::Error::permanent)?,
            };
            let Some(mut job) = job else {
                return Ok(false);
            };
            if !serves(&job, reference) {
                return Ok(false);
            }
            job.record_delivery(reference, version);
            match repository.update(&job).await {
                Ok(_) => Ok(true),
                Err(err @ DomainError::ConcurrencyConflict { .. }) => {
                    debug!(job_id = %job_id, "job changed while recording delivery, retrying");
                    Err(backoff::Error::transient(err))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        })
        .await
    }
}

fn serves(job: &Job, reference: &FeatureSetRef) -> bool {
    job.is_running() && job.feature_sets.contains(reference)
}
