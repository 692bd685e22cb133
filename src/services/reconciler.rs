//! Reconciler: the controller's control loop body.
//!
//! One call to [`Reconciler::reconcile_once`] is one tick. It reads the
//! catalog, computes the desired jobs, compares them with the job records
//! and issues start / upgrade / update / retire actions. Every action runs
//! under its job lock and a timeout, and fails on its own: a broken job
//! never blocks the others. The loop is level-triggered, so anything left
//! undone is retried on the next tick.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ControllerConfig, ControllerVersion, DeliveryState, FeatureSet, FeatureSetRef, Job, JobStatus,
    VERSION_LABEL,
};
use crate::domain::ports::{Catalog, FeatureSetFilter, JobManager, JobRepository};
use crate::services::desired_state::{compute_desired, CatalogSnapshot, DesiredJob, DesiredStateConfig};
use crate::services::key_locks::KeyedLocks;
use crate::services::spec_notifier::SpecNotifier;
use crate::services::version_codec;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub controller_version: ControllerVersion,
    pub desired: DesiredStateConfig,
    /// Upper bound for a single job manager, repository or catalog call.
    pub action_timeout: Duration,
    /// Aborted records older than this are deleted.
    pub aborted_job_retention: Duration,
}

impl ReconcilerConfig {
    pub fn from_controller_config(config: &ControllerConfig) -> DomainResult<Self> {
        let controller_version = ControllerVersion::parse(&config.version)
            .map_err(DomainError::ValidationFailed)?;
        for selector in &config.feature_set_selectors {
            selector.validate().map_err(DomainError::ValidationFailed)?;
        }

        Ok(Self {
            controller_version,
            desired: DesiredStateConfig::new(
                config.feature_set_selectors.clone(),
                config.whitelisted_stores.iter().cloned(),
                config.consolidate_jobs_per_source,
            ),
            action_timeout: Duration::from_millis(config.action_timeout_ms),
            aborted_job_retention: Duration::from_secs(config.aborted_job_retention_secs),
        })
    }
}

/// Kind of corrective action, used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Snapshot,
    Finalize,
    Reap,
    Start,
    Upgrade,
    Update,
    Retire,
    AbortOrphan,
    Notify,
    Prune,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionFailure {
    pub action: ActionKind,
    pub target: String,
    pub error: String,
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Ids of newly launched jobs, replacements included.
    pub started: Vec<String>,
    /// Ids of jobs replaced by a new launch.
    pub upgraded: Vec<String>,
    /// Ids of jobs updated in place.
    pub updated: Vec<String>,
    /// Ids of jobs asked to stop because nothing needs them.
    pub retired: Vec<String>,
    /// Ids of aborting jobs confirmed stopped.
    pub finalized: Vec<String>,
    /// Ids of running jobs found stopped in the runtime.
    pub reaped: Vec<String>,
    /// Runtime jobs without a record that were aborted.
    pub orphans_aborted: Vec<String>,
    /// `project/name@version` of every spec sent.
    pub notified: Vec<String>,
    pub pruned: usize,
    pub failures: Vec<ActionFailure>,
    /// Set when a repository failure stopped the remaining actions.
    pub halted: bool,
    pub duration_ms: u64,
}

impl TickReport {
    /// Whether the tick changed anything.
    pub fn changed(&self) -> bool {
        !(self.started.is_empty()
            && self.upgraded.is_empty()
            && self.updated.is_empty()
            && self.retired.is_empty()
            && self.finalized.is_empty()
            && self.reaped.is_empty()
            && self.orphans_aborted.is_empty()
            && self.notified.is_empty()
            && self.pruned == 0)
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, action: ActionKind, target: impl Into<String>, err: DomainError) {
        let target = target.into();
        warn!(action = ?action, target = %target, error = %err, "reconcile action failed");
        if matches!(err, DomainError::DatabaseError(_)) {
            self.halted = true;
        }
        self.failures.push(ActionFailure {
            action,
            target,
            error: err.to_string(),
        });
    }
}

/// What to do with a running job that is still desired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPlan {
    Keep,
    /// Stores grew or feature-set membership changed.
    UpdateInPlace,
    Replace(&'static str),
}

/// Decide how a running job relates to its desired counterpart.
pub fn plan_job(
    job: &Job,
    desired: &DesiredJob,
    current_version: &ControllerVersion,
    restart_requested: bool,
) -> JobPlan {
    if restart_requested {
        return JobPlan::Replace("restart requested");
    }
    if !version_codec::is_current(job, current_version) {
        return JobPlan::Replace("controller version changed");
    }
    if !job.source.same_as(&desired.source) {
        return JobPlan::Replace("source changed");
    }
    if job.stores.keys().any(|name| !desired.stores.contains_key(name)) {
        return JobPlan::Replace("stores removed");
    }
    if job.stores != desired.stores || job.feature_sets != desired.feature_sets {
        return JobPlan::UpdateInPlace;
    }
    JobPlan::Keep
}

pub struct Reconciler {
    catalog: Arc<dyn Catalog>,
    job_manager: Arc<dyn JobManager>,
    repository: Arc<dyn JobRepository>,
    notifier: SpecNotifier,
    locks: Arc<KeyedLocks>,
    config: ReconcilerConfig,
    restart_requests: Mutex<HashSet<String>>,
    last_launch_millis: AtomicI64,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        job_manager: Arc<dyn JobManager>,
        repository: Arc<dyn JobRepository>,
        notifier: SpecNotifier,
        locks: Arc<KeyedLocks>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            catalog,
            job_manager,
            repository,
            notifier,
            locks,
            config,
            restart_requests: Mutex::new(HashSet::new()),
            last_launch_millis: AtomicI64::new(0),
        }
    }

    pub fn controller_version(&self) -> &ControllerVersion {
        &self.config.controller_version
    }

    /// Queue a forced upgrade of a running job for the next tick.
    pub async fn request_restart(&self, job_id: &str) -> DomainResult<()> {
        let job = self
            .timed("find_by_id", self.repository.find_by_id(job_id))
            .await?
            .ok_or_else(|| DomainError::JobNotFound(job_id.to_string()))?;
        if !job.is_running() {
            return Err(DomainError::InvalidStateTransition {
                from: job.status.as_str().to_string(),
                to: "restarting".to_string(),
            });
        }
        self.restarts().insert(job_id.to_string());
        info!(job_id = %job_id, "restart requested");
        Ok(())
    }

    /// Ids of jobs with a queued restart.
    pub fn pending_restarts(&self) -> Vec<String> {
        let mut pending: Vec<_> = self.restarts().iter().cloned().collect();
        pending.sort();
        pending
    }

    fn restarts(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.restart_requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn restart_requested(&self, job_id: &str) -> bool {
        self.restarts().contains(job_id)
    }

    fn clear_restart(&self, job_id: &str) {
        self.restarts().remove(job_id);
    }

    async fn timed<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = DomainResult<T>>,
    ) -> DomainResult<T> {
        match tokio::time::timeout(self.config.action_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DomainError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.config.action_timeout.as_millis() as u64,
            }),
        }
    }

    /// Run one reconciliation tick.
    ///
    /// Errors only when the tick could not start: the catalog snapshot or
    /// loading job records failed. Failures of individual actions, and
    /// feature sets no job can be built for, are listed in the report.
    pub async fn reconcile_once(&self) -> DomainResult<TickReport> {
        let started_at = Instant::now();
        let mut report = TickReport::default();

        let snapshot = self.fetch_snapshot().await?;
        let assembled = compute_desired(&snapshot, &self.config.desired);
        for (reference, reason) in assembled.rejected {
            report.failures.push(ActionFailure {
                action: ActionKind::Snapshot,
                target: reference.to_string(),
                error: reason,
            });
        }
        let desired = assembled.jobs;
        let aborting = self
            .timed("find_by_status", self.repository.find_by_status(JobStatus::Aborting))
            .await?;
        let running = self
            .timed("find_by_status", self.repository.find_by_status(JobStatus::Running))
            .await?;

        let known: HashSet<String> = aborting
            .iter()
            .chain(running.iter())
            .map(|job| job.id.clone())
            .collect();

        for job in aborting {
            if report.halted {
                break;
            }
            let id = job.id.clone();
            match self.finalize(job).await {
                Ok(true) => report.finalized.push(id),
                Ok(false) => {}
                Err(err) => report.fail(ActionKind::Finalize, id, err),
            }
        }

        let mut by_identity: BTreeMap<String, Vec<Job>> = BTreeMap::new();
        for job in running {
            if report.halted {
                break;
            }
            match self.reap_if_stopped(&job).await {
                Ok(true) => report.reaped.push(job.id),
                Ok(false) => by_identity.entry(job.identity.clone()).or_default().push(job),
                Err(err) => {
                    report.fail(ActionKind::Reap, job.id.clone(), err);
                    by_identity.entry(job.identity.clone()).or_default().push(job);
                }
            }
        }

        self.abort_orphans(&known, &mut report).await;

        // At most one running job per identity: keep the newest.
        let mut current: BTreeMap<String, Job> = BTreeMap::new();
        for (identity, mut jobs) in by_identity {
            jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            let Some(newest) = jobs.pop() else { continue };
            for duplicate in jobs {
                if report.halted {
                    break;
                }
                let id = duplicate.id.clone();
                info!(job_id = %id, identity = %identity, "retiring duplicate job");
                match self.retire(duplicate).await {
                    Ok(()) => report.retired.push(id),
                    Err(err) => report.fail(ActionKind::Retire, id, err),
                }
            }
            current.insert(identity, newest);
        }

        let mut serving: Vec<Job> = Vec::new();
        for (identity, desired_job) in &desired {
            if report.halted {
                break;
            }
            match current.remove(identity) {
                None => match self.start(desired_job).await {
                    Ok(job) => {
                        report.started.push(job.id.clone());
                        serving.push(job);
                    }
                    Err(err) => report.fail(ActionKind::Start, identity.clone(), err),
                },
                Some(job) => {
                    let plan = plan_job(
                        &job,
                        desired_job,
                        &self.config.controller_version,
                        self.restart_requested(&job.id),
                    );
                    match plan {
                        JobPlan::Keep => serving.push(job),
                        JobPlan::UpdateInPlace => {
                            let id = job.id.clone();
                            match self.update_in_place(job, desired_job).await {
                                Ok(updated) => {
                                    report.updated.push(id);
                                    serving.push(updated);
                                }
                                Err(err) => report.fail(ActionKind::Update, id, err),
                            }
                        }
                        JobPlan::Replace(reason) => {
                            let id = job.id.clone();
                            match self.upgrade(job, desired_job, reason).await {
                                Ok(replacement) => {
                                    report.upgraded.push(id);
                                    report.started.push(replacement.id.clone());
                                    serving.push(replacement);
                                }
                                Err(err) => report.fail(ActionKind::Upgrade, id, err),
                            }
                        }
                    }
                }
            }
        }

        for (_, job) in current {
            if report.halted {
                break;
            }
            let id = job.id.clone();
            info!(job_id = %id, identity = %job.identity, "retiring job no longer desired");
            match self.retire(job).await {
                Ok(()) => report.retired.push(id),
                Err(err) => report.fail(ActionKind::Retire, id, err),
            }
        }

        for job in &serving {
            for reference in &job.feature_sets {
                if report.halted {
                    break;
                }
                let Some(feature_set) = snapshot.feature_set(reference) else {
                    continue;
                };
                if !feature_set.needs_publication(&job.id) {
                    continue;
                }
                match self.publish(job, reference).await {
                    Ok(Some(version)) => report.notified.push(format!("{reference}@{version}")),
                    Ok(None) => {}
                    Err(err) => report.fail(ActionKind::Notify, reference.to_string(), err),
                }
            }
        }

        if !report.halted {
            match self.prune().await {
                Ok(pruned) => report.pruned = pruned,
                Err(err) => report.fail(ActionKind::Prune, "aborted jobs", err),
            }
        }

        report.duration_ms = started_at.elapsed().as_millis() as u64;
        if report.changed() || !report.is_clean() {
            info!(
                started = report.started.len(),
                upgraded = report.upgraded.len(),
                updated = report.updated.len(),
                retired = report.retired.len(),
                notified = report.notified.len(),
                failures = report.failures.len(),
                halted = report.halted,
                duration_ms = report.duration_ms,
                "reconciliation tick finished"
            );
        } else {
            debug!(duration_ms = report.duration_ms, "reconciliation tick: nothing to do");
        }
        Ok(report)
    }

    /// Read every feature set matching a selector, and every store.
    async fn fetch_snapshot(&self) -> DomainResult<CatalogSnapshot> {
        let mut feature_sets: BTreeMap<FeatureSetRef, FeatureSet> = BTreeMap::new();
        for selector in &self.config.desired.selectors {
            let filter = FeatureSetFilter {
                project: selector.project.clone(),
                name: selector.name.clone(),
            };
            let listed = self
                .timed("list_feature_sets", self.catalog.list_feature_sets(&filter))
                .await?;
            for feature_set in listed {
                feature_sets.insert(feature_set.reference(), feature_set);
            }
        }
        let stores = self.timed("list_stores", self.catalog.list_stores()).await?;
        Ok(CatalogSnapshot::new(feature_sets.into_values().collect(), stores))
    }

    /// Reload a job under its lock; `None` when it is gone or no longer in `status`.
    async fn reload(&self, job_id: &str, status: JobStatus) -> DomainResult<Option<Job>> {
        let job = self
            .timed("find_by_id", self.repository.find_by_id(job_id))
            .await?;
        Ok(job.filter(|job| job.status == status))
    }

    fn next_job_id(&self, identity: &str) -> String {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_launch_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        format!("{identity}-{}", now.max(previous + 1))
    }

    async fn start(&self, desired: &DesiredJob) -> DomainResult<Job> {
        let version = &self.config.controller_version;
        let job = Job::new(
            desired.identity.clone(),
            desired.source.clone(),
            desired.stores.clone(),
            desired.feature_sets.clone(),
            version.clone(),
        )
        .with_id(self.next_job_id(&desired.identity))
        .with_label(VERSION_LABEL, version_codec::encode(version));

        let _guard = self.locks.lock_job(&job.id).await;
        let started = self
            .timed("start_job", self.job_manager.start_job(job))
            .await?;

        if let Err(err) = self.timed("add", self.repository.add(&started)).await {
            // Never leave a runtime job without a record.
            if let Err(abort_err) = self.job_manager.abort_job(&started).await {
                warn!(job_id = %started.id, error = %abort_err, "failed to abort unrecorded job");
            }
            return Err(err);
        }

        info!(
            job_id = %started.id,
            identity = %started.identity,
            source = %started.source,
            stores = started.stores.len(),
            feature_sets = started.feature_sets.len(),
            "started job"
        );
        Ok(started)
    }

    async fn upgrade(&self, job: Job, desired: &DesiredJob, reason: &str) -> DomainResult<Job> {
        {
            let _guard = self.locks.lock_job(&job.id).await;
            let Some(mut old) = self.reload(&job.id, JobStatus::Running).await? else {
                return Err(DomainError::ConcurrencyConflict {
                    entity: "job".to_string(),
                    id: job.id,
                });
            };
            info!(job_id = %old.id, reason, "replacing job");

            old.transition_to(JobStatus::Aborting)
                .map_err(|_| DomainError::InvalidStateTransition {
                    from: old.status.as_str().to_string(),
                    to: JobStatus::Aborting.as_str().to_string(),
                })?;
            let old = self.timed("update", self.repository.update(&old)).await?;
            self.clear_restart(&old.id);
            self.timed("abort_job", self.job_manager.abort_job(&old))
                .await?;
            let id = old.id.clone();
            if let Err(err) = self.confirm_stopped(old).await {
                warn!(job_id = %id, error = %err, "could not confirm stop; finalized later");
            }
        }

        // The replacement does not wait for the runtime to confirm the stop;
        // aborts are idempotent and finalized on later ticks.
        self.start(desired).await
    }

    async fn update_in_place(&self, job: Job, desired: &DesiredJob) -> DomainResult<Job> {
        let _guard = self.locks.lock_job(&job.id).await;
        let Some(mut next) = self.reload(&job.id, JobStatus::Running).await? else {
            return Err(DomainError::ConcurrencyConflict {
                entity: "job".to_string(),
                id: job.id,
            });
        };

        next.stores = desired.stores.clone();
        next.set_feature_sets(desired.feature_sets.clone());
        let next = self
            .timed("update_job", self.job_manager.update_job(next))
            .await?;
        let saved = self.timed("update", self.repository.update(&next)).await?;

        info!(
            job_id = %saved.id,
            stores = saved.stores.len(),
            feature_sets = saved.feature_sets.len(),
            "updated job in place"
        );
        Ok(saved)
    }

    /// Stop a running job. The record stays aborted until pruned.
    async fn retire(&self, job: Job) -> DomainResult<()> {
        let _guard = self.locks.lock_job(&job.id).await;
        let Some(mut job) = self.reload(&job.id, JobStatus::Running).await? else {
            return Ok(());
        };

        job.status = JobStatus::Aborting;
        let job = self.timed("update", self.repository.update(&job)).await?;
        self.clear_restart(&job.id);
        self.timed("abort_job", self.job_manager.abort_job(&job))
            .await?;
        self.confirm_stopped(job).await?;
        Ok(())
    }

    /// Move an aborting job to its final state if the runtime stopped it.
    /// Returns whether it did.
    async fn confirm_stopped(&self, mut job: Job) -> DomainResult<bool> {
        let status = self
            .timed("get_job_status", self.job_manager.get_job_status(&job))
            .await?;
        if status != JobStatus::Aborted {
            return Ok(false);
        }

        job.status = JobStatus::Aborted;
        job.updated_at = Utc::now();
        self.timed("update", self.repository.update(&job)).await?;
        info!(job_id = %job.id, "job aborted");
        Ok(true)
    }

    async fn finalize(&self, job: Job) -> DomainResult<bool> {
        let _guard = self.locks.lock_job(&job.id).await;
        let Some(job) = self.reload(&job.id, JobStatus::Aborting).await? else {
            return Ok(false);
        };
        if self.confirm_stopped(job.clone()).await? {
            return Ok(true);
        }
        // Still alive: ask again.
        self.timed("abort_job", self.job_manager.abort_job(&job))
            .await?;
        Ok(false)
    }

    /// Mark a running record aborted when its runtime job is gone.
    async fn reap_if_stopped(&self, job: &Job) -> DomainResult<bool> {
        let status = self
            .timed("get_job_status", self.job_manager.get_job_status(job))
            .await?;
        if status != JobStatus::Aborted {
            return Ok(false);
        }

        let _guard = self.locks.lock_job(&job.id).await;
        let Some(mut job) = self.reload(&job.id, JobStatus::Running).await? else {
            return Ok(false);
        };
        warn!(job_id = %job.id, "job stopped outside the controller");
        job.status = JobStatus::Aborted;
        self.timed("update", self.repository.update(&job)).await?;
        self.clear_restart(&job.id);
        Ok(true)
    }

    async fn abort_orphans(&self, known: &HashSet<String>, report: &mut TickReport) {
        let runtime_jobs = match self
            .timed("list_running_jobs", self.job_manager.list_running_jobs())
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                report.fail(ActionKind::AbortOrphan, "runtime", err);
                return;
            }
        };

        for job in runtime_jobs.into_iter().filter(|job| !known.contains(&job.id)) {
            warn!(job_id = %job.id, "aborting runtime job without a record");
            match self.timed("abort_job", self.job_manager.abort_job(&job)).await {
                Ok(()) => report.orphans_aborted.push(job.id),
                Err(err) => report.fail(ActionKind::AbortOrphan, job.id, err),
            }
        }
    }

    /// Publish a feature set for a serving job and reset the job's delivery
    /// entry. Returns the version sent, if any.
    async fn publish(&self, job: &Job, reference: &FeatureSetRef) -> DomainResult<Option<u64>> {
        let _feature_set_guard = self.locks.lock_feature_set(&reference.to_string()).await;

        let Some(feature_set) = self
            .timed("get_feature_set", self.catalog.get_feature_set(reference))
            .await?
        else {
            return Ok(None);
        };
        if !feature_set.needs_publication(&job.id) {
            return Ok(None);
        }

        let publication = self
            .timed("notify", self.notifier.notify(&feature_set, &job.id))
            .await?;
        if !publication.was_sent() {
            return Ok(None);
        }
        let version = publication.version();

        let _job_guard = self.locks.lock_job(&job.id).await;
        if let Some(mut record) = self.reload(&job.id, JobStatus::Running).await? {
            let superseded = record.delivery_statuses.get(reference).map_or(true, |entry| {
                entry.status == DeliveryState::Delivered && entry.delivered_version < version
            });
            if superseded {
                record.mark_in_progress(reference);
                self.timed("update", self.repository.update(&record)).await?;
            }
        }
        Ok(Some(version))
    }

    /// Delete aborted records past retention.
    async fn prune(&self) -> DomainResult<usize> {
        let retention = chrono::Duration::from_std(self.config.aborted_job_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(retention);
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let aborted = self
            .timed("find_by_status", self.repository.find_by_status(JobStatus::Aborted))
            .await?;
        let mut pruned = 0;
        for job in aborted.into_iter().filter(|job| job.updated_at < cutoff) {
            self.timed("delete", self.repository.delete(&job.id)).await?;
            debug!(job_id = %job.id, "pruned aborted job");
            pruned += 1;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use crate::adapters::memory::{InMemoryCatalog, InMemoryJobManager, InMemorySpecBus};
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteJobRepository};
    use crate::domain::models::{
        FeatureSetSelector, FeatureSetStatus, Source, Store, StoreType, Subscription, ValueType,
    };
    use crate::domain::ports::SpecPublisher;

    struct Fixture {
        catalog: Arc<InMemoryCatalog>,
        manager: Arc<InMemoryJobManager>,
        bus: Arc<InMemorySpecBus>,
        repository: Arc<SqliteJobRepository>,
        reconciler: Reconciler,
    }

    fn config(version: ControllerVersion) -> ReconcilerConfig {
        ReconcilerConfig {
            controller_version: version,
            desired: DesiredStateConfig::new(
                vec![FeatureSetSelector::new("default", "*")],
                ["online".to_string()],
                true,
            ),
            action_timeout: Duration::from_secs(1),
            aborted_job_retention: Duration::from_secs(3600),
        }
    }

    async fn fixture() -> Fixture {
        let version = ControllerVersion::new(1, 0, 0);
        let catalog = Arc::new(InMemoryCatalog::new());
        let manager = Arc::new(InMemoryJobManager::new());
        let bus = Arc::new(InMemorySpecBus::default());
        let repository = Arc::new(SqliteJobRepository::new(
            create_migrated_test_pool().await.unwrap(),
        ));

        catalog
            .apply_store(
                Store::new("online", StoreType::Redis)
                    .with_subscription(Subscription::new("default", "*")),
            )
            .await;

        let notifier = SpecNotifier::new(catalog.clone(), bus.clone() as Arc<dyn SpecPublisher>);
        let reconciler = Reconciler::new(
            catalog.clone(),
            manager.clone(),
            repository.clone(),
            notifier,
            Arc::new(KeyedLocks::new()),
            config(version),
        );
        Fixture {
            catalog,
            manager,
            bus,
            repository,
            reconciler,
        }
    }

    fn feature_set(name: &str, topic: &str) -> FeatureSet {
        FeatureSet::new("default", name, Source::kafka("localhost:9092", topic))
            .with_entity("entity", ValueType::Int64)
    }

    async fn running(f: &Fixture) -> Vec<Job> {
        f.repository.find_by_status(JobStatus::Running).await.unwrap()
    }

    #[tokio::test]
    async fn test_starts_job_and_publishes_spec() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.started.len(), 1);
        assert_eq!(report.notified, vec!["default/test@1".to_string()]);
        assert!(report.is_clean());

        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.labels.get(VERSION_LABEL).map(String::as_str), Some("1-0-0"));
        assert!(job.stores.contains_key("online"));
        assert_eq!(
            f.manager.get_job_status(job).await.unwrap(),
            JobStatus::Running
        );
        assert_eq!(f.bus.published_versions("default/test").await, vec![1]);

        let fs = f
            .catalog
            .get_feature_set(&FeatureSetRef::new("default", "test"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fs.version(), 1);
        assert_eq!(fs.status(), FeatureSetStatus::Pending);
    }

    #[tokio::test]
    async fn test_second_tick_is_a_no_op() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert!(!report.changed(), "unexpected actions: {report:?}");
        assert_eq!(f.manager.calls().starts, 1);
        assert_eq!(f.bus.published_versions("default/test").await, vec![1]);
    }

    #[tokio::test]
    async fn test_unselected_feature_set_gets_no_job() {
        let f = fixture().await;
        f.catalog
            .apply_feature_set(
                FeatureSet::new("other", "test", Source::kafka("localhost:9092", "events")),
            )
            .await;

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert!(report.started.is_empty());
        assert!(f.repository.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consolidates_feature_sets_sharing_a_source() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("a", "events")).await;
        f.catalog.apply_feature_set(feature_set("b", "events")).await;

        f.reconciler.reconcile_once().await.unwrap();
        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].feature_sets.len(), 2);
    }

    #[tokio::test]
    async fn test_content_change_publishes_next_version() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();

        f.catalog
            .apply_feature_set(feature_set("test", "events").with_feature("clicks", ValueType::Int32))
            .await;
        let report = f.reconciler.reconcile_once().await.unwrap();

        assert!(report.started.is_empty());
        assert_eq!(report.notified, vec!["default/test@2".to_string()]);
        assert_eq!(f.bus.published_versions("default/test").await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_source_change_replaces_job() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();
        let old = running(&f).await.remove(0);

        f.catalog.apply_feature_set(feature_set("test", "events-v2")).await;
        let report = f.reconciler.reconcile_once().await.unwrap();

        assert_eq!(report.retired, vec![old.id.clone()]);
        assert_eq!(report.started.len(), 1);
        assert_eq!(
            f.manager.get_job_status(&old).await.unwrap(),
            JobStatus::Aborted
        );
        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        assert_ne!(jobs[0].id, old.id);
        assert_eq!(jobs[0].source.kafka.topic, "events-v2");

        let versions = f.bus.published_versions("default/test").await;
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_outdated_controller_version_is_replaced() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;

        let snapshot = f.reconciler.fetch_snapshot().await.unwrap();
        let desired = compute_desired(&snapshot, &f.reconciler.config.desired).jobs;
        let desired_job = desired.values().next().unwrap();
        let stale = Job::new(
            desired_job.identity.clone(),
            desired_job.source.clone(),
            desired_job.stores.clone(),
            BTreeSet::new(),
            ControllerVersion::new(0, 9, 9),
        )
        .with_id("some-running-id")
        .with_label(VERSION_LABEL, "0-9-9");
        let stale = f.manager.start_job(stale).await.unwrap();
        f.repository.add(&stale).await.unwrap();

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.upgraded, vec![stale.id.clone()]);

        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        let replacement = &jobs[0];
        assert_ne!(replacement.id, stale.id);
        assert_eq!(replacement.source, stale.source);
        assert_eq!(replacement.stores, stale.stores);
        assert_eq!(
            replacement.labels.get(VERSION_LABEL).map(String::as_str),
            Some("1-0-0")
        );
        assert_eq!(
            f.manager.get_job_status(&stale).await.unwrap(),
            JobStatus::Aborted
        );
        let old_record = f.repository.find_by_id(&stale.id).await.unwrap().unwrap();
        assert_eq!(old_record.status, JobStatus::Aborted);
    }

    #[tokio::test]
    async fn test_restart_request_replaces_job() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();
        let old = running(&f).await.remove(0);

        f.reconciler.request_restart(&old.id).await.unwrap();
        assert_eq!(f.reconciler.pending_restarts(), vec![old.id.clone()]);

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.upgraded, vec![old.id.clone()]);
        assert!(f.reconciler.pending_restarts().is_empty());

        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        assert_ne!(jobs[0].id, old.id);
        assert_eq!(
            f.manager.get_job_status(&old).await.unwrap(),
            JobStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_restart_request_validation() {
        let f = fixture().await;
        assert!(matches!(
            f.reconciler.request_restart("missing").await,
            Err(DomainError::JobNotFound(_))
        ));

        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();
        let mut job = running(&f).await.remove(0);
        job.transition_to(JobStatus::Aborted).unwrap();
        f.repository.update(&job).await.unwrap();

        assert!(matches!(
            f.reconciler.request_restart(&job.id).await,
            Err(DomainError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_externally_stopped_job_is_restored() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();
        let old = running(&f).await.remove(0);

        assert!(f.manager.stop_externally(&old.id).await);
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.reaped, vec![old.id.clone()]);
        assert_eq!(report.started.len(), 1);

        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        assert_ne!(jobs[0].id, old.id);
    }

    #[tokio::test]
    async fn test_removed_store_retires_job() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();
        let old = running(&f).await.remove(0);

        f.catalog.remove_store("online").await;
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.retired, vec![old.id.clone()]);
        assert!(running(&f).await.is_empty());
        let record = f.repository.find_by_id(&old.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Aborted);
    }

    #[tokio::test]
    async fn test_added_store_updates_job_in_place() {
        let f = fixture().await;
        let mut cfg = config(ControllerVersion::new(1, 0, 0));
        cfg.desired = DesiredStateConfig::new(
            vec![FeatureSetSelector::new("default", "*")],
            ["online".to_string(), "offline".to_string()],
            true,
        );
        let notifier = SpecNotifier::new(f.catalog.clone(), f.bus.clone() as Arc<dyn SpecPublisher>);
        let reconciler = Reconciler::new(
            f.catalog.clone(),
            f.manager.clone(),
            f.repository.clone(),
            notifier,
            Arc::new(KeyedLocks::new()),
            cfg,
        );

        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        reconciler.reconcile_once().await.unwrap();
        let job = running(&f).await.remove(0);

        f.catalog
            .apply_store(
                Store::new("offline", StoreType::Bigquery)
                    .with_subscription(Subscription::new("*", "*")),
            )
            .await;
        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.updated, vec![job.id.clone()]);
        assert!(report.started.is_empty());

        let updated = f.repository.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.stores.len(), 2);
        assert_eq!(f.manager.calls().updates, 1);
        assert_eq!(f.manager.get(&job.id).await.unwrap().stores.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_running_jobs_collapse_to_newest() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();
        let first = running(&f).await.remove(0);

        let mut second = first.clone().with_id(format!("{}-dup", first.identity));
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        let second = f.manager.start_job(second).await.unwrap();
        f.repository.add(&second).await.unwrap();

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.retired, vec![first.id.clone()]);

        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, second.id);
        let retired = f.repository.find_by_id(&first.id).await.unwrap().unwrap();
        assert_eq!(retired.status, JobStatus::Aborted);
    }

    #[tokio::test]
    async fn test_slow_abort_is_finalized_later() {
        let f = fixture().await;
        f.manager.set_immediate_abort(false);
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();
        let old = running(&f).await.remove(0);

        f.reconciler.request_restart(&old.id).await.unwrap();
        f.reconciler.reconcile_once().await.unwrap();
        let record = f.repository.find_by_id(&old.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Aborting);

        f.manager.finish_aborts().await;
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.finalized, vec![old.id.clone()]);
        let record = f.repository.find_by_id(&old.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Aborted);
    }

    #[tokio::test]
    async fn test_start_failure_is_isolated_and_retried() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.manager.set_fail_starts(true);

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].action, ActionKind::Start);
        assert!(!report.halted);
        assert!(running(&f).await.is_empty());

        f.manager.set_fail_starts(false);
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.started.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_resends_same_version() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.bus.set_fail_publish(true);

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].action, ActionKind::Notify);

        f.bus.set_fail_publish(false);
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.notified, vec!["default/test@1".to_string()]);
        assert_eq!(f.bus.published_versions("default/test").await, vec![1]);
    }

    #[tokio::test]
    async fn test_orphan_runtime_job_is_aborted() {
        let f = fixture().await;
        let orphan = Job::new(
            "kafka-orphan",
            Source::kafka("localhost:9092", "lost"),
            BTreeMap::new(),
            BTreeSet::new(),
            ControllerVersion::new(1, 0, 0),
        );
        let orphan = f.manager.start_job(orphan).await.unwrap();

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.orphans_aborted, vec![orphan.id.clone()]);
        assert_eq!(
            f.manager.get_job_status(&orphan).await.unwrap(),
            JobStatus::Aborted
        );
    }

    #[tokio::test]
    async fn test_expired_aborted_records_are_pruned() {
        let f = fixture().await;
        let mut cfg = config(ControllerVersion::new(1, 0, 0));
        cfg.aborted_job_retention = Duration::ZERO;
        let notifier = SpecNotifier::new(f.catalog.clone(), f.bus.clone() as Arc<dyn SpecPublisher>);
        let reconciler = Reconciler::new(
            f.catalog.clone(),
            f.manager.clone(),
            f.repository.clone(),
            notifier,
            Arc::new(KeyedLocks::new()),
            cfg,
        );

        let mut aborted = Job::new(
            "kafka-gone",
            Source::kafka("localhost:9092", "gone"),
            BTreeMap::new(),
            BTreeSet::new(),
            ControllerVersion::new(1, 0, 0),
        )
        .with_label(VERSION_LABEL, "1-0-0");
        aborted.status = JobStatus::Aborted;
        aborted.updated_at = Utc::now() - chrono::Duration::seconds(5);
        f.repository.add(&aborted).await.unwrap();

        let report = reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(f.repository.find_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_plan_job() {
        let version = ControllerVersion::new(1, 0, 0);
        let source = Source::kafka("localhost:9092", "events");
        let mut stores = BTreeMap::new();
        stores.insert("online".to_string(), Store::new("online", StoreType::Redis));
        let reference = FeatureSetRef::new("default", "test");
        let desired = DesiredJob {
            identity: "kafka-x".to_string(),
            source: source.normalized(),
            stores: stores.clone(),
            feature_sets: [reference.clone()].into_iter().collect(),
        };
        let job = Job::new(
            "kafka-x",
            source.clone(),
            stores.clone(),
            desired.feature_sets.clone(),
            version.clone(),
        )
        .with_label(VERSION_LABEL, "1-0-0");

        assert_eq!(plan_job(&job, &desired, &version, false), JobPlan::Keep);
        assert_eq!(
            plan_job(&job, &desired, &version, true),
            JobPlan::Replace("restart requested")
        );
        assert_eq!(
            plan_job(&job, &desired, &ControllerVersion::new(2, 0, 0), false),
            JobPlan::Replace("controller version changed")
        );

        let mut grown = desired.clone();
        grown
            .stores
            .insert("offline".to_string(), Store::new("offline", StoreType::Bigquery));
        assert_eq!(plan_job(&job, &grown, &version, false), JobPlan::UpdateInPlace);

        let mut shrunk = desired.clone();
        shrunk.stores.clear();
        assert_eq!(
            plan_job(&job, &shrunk, &version, false),
            JobPlan::Replace("stores removed")
        );
    }

    #[test]
    fn test_report_changed() {
        let mut report = TickReport::default();
        assert!(!report.changed());
        report.pruned = 1;
        assert!(report.changed());
        report.fail(ActionKind::Prune, "x", DomainError::DatabaseError("down".into()));
        assert!(report.halted);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_invalid_feature_set_does_not_block_others() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("good", "events")).await;
        f.catalog
            .apply_feature_set(FeatureSet::new("default", "bad", Source::kafka("", "x")))
            .await;

        for _ in 0..2 {
            let report = f.reconciler.reconcile_once().await.unwrap();
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].action, ActionKind::Snapshot);
            assert_eq!(report.failures[0].target, "default/bad");
            assert!(!report.halted);
        }

        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].feature_sets.contains(&FeatureSetRef::new("default", "good")));
        assert_eq!(f.bus.published_versions("default/good").await, vec![1]);
        assert!(f.bus.published_versions("default/bad").await.is_empty());
    }

    #[tokio::test]
    async fn test_replacement_starts_when_stop_cannot_be_confirmed() {
        let f = fixture().await;
        f.catalog.apply_feature_set(feature_set("test", "events")).await;
        f.reconciler.reconcile_once().await.unwrap();
        let old = running(&f).await.remove(0);

        f.reconciler.request_restart(&old.id).await.unwrap();
        f.manager.set_fail_status(true);
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.upgraded, vec![old.id.clone()]);
        assert_eq!(report.started.len(), 1);

        let jobs = running(&f).await;
        assert_eq!(jobs.len(), 1);
        assert_ne!(jobs[0].id, old.id);
        let record = f.repository.find_by_id(&old.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Aborting);

        f.manager.set_fail_status(false);
        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.finalized, vec![old.id.clone()]);
        let record = f.repository.find_by_id(&old.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Aborted);
    }
}
