//! Job runtime that only keeps bookkeeping. Nothing is executed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Job, JobStatus};
use crate::domain::ports::JobManager;

pub const IN_MEMORY_RUNNER: &str = "in_memory";

struct ManagedJob {
    job: Job,
    status: JobStatus,
}

/// Counters of calls made against the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCalls {
    pub starts: u64,
    pub updates: u64,
    pub aborts: u64,
}

pub struct InMemoryJobManager {
    jobs: RwLock<HashMap<String, ManagedJob>>,
    starts: AtomicU64,
    updates: AtomicU64,
    aborts: AtomicU64,
    fail_starts: AtomicBool,
    fail_status: AtomicBool,
    immediate_abort: AtomicBool,
}

impl Default for InMemoryJobManager {
    fn default() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            starts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            fail_starts: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
            immediate_abort: AtomicBool::new(true),
        }
    }
}

impl InMemoryJobManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> RuntimeCalls {
        RuntimeCalls {
            starts: self.starts.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            aborts: self.aborts.load(Ordering::SeqCst),
        }
    }

    /// Make `start_job` fail until reset.
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Make `get_job_status` fail until reset.
    pub fn set_fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    /// When disabled, aborted jobs stay `Aborting` until [`Self::finish_aborts`].
    pub fn set_immediate_abort(&self, immediate: bool) {
        self.immediate_abort.store(immediate, Ordering::SeqCst);
    }

    /// Complete every pending abort.
    pub async fn finish_aborts(&self) {
        let mut jobs = self.jobs.write().await;
        for managed in jobs.values_mut() {
            if managed.status == JobStatus::Aborting {
                managed.status = JobStatus::Aborted;
            }
        }
    }

    /// Simulate a job dying outside the controller's control.
    pub async fn stop_externally(&self, job_id: &str) -> bool {
        match self.jobs.write().await.get_mut(job_id) {
            Some(managed) => {
                managed.status = JobStatus::Aborted;
                true
            }
            None => false,
        }
    }

    /// Last version of a job as seen by the runtime.
    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.get(job_id).map(|m| m.job.clone())
    }
}

#[async_trait]
impl JobManager for InMemoryJobManager {
    fn runner_type(&self) -> &'static str {
        IN_MEMORY_RUNNER
    }

    async fn start_job(&self, mut job: Job) -> DomainResult<Job> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(DomainError::JobManager(format!(
                "runtime refused to start {}",
                job.id
            )));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        job.ext_id = Some(format!("mem-{}", job.id));
        job.runner = Some(IN_MEMORY_RUNNER.to_string());
        self.jobs.write().await.insert(
            job.id.clone(),
            ManagedJob {
                job: job.clone(),
                status: JobStatus::Running,
            },
        );
        Ok(job)
    }

    async fn update_job(&self, job: Job) -> DomainResult<Job> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(managed) if managed.status == JobStatus::Running => {
                self.updates.fetch_add(1, Ordering::SeqCst);
                managed.job = job.clone();
                Ok(job)
            }
            _ => Err(DomainError::JobManager(format!(
                "job {} is not running",
                job.id
            ))),
        }
    }

    async fn abort_job(&self, job: &Job) -> DomainResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let next = if self.immediate_abort.load(Ordering::SeqCst) {
            JobStatus::Aborted
        } else {
            JobStatus::Aborting
        };
        if let Some(managed) = self.jobs.write().await.get_mut(&job.id) {
            if managed.status != JobStatus::Aborted {
                managed.status = next;
            }
        }
        Ok(())
    }

    async fn get_job_status(&self, job: &Job) -> DomainResult<JobStatus> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(DomainError::JobManager(format!(
                "runtime status unavailable for {}",
                job.id
            )));
        }
        Ok(self
            .jobs
            .read()
            .await
            .get(&job.id)
            .map_or(JobStatus::Aborted, |m| m.status))
    }

    async fn list_running_jobs(&self) -> DomainResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|m| m.status == JobStatus::Running)
            .map(|m| m.job.clone())
            .collect())
    }
}
