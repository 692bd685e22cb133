//! Job manager port - interface for physical job runtimes.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Job, JobStatus};

/// Runtime that actually executes ingestion pipelines.
///
/// Implementations must make `abort_job` idempotent: aborting an already
/// stopped job succeeds.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Runtime type name, recorded on every job it starts.
    fn runner_type(&self) -> &'static str;

    /// Launch a job. Returns the job with its runtime handle assigned.
    async fn start_job(&self, job: Job) -> DomainResult<Job>;

    /// Apply changed stores or feature sets to a running job in place.
    async fn update_job(&self, job: Job) -> DomainResult<Job>;

    /// Request termination.
    async fn abort_job(&self, job: &Job) -> DomainResult<()>;

    /// Current runtime status. Unknown jobs report `Aborted`.
    async fn get_job_status(&self, job: &Job) -> DomainResult<JobStatus>;

    /// Jobs the runtime currently executes.
    async fn list_running_jobs(&self) -> DomainResult<Vec<Job>>;
}
