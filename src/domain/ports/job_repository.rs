use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Job, JobStatus};

/// Repository port for job record persistence
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job record
    async fn add(&self, job: &Job) -> DomainResult<()>;

    /// Get a job by ID
    async fn find_by_id(&self, id: &str) -> DomainResult<Option<Job>>;

    /// Get all jobs in a status, oldest first
    async fn find_by_status(&self, status: JobStatus) -> DomainResult<Vec<Job>>;

    /// Get every job record, oldest first
    async fn find_all(&self) -> DomainResult<Vec<Job>>;

    /// Persist changes to an existing job.
    ///
    /// The stored `record_version` must equal `job.record_version`, otherwise
    /// `ConcurrencyConflict` is returned. Returns the job with the bumped
    /// `record_version`.
    async fn update(&self, job: &Job) -> DomainResult<Job>;

    /// Delete a job by ID
    async fn delete(&self, id: &str) -> DomainResult<()>;

    /// Delete every job record
    async fn delete_all(&self) -> DomainResult<()>;
}
