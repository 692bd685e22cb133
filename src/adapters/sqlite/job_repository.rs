//! SQLite implementation of the JobRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ControllerVersion, Job, JobStatus};
use crate::domain::ports::JobRepository;

use super::{parse_datetime, parse_json};

#[derive(Clone)]
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: &str) -> DomainResult<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn add(&self, job: &Job) -> DomainResult<()> {
        job.validate().map_err(DomainError::ValidationFailed)?;

        sqlx::query(
            r#"INSERT INTO jobs (id, identity, ext_id, runner, source, stores, feature_sets,
               labels, controller_version, status, delivery_statuses, record_version,
               created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&job.id)
        .bind(&job.identity)
        .bind(&job.ext_id)
        .bind(&job.runner)
        .bind(serde_json::to_string(&job.source)?)
        .bind(serde_json::to_string(&job.stores)?)
        .bind(serde_json::to_string(&job.feature_sets)?)
        .bind(serde_json::to_string(&job.labels)?)
        .bind(job.controller_version.to_string())
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.delivery_statuses)?)
        .bind(job.record_version as i64)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> DomainResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find_by_status(&self, status: JobStatus) -> DomainResult<Vec<Job>> {
        let rows: Vec<JobRow> =
            sqlx::query_as("SELECT * FROM jobs WHERE status = ? ORDER BY created_at ASC, id ASC")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_all(&self) -> DomainResult<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update(&self, job: &Job) -> DomainResult<Job> {
        let mut updated = job.clone();
        updated.record_version = job.record_version + 1;
        updated.updated_at = Utc::now();

        let result = sqlx::query(
            r#"UPDATE jobs SET ext_id = ?, runner = ?, source = ?, stores = ?, feature_sets = ?,
               labels = ?, controller_version = ?, status = ?, delivery_statuses = ?,
               record_version = ?, updated_at = ?
               WHERE id = ? AND record_version = ?"#,
        )
        .bind(&updated.ext_id)
        .bind(&updated.runner)
        .bind(serde_json::to_string(&updated.source)?)
        .bind(serde_json::to_string(&updated.stores)?)
        .bind(serde_json::to_string(&updated.feature_sets)?)
        .bind(serde_json::to_string(&updated.labels)?)
        .bind(updated.controller_version.to_string())
        .bind(updated.status.as_str())
        .bind(serde_json::to_string(&updated.delivery_statuses)?)
        .bind(updated.record_version as i64)
        .bind(updated.updated_at.to_rfc3339())
        .bind(&job.id)
        .bind(job.record_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.exists(&job.id).await? {
                return Err(DomainError::ConcurrencyConflict {
                    entity: "job".to_string(),
                    id: job.id.clone(),
                });
            }
            return Err(DomainError::JobNotFound(job.id.clone()));
        }

        Ok(updated)
    }

    async fn delete(&self, id: &str) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_all(&self) -> DomainResult<()> {
        sqlx::query("DELETE FROM jobs").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    identity: String,
    ext_id: Option<String>,
    runner: Option<String>,
    source: String,
    stores: String,
    feature_sets: String,
    labels: String,
    controller_version: String,
    status: String,
    delivery_statuses: String,
    record_version: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JobRow> for Job {
    type Error = DomainError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;

        let controller_version = ControllerVersion::parse(&row.controller_version)
            .map_err(DomainError::SerializationError)?;

        Ok(Job {
            id: row.id,
            identity: row.identity,
            ext_id: row.ext_id,
            runner: row.runner,
            source: parse_json(&row.source)?,
            stores: parse_json(&row.stores)?,
            feature_sets: parse_json(&row.feature_sets)?,
            labels: parse_json(&row.labels)?,
            controller_version,
            status,
            delivery_statuses: parse_json(&row.delivery_statuses)?,
            record_version: row.record_version.max(0) as u64,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}
