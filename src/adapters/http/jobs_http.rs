//! Operator HTTP API.
//!
//! Read access to job records, manual restarts, an ack ingestion endpoint
//! for jobs without a broker, and an SSE feed of published specs.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::adapters::memory::InMemorySpecBus;
use crate::domain::errors::DomainError;
use crate::domain::models::{
    ApiConfig, DeliveryState, FeatureSetSpecAck, Job, JobStatus, SpecUpdate, VERSION_LABEL,
};
use crate::domain::ports::JobRepository;
use crate::services::controller_daemon::{DaemonHandle, DaemonStatus};
use crate::services::delivery_tracker::{DeliveryTracker, TrackerStats};
use crate::services::reconciler::Reconciler;

/// Query parameters for job listing.
#[derive(Debug, Deserialize)]
pub struct JobQueryParams {
    #[serde(default)]
    pub status: Option<String>,
}

/// Query parameters for the spec stream.
#[derive(Debug, Deserialize)]
pub struct SpecStreamParams {
    /// Only stream updates addressed to this job.
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub delivered_version: u64,
    pub status: String,
}

/// Response with a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub identity: String,
    pub status: String,
    pub source: String,
    pub stores: Vec<String>,
    pub feature_sets: Vec<String>,
    pub delivery: BTreeMap<String, DeliveryResponse>,
    pub controller_version: String,
    pub version_label: Option<String>,
    pub ext_id: Option<String>,
    pub runner: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            status: job.status.as_str().to_string(),
            source: job.source.to_string(),
            stores: job.stores.keys().cloned().collect(),
            feature_sets: job.feature_sets.iter().map(ToString::to_string).collect(),
            delivery: job
                .delivery_statuses
                .iter()
                .map(|(reference, entry)| {
                    let status = match entry.status {
                        DeliveryState::InProgress => "in_progress",
                        DeliveryState::Delivered => "delivered",
                    };
                    (
                        reference.to_string(),
                        DeliveryResponse {
                            delivered_version: entry.delivered_version,
                            status: status.to_string(),
                        },
                    )
                })
                .collect(),
            controller_version: job.controller_version.to_string(),
            version_label: job.labels.get(VERSION_LABEL).cloned(),
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
            id: job.id,
            identity: job.identity,
            ext_id: job.ext_id,
            runner: job.runner,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartResponse {
    pub job_id: String,
    pub queued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub controller_version: String,
    pub daemon: Option<DaemonStatus>,
    pub tracker: TrackerStats,
    pub pending_restarts: Vec<String>,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn domain_error(err: DomainError) -> ApiError {
    match &err {
        DomainError::JobNotFound(_) => api_error(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", err.to_string()),
        DomainError::InvalidStateTransition { .. } => {
            api_error(StatusCode::CONFLICT, "JOB_NOT_RUNNING", err.to_string())
        }
        DomainError::ValidationFailed(_) => {
            api_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string())
        }
        DomainError::Timeout { .. } => {
            api_error(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", err.to_string())
        }
        _ => api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", err.to_string()),
    }
}

/// Shared state for the operator API.
pub struct ApiState {
    pub repository: Arc<dyn JobRepository>,
    pub reconciler: Arc<Reconciler>,
    pub tracker: Arc<DeliveryTracker>,
    pub daemon: Option<DaemonHandle>,
    /// Source for the SSE feed; the feed answers 501 without one.
    pub spec_feed: Option<Arc<InMemorySpecBus>>,
}

pub struct JobsHttpServer {
    config: ApiConfig,
    state: Arc<ApiState>,
}

impl JobsHttpServer {
    pub fn new(config: ApiConfig, state: ApiState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let app = Router::new()
            .route("/api/v1/jobs", get(list_jobs))
            .route("/api/v1/jobs/{id}", get(get_job))
            .route("/api/v1/jobs/{id}/restart", post(restart_job))
            .route("/api/v1/acks", post(ingest_ack))
            .route("/api/v1/specs/stream", get(stream_specs))
            .route("/api/v1/status", get(status))
            .route("/health", get(health_check))
            .with_state(self.state.clone());

        if self.config.enable_cors {
            app.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
                .layer(TraceLayer::new_for_http())
        } else {
            app.layer(TraceLayer::new_for_http())
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(
        self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "operator API listening");
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_on<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_jobs(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<JobQueryParams>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let jobs = match params.status.as_deref() {
        Some(raw) => {
            let status = JobStatus::from_str(raw).ok_or_else(|| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    "INVALID_STATUS",
                    format!("Unknown job status '{raw}'"),
                )
            })?;
            state.repository.find_by_status(status).await
        }
        None => state.repository.find_all().await,
    }
    .map_err(domain_error)?;

    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

async fn get_job(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    match state.repository.find_by_id(&id).await {
        Ok(Some(job)) => Ok(Json(JobResponse::from(job))),
        Ok(None) => Err(domain_error(DomainError::JobNotFound(id))),
        Err(e) => Err(domain_error(e)),
    }
}

async fn restart_job(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RestartResponse>), ApiError> {
    state.reconciler.request_restart(&id).await.map_err(domain_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RestartResponse {
            job_id: id,
            queued: true,
        }),
    ))
}

async fn ingest_ack(
    State(state): State<Arc<ApiState>>,
    Json(ack): Json<FeatureSetSpecAck>,
) -> Result<Json<AckResponse>, ApiError> {
    let outcome = state.tracker.handle_ack(&ack).await.map_err(domain_error)?;
    Ok(Json(AckResponse {
        outcome: outcome.as_str().to_string(),
    }))
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let daemon = match &state.daemon {
        Some(handle) => Some(handle.status().await),
        None => None,
    };
    Json(StatusResponse {
        controller_version: state.reconciler.controller_version().to_string(),
        daemon,
        tracker: state.tracker.stats(),
        pending_restarts: state.reconciler.pending_restarts(),
    })
}

fn spec_event(update: &SpecUpdate) -> Event {
    Event::default()
        .event("spec_update")
        .id(format!("{}@{}", update.key(), update.version()))
        .json_data(update)
        .unwrap_or_else(|e| Event::default().comment(format!("encode error: {e}")))
}

/// Stream published spec updates via SSE.
async fn stream_specs(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<SpecStreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Some(feed) = &state.spec_feed else {
        return Err(api_error(
            StatusCode::NOT_IMPLEMENTED,
            "STREAMING_NOT_AVAILABLE",
            "This controller publishes specs to an external bus",
        ));
    };
    let receiver = feed.subscribe();

    let stream = stream::unfold((receiver, params.job_id), |(mut rx, job_id)| async move {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    if job_id.as_deref().is_some_and(|id| id != update.job_id) {
                        continue;
                    }
                    let event = spec_event(&update);
                    return Some((Ok::<_, Infallible>(event), (rx, job_id)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let event = Event::default().comment(format!("lagged {skipped}"));
                    return Some((Ok(event), (rx, job_id)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
