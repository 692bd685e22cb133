//! Job CLI commands.
//!
//! These talk to a running controller through its operator API rather than
//! opening the database, so they never race the reconciler.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::Cell;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::time::Duration;

use crate::adapters::http::{ErrorResponse, JobResponse};
use crate::adapters::http::jobs_http::RestartResponse;
use crate::cli::commands::config::load_config;
use crate::cli::output::{output, status_cell, table, truncate, CommandOutput};

#[derive(Args, Debug)]
pub struct JobsArgs {
    /// Operator API base URL; defaults to the configured api host and port
    #[arg(long, global = true, env = "SLUICE_API_URL")]
    pub api_url: Option<String>,

    /// Config file used to derive the API URL
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: JobsCommands,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommands {
    /// List job records
    List {
        /// Filter by status (running, aborting, aborted)
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show one job with its delivery state
    Show {
        /// Job ID
        id: String,
    },
    /// Replace a running job with a fresh one on the next tick
    Restart {
        /// Job ID
        id: String,
    },
    /// Show controller progress
    Status,
}

/// Thin client for the operator API.
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.context("Failed to decode API response");
        }
        match response.json::<ErrorResponse>().await {
            Ok(body) => anyhow::bail!("{} ({}): {}", status, body.code, body.error),
            Err(_) => anyhow::bail!("API returned {status}"),
        }
    }

    pub async fn list_jobs(&self, status: Option<&str>) -> Result<Vec<JobResponse>> {
        let mut request = self.http.get(self.url("/api/v1/jobs"));
        if let Some(status) = status {
            request = request.query(&[("status", status)]);
        }
        let response = request.send().await.context("Failed to reach the controller")?;
        Self::decode(response).await
    }

    pub async fn get_job(&self, id: &str) -> Result<JobResponse> {
        let response = self
            .http
            .get(self.url(&format!("/api/v1/jobs/{id}")))
            .send()
            .await
            .context("Failed to reach the controller")?;
        Self::decode(response).await
    }

    pub async fn restart_job(&self, id: &str) -> Result<RestartResponse> {
        let response = self
            .http
            .post(self.url(&format!("/api/v1/jobs/{id}/restart")))
            .send()
            .await
            .context("Failed to reach the controller")?;
        Self::decode(response).await
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(self.url("/api/v1/status"))
            .send()
            .await
            .context("Failed to reach the controller")?;
        Self::decode(response).await
    }
}

#[derive(Debug, serde::Serialize)]
struct JobListOutput {
    jobs: Vec<JobResponse>,
    total: usize,
}

impl CommandOutput for JobListOutput {
    fn to_human(&self) -> String {
        if self.jobs.is_empty() {
            return "No jobs found.".to_string();
        }

        let mut t = table(&["ID", "STATUS", "SOURCE", "STORES", "FEATURE SETS", "VERSION"]);
        for job in &self.jobs {
            t.add_row(vec![
                Cell::new(&job.id),
                status_cell(&job.status),
                Cell::new(truncate(&job.source, 40)),
                Cell::new(job.stores.join(", ")),
                Cell::new(truncate(&job.feature_sets.join(", "), 48)),
                Cell::new(&job.controller_version),
            ]);
        }
        format!("Found {} job(s):\n{t}", self.total)
    }
}

#[derive(Debug, serde::Serialize)]
struct JobDetailOutput {
    job: JobResponse,
}

impl CommandOutput for JobDetailOutput {
    fn to_human(&self) -> String {
        let job = &self.job;
        let mut lines = vec![
            format!("Job: {}", job.id),
            format!("Status: {}", job.status),
            format!("Source: {}", job.source),
            format!("Stores: {}", job.stores.join(", ")),
            format!("Controller version: {}", job.controller_version),
            format!("Created: {}", job.created_at),
            format!("Updated: {}", job.updated_at),
        ];
        if let Some(ext_id) = &job.ext_id {
            lines.push(format!("Runtime id: {ext_id}"));
        }

        if !job.delivery.is_empty() {
            let mut t = table(&["FEATURE SET", "VERSION", "DELIVERY"]);
            for (reference, delivery) in &job.delivery {
                t.add_row(vec![
                    Cell::new(reference),
                    Cell::new(delivery.delivered_version),
                    Cell::new(&delivery.status),
                ]);
            }
            lines.push(format!("\n{t}"));
        }

        lines.join("\n")
    }
}

#[derive(Debug, serde::Serialize)]
struct RestartOutput {
    job_id: String,
    queued: bool,
}

impl CommandOutput for RestartOutput {
    fn to_human(&self) -> String {
        format!(
            "Restart of job {} queued; it is replaced on the next reconciliation tick.",
            self.job_id
        )
    }
}

#[derive(Debug, serde::Serialize)]
struct StatusOutput {
    status: serde_json::Value,
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.status).unwrap_or_default()
    }

    fn to_json(&self) -> serde_json::Value {
        self.status.clone()
    }
}

fn api_url(args: &JobsArgs) -> Result<String> {
    if let Some(url) = &args.api_url {
        return Ok(url.clone());
    }
    let config = load_config(args.config.as_deref())?;
    Ok(format!("http://{}:{}", config.api.host, config.api.port))
}

pub async fn execute(args: JobsArgs, json_mode: bool) -> Result<()> {
    let client = ApiClient::new(api_url(&args)?)?;

    match args.command {
        JobsCommands::List { status } => {
            let jobs = client.list_jobs(status.as_deref()).await?;
            let total = jobs.len();
            output(&JobListOutput { jobs, total }, json_mode);
        }
        JobsCommands::Show { id } => {
            let job = client.get_job(&id).await?;
            output(&JobDetailOutput { job }, json_mode);
        }
        JobsCommands::Restart { id } => {
            let restart = client.restart_job(&id).await?;
            output(
                &RestartOutput {
                    job_id: restart.job_id,
                    queued: restart.queued,
                },
                json_mode,
            );
        }
        JobsCommands::Status => {
            let status = client.status().await?;
            output(&StatusOutput { status }, json_mode);
        }
    }
    Ok(())
}
