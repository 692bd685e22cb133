//! Job runtime backed by local child processes.
//!
//! Every job runs the configured ingestion command once. The child learns
//! what to ingest from its environment:
//!
//! - `SLUICE_JOB_ID`
//! - `SLUICE_JOB_SOURCE`: source as JSON
//! - `SLUICE_JOB_STORES`: stores as JSON
//! - `SLUICE_JOB_DESCRIPTOR`: path of a JSON file holding the full job
//!
//! In-place updates rewrite the descriptor; the child is expected to watch it.
//! Aborts send SIGTERM and the job counts as aborted once the child exited.
//!
//! Children outlive the controller. After a restart a job is adopted again
//! from its record: the pid in `ext_id` must still be alive and its
//! descriptor still on disk. Adopted processes are watched by pid since they
//! are no longer our children.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Job, JobManagerConfig, JobStatus};
use crate::domain::ports::JobManager;

pub const PROCESS_RUNNER: &str = "process";

#[derive(Debug, Clone)]
pub struct ProcessJobManagerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
}

impl ProcessJobManagerConfig {
    pub fn from_config(config: &JobManagerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            work_dir: PathBuf::from(&config.work_dir),
        }
    }
}

struct ChildJob {
    job: Job,
    pid: u32,
    /// `None` for processes adopted from an earlier controller run.
    child: Option<Child>,
    abort_requested: bool,
}

impl ChildJob {
    /// `true` once the process exited. Errors count as exited.
    fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => !process_alive(self.pid),
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let pid = Pid::from_raw(raw);
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => true,
        Ok(_) => false,
        // Not our child: check with signal 0.
        Err(_) => !matches!(kill(pid, None), Err(Errno::ESRCH)),
    }
}

pub struct ProcessJobManager {
    config: ProcessJobManagerConfig,
    children: Mutex<HashMap<String, ChildJob>>,
}

impl ProcessJobManager {
    pub fn new(config: ProcessJobManagerConfig) -> DomainResult<Self> {
        if config.command.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "process runner needs job_manager.command".to_string(),
            ));
        }
        std::fs::create_dir_all(&config.work_dir).map_err(|e| {
            DomainError::JobManager(format!(
                "cannot create work dir {}: {e}",
                config.work_dir.display()
            ))
        })?;
        Ok(Self {
            config,
            children: Mutex::new(HashMap::new()),
        })
    }

    fn descriptor_path(&self, job_id: &str) -> PathBuf {
        self.config.work_dir.join(format!("{job_id}.json"))
    }

    async fn write_descriptor(path: &Path, job: &Job) -> DomainResult<()> {
        let body = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(path, body).await.map_err(|e| {
            DomainError::JobManager(format!("cannot write descriptor {}: {e}", path.display()))
        })
    }

    /// Take over a live process started by an earlier controller run.
    fn adopt(&self, job: &Job) -> Option<ChildJob> {
        if job.runner.as_deref() != Some(PROCESS_RUNNER) {
            return None;
        }
        let pid: u32 = job.ext_id.as_deref()?.parse().ok()?;
        if !self.descriptor_path(&job.id).exists() || !process_alive(pid) {
            return None;
        }
        info!(job_id = %job.id, pid, "adopted running ingestion process");
        Some(ChildJob {
            job: job.clone(),
            pid,
            child: None,
            abort_requested: false,
        })
    }

    fn tracked<'a>(
        &self,
        children: &'a mut HashMap<String, ChildJob>,
        job: &Job,
    ) -> Option<&'a mut ChildJob> {
        if !children.contains_key(&job.id) {
            let adopted = self.adopt(job)?;
            children.insert(job.id.clone(), adopted);
        }
        children.get_mut(&job.id)
    }

    async fn remove_descriptor(&self, job_id: &str) {
        let path = self.descriptor_path(job_id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "failed to remove descriptor");
            }
        }
    }
}

#[async_trait]
impl JobManager for ProcessJobManager {
    fn runner_type(&self) -> &'static str {
        PROCESS_RUNNER
    }

    async fn start_job(&self, mut job: Job) -> DomainResult<Job> {
        let descriptor = self.descriptor_path(&job.id);
        job.runner = Some(PROCESS_RUNNER.to_string());
        Self::write_descriptor(&descriptor, &job).await?;

        let child = Command::new(&self.config.command)
            .args(&self.config.args)
            .env("SLUICE_JOB_ID", &job.id)
            .env("SLUICE_JOB_SOURCE", serde_json::to_string(&job.source)?)
            .env("SLUICE_JOB_STORES", serde_json::to_string(&job.stores)?)
            .env("SLUICE_JOB_DESCRIPTOR", &descriptor)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                DomainError::JobManager(format!(
                    "failed to spawn '{}' for {}: {e}",
                    self.config.command, job.id
                ))
            })?;

        let Some(pid) = child.id() else {
            return Err(DomainError::JobManager(format!(
                "process for {} exited before it was tracked",
                job.id
            )));
        };
        job.ext_id = Some(pid.to_string());
        info!(job_id = %job.id, pid, command = %self.config.command, "spawned ingestion process");

        self.children.lock().await.insert(
            job.id.clone(),
            ChildJob {
                job: job.clone(),
                pid,
                child: Some(child),
                abort_requested: false,
            },
        );
        Ok(job)
    }

    async fn update_job(&self, job: Job) -> DomainResult<Job> {
        let mut children = self.children.lock().await;
        let Some(entry) = self.tracked(&mut children, &job) else {
            return Err(DomainError::JobManager(format!("job {} is not running", job.id)));
        };
        if entry.abort_requested || entry.has_exited() {
            return Err(DomainError::JobManager(format!("job {} is not running", job.id)));
        }

        Self::write_descriptor(&self.descriptor_path(&job.id), &job).await?;
        entry.job = job.clone();
        debug!(job_id = %job.id, "rewrote job descriptor");
        Ok(job)
    }

    async fn abort_job(&self, job: &Job) -> DomainResult<()> {
        let mut children = self.children.lock().await;
        let Some(entry) = self.tracked(&mut children, job) else {
            return Ok(());
        };
        if entry.has_exited() {
            return Ok(());
        }

        let pid = i32::try_from(entry.pid)
            .map_err(|_| DomainError::JobManager(format!("invalid pid {}", entry.pid)))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {}
            // Exited between the check and the signal.
            Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(DomainError::JobManager(format!(
                    "failed to signal {} (pid {pid}): {e}",
                    job.id
                )))
            }
        }
        if !entry.abort_requested {
            info!(job_id = %job.id, pid, "sent SIGTERM");
        }
        entry.abort_requested = true;
        Ok(())
    }

    async fn get_job_status(&self, job: &Job) -> DomainResult<JobStatus> {
        let mut children = self.children.lock().await;
        let Some(entry) = self.tracked(&mut children, job) else {
            drop(children);
            // Left behind by a process that died while the controller was down.
            self.remove_descriptor(&job.id).await;
            return Ok(JobStatus::Aborted);
        };

        if entry.has_exited() {
            if !entry.abort_requested {
                warn!(job_id = %job.id, pid = entry.pid, "ingestion process exited on its own");
            }
            children.remove(&job.id);
            drop(children);
            self.remove_descriptor(&job.id).await;
            return Ok(JobStatus::Aborted);
        }

        Ok(if entry.abort_requested {
            JobStatus::Aborting
        } else {
            JobStatus::Running
        })
    }

    async fn list_running_jobs(&self) -> DomainResult<Vec<Job>> {
        let mut children = self.children.lock().await;
        Ok(children
            .values_mut()
            .filter_map(|entry| {
                (!entry.abort_requested && !entry.has_exited()).then(|| entry.job.clone())
            })
            .collect())
    }
}
