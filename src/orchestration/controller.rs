//! External control surface for jobs: start, pause, resume, stop and delete.
//!
//! Every operation persists the new state first and only then signals the
//! worker, so the supervising bridge always observes the requested state.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::domain::{Job, JobKind, JobParameters, JobStatus, TaskError};
use crate::infrastructure::job_repository::{JobParametersRepository, JobRepository, Stamp};
use crate::orchestration::bridge::OrchestrationBridge;
use crate::sampling::ExportRunner;

const NOT_RUNNING: [JobStatus; 4] = [
    JobStatus::Waiting,
    JobStatus::Paused,
    JobStatus::Failed,
    JobStatus::Completed,
];

/// What a job needs to be dispatched.
enum Launch {
    Collection(JobParameters),
    Export,
}

pub struct TaskStateController {
    jobs: JobRepository,
    parameters: JobParametersRepository,
    bridge: Arc<OrchestrationBridge>,
    exporter: Arc<ExportRunner>,
}

impl TaskStateController {
    pub const fn new(
        jobs: JobRepository,
        parameters: JobParametersRepository,
        bridge: Arc<OrchestrationBridge>,
        exporter: Arc<ExportRunner>,
    ) -> Self {
        Self {
            jobs,
            parameters,
            bridge,
            exporter,
        }
    }

    pub async fn start(&self, job_id: i64) -> Result<Job, TaskError> {
        let job = self.jobs.require(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(invalid(&job, "start"));
        }
        let launch = self.prepare_launch(&job).await?;
        self.move_or_reject(job_id, &NOT_RUNNING, JobStatus::Running, Stamp::Start, "start")
            .await?;
        info!(job_id, kind = %job.kind, "Job started");
        self.dispatch(job_id, launch);
        self.jobs.require(job_id).await
    }

    pub async fn pause(&self, job_id: i64) -> Result<Job, TaskError> {
        self.move_or_reject(job_id, &[JobStatus::Running], JobStatus::Paused, Stamp::None, "pause")
            .await?;
        self.bridge.signal_stop(job_id);
        info!(job_id, "Job paused");
        self.jobs.require(job_id).await
    }

    pub async fn resume(&self, job_id: i64) -> Result<Job, TaskError> {
        let job = self.jobs.require(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(invalid(&job, "resume"));
        }
        let launch = self.prepare_launch(&job).await?;
        self.move_or_reject(job_id, &[JobStatus::Paused], JobStatus::Running, Stamp::None, "resume")
            .await?;
        info!(job_id, "Job resumed");
        self.dispatch(job_id, launch);
        self.jobs.require(job_id).await
    }

    /// Stops an active job. A job already at rest is returned unchanged.
    pub async fn stop(&self, job_id: i64) -> Result<Job, TaskError> {
        let job = self.jobs.require(job_id).await?;
        if job.status.is_at_rest() {
            return Ok(job);
        }
        let moved = self
            .jobs
            .transition(job_id, &[JobStatus::Waiting, JobStatus::Running], JobStatus::Paused, Stamp::End)
            .await?;
        if moved {
            self.bridge.signal_stop(job_id);
            info!(job_id, "Job stopped");
        }
        self.jobs.require(job_id).await
    }

    /// Deletes a job that is not running. Returns its last state.
    pub async fn delete(&self, job_id: i64) -> Result<Job, TaskError> {
        let job = self.jobs.require(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(TaskError::precondition(format!("job {job_id} is running; stop it before deleting")));
        }
        if !self.jobs.delete_unless_running(job_id).await? {
            return match self.jobs.get(job_id).await? {
                Some(_) => Err(TaskError::precondition(format!("job {job_id} started while being deleted"))),
                None => Err(TaskError::not_found("job", job_id)),
            };
        }
        info!(job_id, "Job deleted");
        Ok(job)
    }

    pub async fn get(&self, job_id: i64) -> Result<Job, TaskError> {
        self.jobs.require(job_id).await
    }

    async fn prepare_launch(&self, job: &Job) -> Result<Launch, TaskError> {
        match job.kind {
            JobKind::Export => Ok(Launch::Export),
            JobKind::Collection => {
                let params_id = job.parameters_id.ok_or_else(|| {
                    TaskError::precondition(format!("collection job {} has no parameters", job.id))
                })?;
                let params = self.parameters.get(params_id).await?.ok_or_else(|| {
                    TaskError::precondition(format!("parameters {params_id} of job {} no longer exist", job.id))
                })?;
                Ok(Launch::Collection(params))
            }
        }
    }

    async fn move_or_reject(
        &self,
        job_id: i64,
        from: &[JobStatus],
        to: JobStatus,
        stamp: Stamp,
        action: &'static str,
    ) -> Result<(), TaskError> {
        if self.jobs.transition(job_id, from, to, stamp).await? {
            return Ok(());
        }
        let job = self.jobs.require(job_id).await?;
        Err(invalid(&job, action))
    }

    fn dispatch(&self, job_id: i64, launch: Launch) {
        match launch {
            Launch::Collection(params) => {
                let bridge = Arc::clone(&self.bridge);
                tokio::spawn(async move {
                    match bridge.run(job_id, params).await {
                        Ok(outcome) => info!(job_id, outcome = ?outcome, "Crawl run finished"),
                        Err(e) => error!(job_id, error = %e, "Crawl run could not start"),
                    }
                });
            }
            Launch::Export => {
                let exporter = Arc::clone(&self.exporter);
                tokio::spawn(async move {
                    if let Err(e) = exporter.run_export(job_id).await {
                        warn!(job_id, error = %e, "Export run failed");
                    }
                });
            }
        }
    }
}

const fn invalid(job: &Job, action: &'static str) -> TaskError {
    TaskError::InvalidTransition {
        job_id: job.id,
        from: job.status,
        action,
    }
}
