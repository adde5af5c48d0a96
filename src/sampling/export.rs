//! Export jobs: sample, write, then record the outcome on the job row.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::TaskError;
use crate::infrastructure::export_writer::ExportWriter;
use crate::infrastructure::job_repository::JobRepository;
use crate::sampling::sampler::QuotaSampler;

pub struct ExportRunner {
    jobs: JobRepository,
    sampler: QuotaSampler,
    writer: Arc<dyn ExportWriter>,
}

impl ExportRunner {
    pub fn new(jobs: JobRepository, sampler: QuotaSampler, writer: Arc<dyn ExportWriter>) -> Self {
        Self { jobs, sampler, writer }
    }

    /// Runs the export for `job_id` and returns the written file.
    ///
    /// The job is marked completed on success and failed with the error text
    /// otherwise. Either update only applies while the job is still running.
    pub async fn run_export(&self, job_id: i64) -> Result<PathBuf, TaskError> {
        self.jobs.require(job_id).await?;

        match self.export(job_id).await {
            Ok(path) => {
                self.jobs.complete_if_running(job_id).await?;
                info!(job_id, path = %path.display(), "Export job completed");
                Ok(path)
            }
            Err(err) => {
                if let Err(mark) = self.jobs.fail_if_running(job_id, &err.to_string()).await {
                    warn!(job_id, error = %mark, "Could not record export failure");
                }
                Err(err)
            }
        }
    }

    async fn export(&self, job_id: i64) -> Result<PathBuf, TaskError> {
        let sheets = self.sampler.sample().await?;
        if sheets.is_empty() {
            return Err(TaskError::precondition("no records matched the configured quotas"));
        }
        self.jobs.set_progress(job_id, 50).await?;
        self.writer.write(&sheets).await
    }
}
