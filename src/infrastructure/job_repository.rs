//! Job and job-parameter persistence.
//!
//! Status changes are compare-and-set updates: each transition names the
//! states it may leave, so a controller request and a supervising bridge can
//! never both win the same transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::domain::{
    HourWindow, Job, JobKind, JobParameters, JobStatus, NewJob, NewJobParameters, TaskError,
};

const JOB_COLUMNS: &str = "id, name, kind, status, start_time, end_time, error_message, retry_count, progress, parameters_id, account_id, created_at";

/// Which timestamp a transition writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    None,
    Start,
    End,
}

#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, job: &NewJob) -> Result<Job, TaskError> {
        let result = sqlx::query(
            "INSERT INTO jobs (name, kind, status, parameters_id, account_id, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.name)
        .bind(job.kind.as_str())
        .bind(JobStatus::Waiting.code())
        .bind(job.parameters_id)
        .bind(job.account_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.require(result.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Job>, TaskError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn require(&self, id: i64) -> Result<Job, TaskError> {
        self.get(id).await?.ok_or_else(|| TaskError::not_found("job", id))
    }

    /// Newest first.
    pub async fn list(&self, offset: i64, limit: i64) -> Result<Vec<Job>, TaskError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn status(&self, id: i64) -> Result<Option<JobStatus>, TaskError> {
        let code: Option<i64> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        code.map(decode_status).transpose()
    }

    /// Moves the job to `to` when it is currently in one of `from`.
    /// Returns whether the row changed.
    pub async fn transition(
        &self,
        id: i64,
        from: &[JobStatus],
        to: JobStatus,
        stamp: Stamp,
    ) -> Result<bool, TaskError> {
        let stamp_clause = match stamp {
            Stamp::None => "",
            Stamp::Start => ", start_time = ?",
            Stamp::End => ", end_time = ?",
        };
        let sql = format!(
            "UPDATE jobs SET status = ?{stamp_clause} WHERE id = ? AND status IN ({})",
            status_list(from)
        );
        let mut query = sqlx::query(&sql).bind(to.code());
        if stamp != Stamp::None {
            query = query.bind(Utc::now());
        }
        let result = query.bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records a failed run: status failed, error text, end time and one more retry.
    pub async fn fail_if_running(&self, id: i64, error_message: &str) -> Result<bool, TaskError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, error_message = ?, end_time = ?, retry_count = retry_count + 1 \
             WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Failed.code())
        .bind(error_message)
        .bind(Utc::now())
        .bind(id)
        .bind(JobStatus::Running.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn complete_if_running(&self, id: i64) -> Result<bool, TaskError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, end_time = ?, progress = 100 WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Completed.code())
        .bind(Utc::now())
        .bind(id)
        .bind(JobStatus::Running.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_progress(&self, id: i64, progress: i64) -> Result<(), TaskError> {
        sqlx::query("UPDATE jobs SET progress = ? WHERE id = ?")
            .bind(progress.clamp(0, 100))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes the job unless it is running. Returns false when the job
    /// was running at the time of the delete.
    pub async fn delete_unless_running(&self, id: i64) -> Result<bool, TaskError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND status != ?")
            .bind(id)
            .bind(JobStatus::Running.code())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn status_list(states: &[JobStatus]) -> String {
    states
        .iter()
        .map(|s| s.code().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_status(code: i64) -> Result<JobStatus, TaskError> {
    JobStatus::from_code(code)
        .ok_or_else(|| TaskError::PersistenceFailed(format!("unknown job status code {code}")))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, TaskError> {
    let kind: String = row.try_get("kind")?;
    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: kind
            .parse::<JobKind>()
            .map_err(|e| TaskError::PersistenceFailed(e.to_string()))?,
        status: decode_status(row.try_get("status")?)?,
        start_time: row.try_get::<Option<DateTime<Utc>>, _>("start_time")?,
        end_time: row.try_get::<Option<DateTime<Utc>>, _>("end_time")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        progress: row.try_get("progress")?,
        parameters_id: row.try_get("parameters_id")?,
        account_id: row.try_get("account_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct JobParametersRepository {
    pool: SqlitePool,
}

impl JobParametersRepository {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, params: &NewJobParameters) -> Result<JobParameters, TaskError> {
        params.validate()?;
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO job_parameters
                (target_url, interval_ms, restart_interval_ms, window_start, window_end, max_exceptions, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&params.target_url)
        .bind(params.interval.as_millis() as i64)
        .bind(params.restart_interval.as_millis() as i64)
        .bind(i64::from(params.window.start))
        .bind(i64::from(params.window.end))
        .bind(i64::from(params.max_exceptions))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get(id).await?.ok_or_else(|| TaskError::not_found("job parameters", id))
    }

    pub async fn get(&self, id: i64) -> Result<Option<JobParameters>, TaskError> {
        let row = sqlx::query(
            "SELECT id, target_url, interval_ms, restart_interval_ms, window_start, window_end, max_exceptions \
             FROM job_parameters WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parameters_from_row(&r)).transpose()
    }

    pub async fn update(&self, id: i64, params: &NewJobParameters) -> Result<JobParameters, TaskError> {
        params.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE job_parameters SET
                target_url = ?, interval_ms = ?, restart_interval_ms = ?,
                window_start = ?, window_end = ?, max_exceptions = ?, updated_at = ?
            WHERE id = ?
              AND NOT EXISTS (SELECT 1 FROM jobs WHERE parameters_id = ? AND status = ?)
            "#,
        )
        .bind(&params.target_url)
        .bind(params.interval.as_millis() as i64)
        .bind(params.restart_interval.as_millis() as i64)
        .bind(i64::from(params.window.start))
        .bind(i64::from(params.window.end))
        .bind(i64::from(params.max_exceptions))
        .bind(Utc::now())
        .bind(id)
        .bind(id)
        .bind(JobStatus::Running.code())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.unchanged_reason(id).await);
        }
        self.get(id).await?.ok_or_else(|| TaskError::not_found("job parameters", id))
    }

    /// Parameters attached to a running job can be neither updated nor deleted.
    pub async fn delete(&self, id: i64) -> Result<bool, TaskError> {
        let result = sqlx::query(
            "DELETE FROM job_parameters WHERE id = ? \
             AND NOT EXISTS (SELECT 1 FROM jobs WHERE parameters_id = ? AND status = ?)",
        )
        .bind(id)
        .bind(id)
        .bind(JobStatus::Running.code())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.unchanged_reason(id).await {
            TaskError::NotFound { .. } => Ok(false),
            other => Err(other),
        }
    }

    pub async fn in_use_by_running_job(&self, id: i64) -> Result<bool, TaskError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE parameters_id = ? AND status = ? LIMIT 1")
            .bind(id)
            .bind(JobStatus::Running.code())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn unchanged_reason(&self, id: i64) -> TaskError {
        match self.get(id).await {
            Ok(None) => TaskError::not_found("job parameters", id),
            Ok(Some(_)) => match self.in_use_by_running_job(id).await {
                Ok(true) => TaskError::precondition(format!("job parameters {id} are attached to a running job")),
                Ok(false) => TaskError::precondition(format!("job parameters {id} changed concurrently")),
                Err(e) => e,
            },
            Err(e) => e,
        }
    }
}

fn parameters_from_row(row: &SqliteRow) -> Result<JobParameters, TaskError> {
    let millis = |column: &str| -> Result<Duration, TaskError> {
        let value: i64 = row.try_get(column)?;
        Ok(Duration::from_millis(value.max(0) as u64))
    };
    let hour = |column: &str| -> Result<u32, TaskError> {
        let value: i64 = row.try_get(column)?;
        Ok(value.clamp(0, 24) as u32)
    };
    let max_exceptions: i64 = row.try_get("max_exceptions")?;
    Ok(JobParameters {
        id: row.try_get("id")?,
        target_url: row.try_get("target_url")?,
        interval: millis("interval_ms")?,
        restart_interval: millis("restart_interval_ms")?,
        window: HourWindow {
            start: hour("window_start")?,
            end: hour("window_end")?,
        },
        max_exceptions: max_exceptions.max(1) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDatabase;

    async fn setup() -> (TestDatabase, JobRepository, JobParametersRepository) {
        let db = TestDatabase::new().await.unwrap();
        let jobs = JobRepository::new(db.pool());
        let params = JobParametersRepository::new(db.pool());
        (db, jobs, params)
    }

    #[tokio::test]
    async fn test_create_job_starts_waiting() {
        let (_db, jobs, params) = setup().await;
        let p = params
            .create(&NewJobParameters::for_target("https://www.zhihu.com/question/1"))
            .await
            .unwrap();
        let job = jobs.create(&NewJob::collection("daily", p.id)).await.unwrap();

        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.kind, JobKind::Collection);
        assert_eq!(job.parameters_id, Some(p.id));
        assert_eq!(job.retry_count, 0);
        assert!(job.start_time.is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (_db, jobs, _params) = setup().await;
        let job = jobs.create(&NewJob::export("export")).await.unwrap();

        assert!(jobs
            .transition(job.id, &[JobStatus::Waiting], JobStatus::Running, Stamp::Start)
            .await
            .unwrap());
        assert!(!jobs
            .transition(job.id, &[JobStatus::Waiting], JobStatus::Running, Stamp::Start)
            .await
            .unwrap());

        let job = jobs.require(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.start_time.is_some());
    }

    #[tokio::test]
    async fn test_fail_increments_retry_count() {
        let (_db, jobs, _params) = setup().await;
        let job = jobs.create(&NewJob::export("export")).await.unwrap();
        jobs.transition(job.id, &[JobStatus::Waiting], JobStatus::Running, Stamp::Start)
            .await
            .unwrap();

        assert!(jobs.fail_if_running(job.id, "browser crashed").await.unwrap());
        assert!(!jobs.fail_if_running(job.id, "again").await.unwrap());

        let job = jobs.require(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("browser crashed"));
        assert_eq!(job.retry_count, 1);
        assert!(job.end_time.is_some());
    }

    #[tokio::test]
    async fn test_complete_sets_full_progress() {
        let (_db, jobs, _params) = setup().await;
        let job = jobs.create(&NewJob::export("export")).await.unwrap();
        assert!(!jobs.complete_if_running(job.id).await.unwrap());

        jobs.transition(job.id, &[JobStatus::Waiting], JobStatus::Running, Stamp::Start)
            .await
            .unwrap();
        assert!(jobs.complete_if_running(job.id).await.unwrap());
        let job = jobs.require(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn test_delete_refuses_running_job() {
        let (_db, jobs, _params) = setup().await;
        let job = jobs.create(&NewJob::export("export")).await.unwrap();
        jobs.transition(job.id, &[JobStatus::Waiting], JobStatus::Running, Stamp::Start)
            .await
            .unwrap();

        assert!(!jobs.delete_unless_running(job.id).await.unwrap());
        jobs.transition(job.id, &[JobStatus::Running], JobStatus::Paused, Stamp::End)
            .await
            .unwrap();
        assert!(jobs.delete_unless_running(job.id).await.unwrap());
        assert!(jobs.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parameters_round_trip() {
        let (_db, _jobs, params) = setup().await;
        let mut new = NewJobParameters::for_target("https://www.zhihu.com/question/2");
        new.window = HourWindow::new(8, 20).unwrap();
        new.max_exceptions = 5;
        let created = params.create(&new).await.unwrap();
        assert_eq!(created.window, HourWindow { start: 8, end: 20 });
        assert_eq!(created.interval, Duration::from_secs(5));
        assert_eq!(created.max_exceptions, 5);

        new.interval = Duration::from_secs(30);
        let updated = params.update(created.id, &new).await.unwrap();
        assert_eq!(updated.interval, Duration::from_secs(30));

        assert!(matches!(
            params.update(9999, &new).await,
            Err(TaskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_parameters_of_running_job_are_locked() {
        let (_db, jobs, params) = setup().await;
        let mut new = NewJobParameters::for_target("https://www.zhihu.com/question/4");
        let p = params.create(&new).await.unwrap();
        let job = jobs.create(&NewJob::collection("locked", p.id)).await.unwrap();
        jobs.transition(job.id, &[JobStatus::Waiting], JobStatus::Running, Stamp::Start)
            .await
            .unwrap();

        new.interval = Duration::from_secs(60);
        assert!(matches!(
            params.update(p.id, &new).await,
            Err(TaskError::PreconditionFailed(_))
        ));
        assert!(matches!(params.delete(p.id).await, Err(TaskError::PreconditionFailed(_))));
        assert_eq!(params.get(p.id).await.unwrap().unwrap().interval, Duration::from_secs(5));

        jobs.transition(job.id, &[JobStatus::Running], JobStatus::Paused, Stamp::End)
            .await
            .unwrap();
        assert_eq!(params.update(p.id, &new).await.unwrap().interval, Duration::from_secs(60));
        assert!(!params.delete(9999).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_parameters_are_rejected() {
        let (_db, _jobs, params) = setup().await;
        let mut new = NewJobParameters::for_target("https://www.zhihu.com/question/3");
        new.max_exceptions = 0;
        assert!(matches!(
            params.create(&new).await,
            Err(TaskError::PreconditionFailed(_))
        ));
    }
}
