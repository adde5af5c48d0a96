//! Job records, lifecycle states and crawl parameters.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::TaskError;

/// What a job runs when it is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Drives a crawl worker against a target page.
    Collection,
    /// Samples persisted records and writes an export file.
    Export,
}

impl JobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Export => "export",
        }
    }
}

impl FromStr for JobKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collection" | "crawler" => Ok(Self::Collection),
            "export" | "exporter" => Ok(Self::Export),
            other => Err(TaskError::precondition(format!("unknown job kind '{other}'"))),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job. The numeric codes are the persisted representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Running,
    Paused,
    Failed,
    Completed,
}

impl JobStatus {
    pub const fn code(self) -> i64 {
        match self {
            Self::Waiting => 0,
            Self::Running => 1,
            Self::Paused => 2,
            Self::Failed => 3,
            Self::Completed => 4,
        }
    }

    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Waiting),
            1 => Some(Self::Running),
            2 => Some(Self::Paused),
            3 => Some(Self::Failed),
            4 => Some(Self::Completed),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Paused, failed and completed jobs are at rest; stopping them again is a no-op.
    pub const fn is_at_rest(self) -> bool {
        matches!(self, Self::Paused | Self::Failed | Self::Completed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted collection or export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub progress: i64,
    pub parameters_id: Option<i64>,
    /// Account whose cookies are loaded into the crawl session
    pub account_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub kind: JobKind,
    pub parameters_id: Option<i64>,
    pub account_id: Option<i64>,
}

impl NewJob {
    pub fn collection(name: impl Into<String>, parameters_id: impl Into<Option<i64>>) -> Self {
        Self {
            name: name.into(),
            kind: JobKind::Collection,
            parameters_id: parameters_id.into(),
            account_id: None,
        }
    }

    pub fn export(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: JobKind::Export,
            parameters_id: None,
            account_id: None,
        }
    }

    #[must_use]
    pub const fn with_account(mut self, account_id: i64) -> Self {
        self.account_id = Some(account_id);
        self
    }
}

/// Allowed local hours `[start, end)` during which a worker may visit its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub const ALL_DAY: Self = Self { start: 0, end: 24 };

    pub fn new(start: u32, end: u32) -> Result<Self, TaskError> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.start >= self.end || self.end > 24 {
            return Err(TaskError::precondition(format!(
                "hour window [{}, {}) must satisfy start < end <= 24",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub const fn contains(&self, hour: u32) -> bool {
        self.start <= hour && hour < self.end
    }
}

impl Default for HourWindow {
    fn default() -> Self {
        Self::ALL_DAY
    }
}

/// When the consecutive-failure counter of a crawl worker goes back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureResetPolicy {
    /// Only a browser session restart clears the counter.
    #[default]
    OnRestart,
    /// A restart or any successful visit clears the counter.
    OnRestartOrSuccess,
}

/// Crawl parameters attached to a collection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub id: i64,
    pub target_url: String,
    pub interval: Duration,
    pub restart_interval: Duration,
    pub window: HourWindow,
    pub max_exceptions: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJobParameters {
    pub target_url: String,
    pub interval: Duration,
    pub restart_interval: Duration,
    pub window: HourWindow,
    pub max_exceptions: u32,
}

impl NewJobParameters {
    pub fn for_target(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            interval: Duration::from_secs(5),
            restart_interval: Duration::from_secs(3600),
            window: HourWindow::ALL_DAY,
            max_exceptions: 3,
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        url::Url::parse(&self.target_url).map_err(|e| {
            TaskError::precondition(format!("target url '{}' is invalid: {e}", self.target_url))
        })?;
        if self.interval.is_zero() {
            return Err(TaskError::precondition("interval must be greater than zero"));
        }
        if self.restart_interval.is_zero() {
            return Err(TaskError::precondition("restart interval must be greater than zero"));
        }
        if self.max_exceptions == 0 {
            return Err(TaskError::precondition("max_exceptions must be at least 1"));
        }
        self.window.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(JobStatus::Waiting, 0)]
    #[case(JobStatus::Running, 1)]
    #[case(JobStatus::Paused, 2)]
    #[case(JobStatus::Failed, 3)]
    #[case(JobStatus::Completed, 4)]
    fn status_codes_are_stable(#[case] status: JobStatus, #[case] code: i64) {
        assert_eq!(status.code(), code);
        assert_eq!(JobStatus::from_code(code), Some(status));
    }

    #[test]
    fn unknown_status_code_is_rejected() {
        assert_eq!(JobStatus::from_code(5), None);
        assert_eq!(JobStatus::from_code(-1), None);
    }

    #[test]
    fn collection_job_takes_optional_parameters() {
        assert_eq!(NewJob::collection("a", 7).parameters_id, Some(7));
        assert_eq!(NewJob::collection("b", Some(8)).parameters_id, Some(8));
        assert_eq!(NewJob::collection("c", None).parameters_id, None);
        assert_eq!(NewJob::export("d").kind, JobKind::Export);
        assert_eq!(NewJob::collection("e", 9).with_account(3).account_id, Some(3));
    }

    #[test]
    fn hour_window_is_half_open() {
        let window = HourWindow::new(8, 18).unwrap();
        assert!(!window.contains(7));
        assert!(window.contains(8));
        assert!(window.contains(17));
        assert!(!window.contains(18));
        assert!(HourWindow::ALL_DAY.contains(23));
    }

    #[rstest]
    #[case(10, 10)]
    #[case(12, 3)]
    #[case(0, 25)]
    fn invalid_hour_windows(#[case] start: u32, #[case] end: u32) {
        assert!(matches!(
            HourWindow::new(start, end),
            Err(TaskError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn parameter_validation() {
        let params = NewJobParameters::for_target("https://www.zhihu.com/question/1");
        assert!(params.validate().is_ok());

        let mut no_retries = params.clone();
        no_retries.max_exceptions = 0;
        assert!(no_retries.validate().is_err());

        let mut bad_url = params.clone();
        bad_url.target_url = "not a url".into();
        assert!(bad_url.validate().is_err());

        let mut zero_interval = params;
        zero_interval.interval = Duration::ZERO;
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn job_kind_parses_legacy_names() {
        assert_eq!("crawler".parse::<JobKind>().unwrap(), JobKind::Collection);
        assert_eq!("export".parse::<JobKind>().unwrap(), JobKind::Export);
        assert!("unknown".parse::<JobKind>().is_err());
    }
}
