//! Configuration infrastructure
//!
//! Settings are layered: built-in defaults, an optional config file, then
//! environment variables prefixed with `QA_HARVESTER` using `__` between
//! sections, e.g. `QA_HARVESTER__INGESTION__BATCH_SIZE=20`.

#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::FailureResetPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {message}")]
    Validation { message: String },
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub ingestion: IngestionConfig,
    pub crawler: CrawlerConfig,
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection string, e.g. `sqlite://./crawler_management.db`
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = AppConfig::default_data_dir().join(defaults::DATABASE_FILE_NAME);
        Self {
            url: format!("sqlite://{}", path.display()),
            max_connections: defaults::DATABASE_MAX_CONNECTIONS,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level: "trace", "debug", "info", "warn" or "error"
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    /// Directory for log files. Defaults to `<data dir>/logs`.
    pub log_dir: Option<PathBuf>,
    /// Prefix of the daily rolled log file
    pub file_name: String,
    /// Per-target level overrides such as `qa_harvester_lib::ingestion = "debug"`
    pub module_filters: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            module_filters: BTreeMap::new(),
        }
    }
}

/// Ingestion queue and consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub queue_key: String,
    pub seen_set_key: String,
    pub recommendation_set_key: String,
    /// Items drained per consumer tick
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            queue_key: defaults::QUEUE_KEY.to_string(),
            seen_set_key: defaults::SEEN_SET_KEY.to_string(),
            recommendation_set_key: defaults::RECOMMENDATION_SET_KEY.to_string(),
            batch_size: defaults::CONSUMER_BATCH_SIZE,
            poll_interval_ms: defaults::CONSUMER_POLL_INTERVAL_MS,
        }
    }
}

impl IngestionConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Crawl worker and supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// How often the supervisor re-reads job state
    pub supervisor_poll_ms: u64,
    /// How long the supervisor waits for a stopped worker before logging and joining anyway
    pub shutdown_timeout_secs: u64,
    pub visit_timeout_ms: u64,
    /// Minimum spacing between two requests of one session
    pub min_request_interval_ms: u64,
    pub headless: bool,
    pub user_agent: String,
    pub failure_reset: FailureResetPolicy,
    /// Prefix for relative author profile links found on pages
    pub profile_base_url: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            supervisor_poll_ms: defaults::SUPERVISOR_POLL_MS,
            shutdown_timeout_secs: defaults::WORKER_SHUTDOWN_TIMEOUT_SECS,
            visit_timeout_ms: defaults::VISIT_TIMEOUT_MS,
            min_request_interval_ms: defaults::MIN_REQUEST_INTERVAL_MS,
            headless: true,
            user_agent: defaults::USER_AGENT.to_string(),
            failure_reset: FailureResetPolicy::default(),
            profile_base_url: defaults::PROFILE_BASE_URL.to_string(),
        }
    }
}

impl CrawlerConfig {
    pub const fn supervisor_poll(&self) -> Duration {
        Duration::from_millis(self.supervisor_poll_ms)
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub const fn visit_timeout(&self) -> Duration {
        Duration::from_millis(self.visit_timeout_ms)
    }

    pub const fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}

/// Quota sampling and export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Fixed seed for reproducible draws; random when absent
    pub seed: Option<u64>,
    pub export_dir: PathBuf,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            seed: None,
            export_dir: PathBuf::from(defaults::EXPORT_DIR),
        }
    }
}

impl AppConfig {
    /// Loads defaults, then `path` when given, then `QA_HARVESTER__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(defaults::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(invalid("database.url must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections must be greater than 0"));
        }
        if !(1..=defaults::MAX_BATCH_SIZE).contains(&self.ingestion.batch_size) {
            return Err(invalid(format!(
                "ingestion.batch_size must be within 1..={}, got {}",
                defaults::MAX_BATCH_SIZE,
                self.ingestion.batch_size
            )));
        }
        if self.ingestion.poll_interval_ms == 0 {
            return Err(invalid("ingestion.poll_interval_ms must be greater than 0"));
        }
        if self.ingestion.seen_set_key == self.ingestion.recommendation_set_key {
            return Err(invalid("ingestion set keys must differ"));
        }
        if self.crawler.supervisor_poll_ms == 0 {
            return Err(invalid("crawler.supervisor_poll_ms must be greater than 0"));
        }
        if self.crawler.visit_timeout_ms == 0 {
            return Err(invalid("crawler.visit_timeout_ms must be greater than 0"));
        }
        if !self.logging.console_output && !self.logging.file_output {
            return Err(invalid("logging needs console_output or file_output"));
        }
        Ok(())
    }

    /// Per-user data directory, falling back to the working directory.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|dir| dir.join(defaults::APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .log_dir
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join("logs"))
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

pub mod defaults {
    pub const APP_DIR_NAME: &str = "qa-harvester";
    pub const ENV_PREFIX: &str = "QA_HARVESTER";

    pub const DATABASE_FILE_NAME: &str = "crawler_management.db";
    pub const DATABASE_MAX_CONNECTIONS: u32 = 10;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "qa-harvester.log";

    pub const QUEUE_KEY: &str = "qa_crawler:queue";
    pub const SEEN_SET_KEY: &str = "qa_crawler:urls";
    pub const RECOMMENDATION_SET_KEY: &str = "recommendation:urls";
    pub const CONSUMER_BATCH_SIZE: usize = 10;
    pub const MAX_BATCH_SIZE: usize = 100;
    pub const CONSUMER_POLL_INTERVAL_MS: u64 = 3_000;

    pub const SUPERVISOR_POLL_MS: u64 = 1_000;
    pub const WORKER_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
    /// Page navigation timeout
    pub const VISIT_TIMEOUT_MS: u64 = 3_000;
    pub const MIN_REQUEST_INTERVAL_MS: u64 = 1_000;
    pub const USER_AGENT: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
    pub const PROFILE_BASE_URL: &str = "https://www.zhihu.com";

    pub const EXPORT_DIR: &str = "exports";
}
