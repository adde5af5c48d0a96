//! Infrastructure layer: configuration, logging, SQLite persistence and the
//! browser, extraction and export collaborators.

pub mod account_repository;
pub mod browser;
pub mod comment_shards;
pub mod config; // Layered application configuration
pub mod database_connection;
pub mod export_writer;
pub mod job_repository;
pub mod logging; // Logging infrastructure
pub mod page_extractor;
pub mod proxy_repository;
pub mod quota_repository;
pub mod record_repository;

// Re-export commonly used items
pub use account_repository::AccountRepository;
pub use browser::{BrowserEngine, BrowserError, BrowserSession, HttpBrowserEngine, LaunchOptions, VisitedPage};
pub use comment_shards::{CommentShards, ShardHandle};
pub use config::{AppConfig, ConfigError};
pub use database_connection::DatabaseConnection;
pub use export_writer::{ExportFile, ExportWriter, JsonWorkbookWriter};
pub use job_repository::{JobParametersRepository, JobRepository, Stamp};
pub use logging::init_logging_with_config;
pub use page_extractor::{AnswerPageExtractor, AnswerSelectors, ExtractedPage, PageExtractor};
pub use proxy_repository::{ProxyRepository, ProxySelector};
pub use quota_repository::QuotaRepository;
pub use record_repository::{PersistOutcome, RecordRepository};
