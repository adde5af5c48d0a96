//! Application wiring: builds every component from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::infrastructure::account_repository::AccountRepository;
use crate::infrastructure::browser::{BrowserEngine, HttpBrowserEngine};
use crate::infrastructure::comment_shards::CommentShards;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::export_writer::JsonWorkbookWriter;
use crate::infrastructure::job_repository::{JobParametersRepository, JobRepository};
use crate::infrastructure::page_extractor::{AnswerPageExtractor, AnswerSelectors};
use crate::infrastructure::proxy_repository::{ProxyRepository, ProxySelector};
use crate::infrastructure::quota_repository::QuotaRepository;
use crate::infrastructure::record_repository::RecordRepository;
use crate::ingestion::{IngestionQueue, QueueConsumer};
use crate::orchestration::{BridgeConfig, Clock, OrchestrationBridge, SystemClock, TaskStateController, WorkerRegistry};
use crate::sampling::{ExportRunner, QuotaSampler};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

pub struct AppContext {
    pub config: AppConfig,
    pub database: DatabaseConnection,
    pub jobs: JobRepository,
    pub parameters: JobParametersRepository,
    pub records: RecordRepository,
    pub quotas: QuotaRepository,
    pub proxies: ProxyRepository,
    pub accounts: AccountRepository,
    pub shards: Arc<CommentShards>,
    pub queue: IngestionQueue,
    pub consumer: Arc<QueueConsumer>,
    pub registry: Arc<WorkerRegistry>,
    pub bridge: Arc<OrchestrationBridge>,
    pub exporter: Arc<ExportRunner>,
    pub export_writer: Arc<JsonWorkbookWriter>,
    pub controller: TaskStateController,
}

impl AppContext {
    /// Opens the configured database and wires the HTTP browser engine.
    pub async fn bootstrap(config: AppConfig) -> Result<Self> {
        let database = DatabaseConnection::new(&config.database.url, config.database.max_connections)
            .await
            .with_context(|| format!("failed to open database {}", config.database.url))?;
        database.migrate().await.context("failed to migrate database schema")?;
        Self::assemble(config, database, Arc::new(HttpBrowserEngine), Arc::new(SystemClock)).await
    }

    /// Wires every component over an already migrated database.
    pub async fn assemble(
        config: AppConfig,
        database: DatabaseConnection,
        engine: Arc<dyn BrowserEngine>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = database.pool().clone();
        let jobs = JobRepository::new(pool.clone());
        let parameters = JobParametersRepository::new(pool.clone());
        let records = RecordRepository::new(pool.clone());
        let quotas = QuotaRepository::new(pool.clone());
        let proxies = ProxyRepository::new(pool.clone());
        let accounts = AccountRepository::new(pool.clone());
        let shards = Arc::new(CommentShards::new(pool.clone()));
        let queue = IngestionQueue::new(pool, &config.ingestion);

        let consumer = Arc::new(QueueConsumer::new(
            queue.clone(),
            records.clone(),
            Arc::clone(&shards),
            &config.ingestion,
        ));

        let extractor = AnswerPageExtractor::new(&AnswerSelectors::default(), config.crawler.profile_base_url.clone())
            .context("failed to build page extractor")?;
        let registry = WorkerRegistry::shared();
        let bridge = Arc::new(
            OrchestrationBridge::new(
                jobs.clone(),
                Arc::clone(&registry),
                engine,
                queue.clone(),
                BridgeConfig::from(&config.crawler),
            )
            .with_extractor(Arc::new(extractor))
            .with_proxies(ProxySelector::shared(proxies.clone()))
            .with_accounts(accounts.clone())
            .with_clock(clock),
        );

        let export_writer = Arc::new(JsonWorkbookWriter::new(config.sampling.export_dir.clone()));
        let sampler = QuotaSampler::new(records.clone(), quotas.clone(), Arc::clone(&shards), config.sampling.seed);
        let exporter = Arc::new(ExportRunner::new(jobs.clone(), sampler, export_writer.clone()));
        let controller = TaskStateController::new(
            jobs.clone(),
            parameters.clone(),
            Arc::clone(&bridge),
            Arc::clone(&exporter),
        );

        let context = Self {
            config,
            database,
            jobs,
            parameters,
            records,
            quotas,
            proxies,
            accounts,
            shards,
            queue,
            consumer,
            registry,
            bridge,
            exporter,
            export_writer,
            controller,
        };
        context.restore_seen_set().await?;
        Ok(context)
    }

    /// Starts the background queue consumer.
    pub fn spawn_consumer(&self, token: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.consumer).spawn(token)
    }

    /// Stops every registered worker and waits for their bridges to let go.
    pub async fn shutdown(&self) {
        let stopping = self.registry.stop_all();
        if stopping > 0 {
            let timeout = self.config.crawler.shutdown_timeout();
            let waited = tokio::time::timeout(timeout, async {
                while !self.registry.is_empty() {
                    tokio::time::sleep(SHUTDOWN_POLL).await;
                }
            })
            .await;
            if waited.is_err() {
                warn!(remaining = ?self.registry.active_jobs(), "Workers still active at shutdown");
            }
        }
        self.database.close().await;
        info!(workers = stopping, "Application shut down");
    }

    async fn restore_seen_set(&self) -> Result<()> {
        if !self.queue.seen().is_empty().await? {
            return Ok(());
        }
        if self.records.count().await? == 0 {
            return Ok(());
        }
        let restored = self
            .queue
            .rebuild_seen_from_records()
            .await
            .context("failed to rebuild de-dup set")?;
        info!(restored, "De-dup set restored from records");
        Ok(())
    }
}
