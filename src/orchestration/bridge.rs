//! Runs one crawl worker per job in its own thread and runtime, and maps the
//! way it ended back onto the persisted job.
//!
//! The supervisor runs on the caller's runtime. It polls the job row, cancels
//! the worker once the row leaves `running`, forwards captured pages into the
//! ingestion queue and waits for the worker thread before deciding the
//! outcome. A job that names an account runs with that account's cookies;
//! an unknown, disabled or malformed account fails the run before launch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::{JobParameters, JobStatus, Proxy, SessionCookie, TaskError};
use crate::infrastructure::account_repository::AccountRepository;
use crate::infrastructure::browser::BrowserEngine;
use crate::infrastructure::config::CrawlerConfig;
use crate::infrastructure::job_repository::JobRepository;
use crate::infrastructure::page_extractor::PageExtractor;
use crate::infrastructure::proxy_repository::ProxySelector;
use crate::ingestion::IngestionQueue;
use crate::orchestration::registry::{WorkerRegistration, WorkerRegistry};
use crate::orchestration::worker::{
    CapturedPage, Clock, CrawlWorker, SystemClock, WorkerExit, WorkerReport, WorkerSettings, WorkerStats,
};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How often the supervisor re-reads the job row
    pub poll_interval: Duration,
    /// Wait for a cancelled worker before warning and waiting on
    pub shutdown_timeout: Duration,
    pub crawler: CrawlerConfig,
}

impl From<&CrawlerConfig> for BridgeConfig {
    fn from(crawler: &CrawlerConfig) -> Self {
        Self {
            poll_interval: crawler.supervisor_poll(),
            shutdown_timeout: crawler.shutdown_timeout(),
            crawler: crawler.clone(),
        }
    }
}

/// What the bridge did to the job once its worker was gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Worker stopped on request and the job was still marked running.
    Completed,
    /// Worker terminated itself; the job was marked failed with this message.
    Failed(String),
    /// Someone else moved the job first; its state was left untouched.
    Untouched(Option<JobStatus>),
}

pub struct OrchestrationBridge {
    jobs: JobRepository,
    registry: Arc<WorkerRegistry>,
    engine: Arc<dyn BrowserEngine>,
    extractor: Option<Arc<dyn PageExtractor>>,
    queue: IngestionQueue,
    proxies: Option<Arc<ProxySelector>>,
    accounts: Option<AccountRepository>,
    clock: Arc<dyn Clock>,
    config: BridgeConfig,
}

impl OrchestrationBridge {
    pub fn new(
        jobs: JobRepository,
        registry: Arc<WorkerRegistry>,
        engine: Arc<dyn BrowserEngine>,
        queue: IngestionQueue,
        config: BridgeConfig,
    ) -> Self {
        Self {
            jobs,
            registry,
            engine,
            extractor: None,
            queue,
            proxies: None,
            accounts: None,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    #[must_use]
    pub fn with_proxies(mut self, proxies: Arc<ProxySelector>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    #[must_use]
    pub fn with_accounts(mut self, accounts: AccountRepository) -> Self {
        self.accounts = Some(accounts);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub const fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Asks the worker of `job_id` to stop once its job row has left
    /// `running`. Returns false when none is running.
    pub fn signal_stop(&self, job_id: i64) -> bool {
        self.registry.request_stop(job_id)
    }

    /// Runs a worker for `job_id` until it ends, then applies the outcome.
    ///
    /// Fails without touching the job when another live worker already owns it.
    pub async fn run(&self, job_id: i64, params: JobParameters) -> Result<BridgeOutcome, TaskError> {
        let registration = self.claim_slot(job_id).await?;
        let cookies = match self.session_cookies(job_id).await {
            Ok(cookies) => cookies,
            Err(reason) => {
                return self.finish(job_id, registration, WorkerExit::InitFailed(reason), None, false).await;
            }
        };
        let proxy = self.select_proxy(job_id).await;
        let mut settings =
            WorkerSettings::from_parameters(&params, &self.config.crawler, proxy.as_ref().map(Proxy::url));
        settings.launch.cookies = cookies;

        let (capture_tx, mut captures) = mpsc::unbounded_channel();
        let mut worker = CrawlWorker::new(
            settings,
            Arc::clone(&self.engine),
            registration.control().token(),
            registration.control().state(),
        )
        .with_clock(Arc::clone(&self.clock));
        if let Some(extractor) = &self.extractor {
            worker = worker.with_capture(Arc::clone(extractor), capture_tx);
        }

        let (report_tx, mut report_rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name(format!("crawl-worker-{job_id}"))
            .spawn(move || {
                let report = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime.block_on(worker.run()),
                    Err(e) => WorkerReport {
                        exit: WorkerExit::InitFailed(format!("worker runtime: {e}")),
                        stats: WorkerStats::default(),
                    },
                };
                let _ = report_tx.send(report);
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                let exit = WorkerExit::InitFailed(format!("worker thread: {e}"));
                return self.finish(job_id, registration, exit, proxy.as_ref(), false).await;
            }
        };
        info!(job_id, target_url = %params.target_url, "Crawl job dispatched");

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut externally_stopped = false;
        let report = loop {
            tokio::select! {
                report = &mut report_rx => break report.ok(),
                _ = ticker.tick() => {
                    self.forward_captures(job_id, &mut captures).await;
                    match self.jobs.status(job_id).await {
                        Ok(Some(JobStatus::Running)) => {}
                        Ok(status) => {
                            info!(job_id, status = ?status, "Job left running state; stopping worker");
                            externally_stopped = true;
                            registration.control().stop();
                            break self.await_report(job_id, &mut report_rx).await;
                        }
                        Err(e) => warn!(job_id, error = %e, "Could not read job state"),
                    }
                }
            }
        };

        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => debug!(job_id, "Worker thread joined"),
            Ok(Err(_)) => error!(job_id, "Worker thread panicked outside its loop"),
            Err(e) => error!(job_id, error = %e, "Could not join worker thread"),
        }
        self.forward_captures(job_id, &mut captures).await;

        let exit = report.map_or_else(
            || WorkerExit::Crashed("worker ended without a report".to_string()),
            |report| {
                debug!(job_id, stats = ?report.stats, "Worker report received");
                report.exit
            },
        );
        self.finish(job_id, registration, exit, proxy.as_ref(), externally_stopped).await
    }

    /// Applies the outcome, then releases the registry slot.
    async fn finish(
        &self,
        job_id: i64,
        registration: WorkerRegistration,
        exit: WorkerExit,
        proxy: Option<&Proxy>,
        externally_stopped: bool,
    ) -> Result<BridgeOutcome, TaskError> {
        let externally_stopped = externally_stopped || registration.control().stopped_for_state_change();
        let outcome = self.apply_outcome(job_id, exit, proxy, externally_stopped).await;
        drop(registration);
        outcome
    }

    async fn apply_outcome(
        &self,
        job_id: i64,
        exit: WorkerExit,
        proxy: Option<&Proxy>,
        externally_stopped: bool,
    ) -> Result<BridgeOutcome, TaskError> {
        if externally_stopped {
            let status = self.jobs.status(job_id).await?;
            info!(job_id, status = ?status, "Crawl job stopped externally");
            return Ok(BridgeOutcome::Untouched(status));
        }

        if let (WorkerExit::ThresholdExceeded { .. }, Some(proxy), Some(selector)) = (&exit, proxy, &self.proxies) {
            if let Err(e) = selector.mark_failed(proxy.id).await {
                warn!(job_id, proxy_id = proxy.id, error = %e, "Could not deactivate proxy");
            }
        }

        match exit.into_error() {
            None => {
                if self.jobs.complete_if_running(job_id).await? {
                    info!(job_id, "Crawl job completed");
                    Ok(BridgeOutcome::Completed)
                } else {
                    Ok(BridgeOutcome::Untouched(self.jobs.status(job_id).await?))
                }
            }
            Some(err) => {
                let message = err.to_string();
                if self.jobs.fail_if_running(job_id, &message).await? {
                    error!(job_id, error = %message, "Crawl job failed");
                    Ok(BridgeOutcome::Failed(message))
                } else {
                    Ok(BridgeOutcome::Untouched(self.jobs.status(job_id).await?))
                }
            }
        }
    }

    /// A previous run of the same job may still be winding down after a
    /// pause; wait for it up to the shutdown timeout.
    async fn claim_slot(&self, job_id: i64) -> Result<WorkerRegistration, TaskError> {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let err = match self.registry.register(job_id) {
                Ok(registration) => return Ok(registration),
                Err(err) => err,
            };
            let Some(existing) = self.registry.get(job_id) else {
                continue;
            };
            if !existing.is_stopping() || Instant::now() >= deadline {
                return Err(err);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Cookies of the job's account; empty when the job names none.
    async fn session_cookies(&self, job_id: i64) -> Result<Vec<SessionCookie>, String> {
        let job = self.jobs.require(job_id).await.map_err(|e| e.to_string())?;
        let Some(account_id) = job.account_id else {
            return Ok(Vec::new());
        };
        let Some(accounts) = &self.accounts else {
            return Err(format!("account {account_id} cannot be loaded"));
        };
        let account = accounts
            .get(account_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("account {account_id} not found"))?;
        if !account.active {
            return Err(format!("account {} is disabled", account.name));
        }
        let cookies = account.session_cookies().map_err(|e| match e {
            TaskError::ResourceInitFailed(reason) => reason,
            other => other.to_string(),
        })?;
        debug!(job_id, account = %account.name, cookies = cookies.len(), "Account cookies loaded");
        Ok(cookies)
    }

    async fn select_proxy(&self, job_id: i64) -> Option<Proxy> {
        let selector = self.proxies.as_ref()?;
        match selector.select().await {
            Ok(proxy) => {
                if let Some(proxy) = &proxy {
                    debug!(job_id, proxy = %proxy.address, "Proxy selected");
                }
                proxy
            }
            Err(e) => {
                warn!(job_id, error = %e, "Proxy selection failed; connecting directly");
                None
            }
        }
    }

    async fn await_report(&self, job_id: i64, report_rx: &mut oneshot::Receiver<WorkerReport>) -> Option<WorkerReport> {
        match tokio::time::timeout(self.config.shutdown_timeout, &mut *report_rx).await {
            Ok(report) => report.ok(),
            Err(_) => {
                warn!(
                    job_id,
                    timeout_secs = self.config.shutdown_timeout.as_secs(),
                    "Worker did not stop in time; still waiting"
                );
                report_rx.await.ok()
            }
        }
    }

    async fn forward_captures(&self, job_id: i64, captures: &mut UnboundedReceiver<CapturedPage>) {
        while let Ok(captured) = captures.try_recv() {
            let submission = captured.page.into_submission(&captured.url, job_id);
            let payload = match serde_json::to_value(&submission) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(job_id, url = %captured.url, error = %e, "Could not encode captured page");
                    continue;
                }
            };
            match self.queue.submit(&captured.url, &payload).await {
                Ok(outcome) if outcome.already_known => debug!(job_id, url = %captured.url, "Captured page already known"),
                Ok(_) => debug!(job_id, url = %captured.url, "Captured page queued"),
                Err(e) => warn!(job_id, url = %captured.url, error = %e, "Could not queue captured page"),
            }
        }
    }
}
