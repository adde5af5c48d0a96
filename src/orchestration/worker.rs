//! Crawl worker: one browser session, one target, one cancellable loop.
//!
//! Each iteration checks the stop signal, then the hour window, then the
//! session age, visits the target and sleeps. The session is closed on every
//! exit path, panics included.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{Local, Timelike};
use futures::FutureExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{FailureResetPolicy, HourWindow, JobParameters, TaskError};
use crate::infrastructure::browser::{BrowserEngine, BrowserError, BrowserSession, LaunchOptions, VisitedPage};
use crate::infrastructure::config::CrawlerConfig;
use crate::infrastructure::page_extractor::{ExtractedPage, PageExtractor};

/// Source of the local hour used for window gating.
pub trait Clock: Send + Sync {
    fn current_hour(&self) -> u32;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_hour(&self) -> u32 {
        Local::now().hour()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub target_url: String,
    pub interval: Duration,
    pub restart_interval: Duration,
    pub window: HourWindow,
    pub max_exceptions: u32,
    pub reset_policy: FailureResetPolicy,
    pub visit_timeout: Duration,
    pub launch: LaunchOptions,
}

impl WorkerSettings {
    pub fn from_parameters(params: &JobParameters, crawler: &CrawlerConfig, proxy: Option<String>) -> Self {
        Self {
            target_url: params.target_url.clone(),
            interval: params.interval,
            restart_interval: params.restart_interval,
            window: params.window,
            max_exceptions: params.max_exceptions.max(1),
            reset_policy: crawler.failure_reset,
            visit_timeout: crawler.visit_timeout(),
            launch: LaunchOptions {
                headless: crawler.headless,
                proxy,
                user_agent: crawler.user_agent.clone(),
                min_request_interval: crawler.min_request_interval(),
                cookies: Vec::new(),
            },
        }
    }
}

/// Live counters shared with the supervisor.
#[derive(Debug, Default)]
pub struct WorkerState {
    running: AtomicBool,
    visits: AtomicU64,
    failed_visits: AtomicU64,
    consecutive_failures: AtomicU32,
    restarts: AtomicU32,
    skipped_ticks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub visits: u64,
    pub failed_visits: u64,
    pub consecutive_failures: u32,
    pub restarts: u32,
    /// Iterations spent outside the hour window
    pub skipped_ticks: u64,
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            visits: self.visits.load(Ordering::Relaxed),
            failed_visits: self.failed_visits.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
        }
    }
}

/// Why a worker loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    ThresholdExceeded { failures: u32, last_error: String },
    InitFailed(String),
    Crashed(String),
}

impl WorkerExit {
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    pub fn into_error(self) -> Option<TaskError> {
        match self {
            Self::Cancelled => None,
            Self::ThresholdExceeded { failures, last_error } => {
                Some(TaskError::ExceptionThresholdExceeded { failures, last_error })
            }
            Self::InitFailed(reason) => Some(TaskError::ResourceInitFailed(reason)),
            Self::Crashed(reason) => Some(TaskError::ResourceInitFailed(format!("crawl worker crashed: {reason}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub exit: WorkerExit,
    pub stats: WorkerStats,
}

/// A page the worker visited successfully, with its extracted fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPage {
    pub url: String,
    pub page: ExtractedPage,
}

pub struct CrawlWorker {
    settings: WorkerSettings,
    engine: Arc<dyn BrowserEngine>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
    state: Arc<WorkerState>,
    capture: Option<(Arc<dyn PageExtractor>, UnboundedSender<CapturedPage>)>,
}

impl CrawlWorker {
    pub fn new(
        settings: WorkerSettings,
        engine: Arc<dyn BrowserEngine>,
        token: CancellationToken,
        state: Arc<WorkerState>,
    ) -> Self {
        Self {
            settings,
            engine,
            clock: Arc::new(SystemClock),
            token,
            state,
            capture: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Successful visits are run through `extractor` and sent to `sink`.
    #[must_use]
    pub fn with_capture(mut self, extractor: Arc<dyn PageExtractor>, sink: UnboundedSender<CapturedPage>) -> Self {
        self.capture = Some((extractor, sink));
        self
    }

    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    pub async fn run(self) -> WorkerReport {
        self.state.running.store(true, Ordering::Release);
        info!(target_url = %self.settings.target_url, "Crawl worker started");

        let mut session: Option<Box<dyn BrowserSession>> = None;
        let exit = match AssertUnwindSafe(self.crawl_loop(&mut session)).catch_unwind().await {
            Ok(exit) => exit,
            Err(panic) => WorkerExit::Crashed(panic_message(panic.as_ref())),
        };

        if let Some(mut active) = session.take() {
            active.close().await;
        }
        self.state.running.store(false, Ordering::Release);

        let stats = self.state.snapshot();
        match &exit {
            WorkerExit::Cancelled => info!(visits = stats.visits, "Crawl worker stopped"),
            other => warn!(exit = ?other, visits = stats.visits, "Crawl worker terminated"),
        }
        WorkerReport { exit, stats }
    }

    async fn crawl_loop(&self, session: &mut Option<Box<dyn BrowserSession>>) -> WorkerExit {
        if self.token.is_cancelled() {
            return WorkerExit::Cancelled;
        }
        let mut session_started = match self.open_session(session).await {
            Ok(started) => started,
            Err(e) => return WorkerExit::InitFailed(e.to_string()),
        };

        loop {
            if self.token.is_cancelled() {
                return WorkerExit::Cancelled;
            }

            let hour = self.clock.current_hour();
            if !self.settings.window.contains(hour) {
                self.state.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                debug!(hour, window = ?self.settings.window, "Outside crawl window");
                if !self.pause().await {
                    return WorkerExit::Cancelled;
                }
                continue;
            }

            if session_started.elapsed() >= self.settings.restart_interval {
                info!("Restarting browser session");
                if let Some(mut old) = session.take() {
                    old.close().await;
                }
                session_started = match self.open_session(session).await {
                    Ok(started) => started,
                    Err(e) => return WorkerExit::InitFailed(e.to_string()),
                };
                self.state.consecutive_failures.store(0, Ordering::Relaxed);
                self.state.restarts.fetch_add(1, Ordering::Relaxed);
            }

            let Some(active) = session.as_mut() else {
                return WorkerExit::InitFailed("browser session unavailable".to_string());
            };
            let visit = tokio::select! {
                biased;
                () = self.token.cancelled() => return WorkerExit::Cancelled,
                result = active.visit(&self.settings.target_url, self.settings.visit_timeout) => result,
            };

            match visit {
                Ok(page) => {
                    self.state.visits.fetch_add(1, Ordering::Relaxed);
                    if self.settings.reset_policy == FailureResetPolicy::OnRestartOrSuccess {
                        self.state.consecutive_failures.store(0, Ordering::Relaxed);
                    }
                    debug!(title = %page.title, "Visited target");
                    self.capture(page);
                }
                Err(e) => {
                    self.state.failed_visits.fetch_add(1, Ordering::Relaxed);
                    let failures = self.state.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(failures, max = self.settings.max_exceptions, error = %e, "Visit failed");
                    if failures >= self.settings.max_exceptions {
                        return WorkerExit::ThresholdExceeded {
                            failures,
                            last_error: e.to_string(),
                        };
                    }
                }
            }

            if !self.pause().await {
                return WorkerExit::Cancelled;
            }
        }
    }

    async fn open_session(&self, slot: &mut Option<Box<dyn BrowserSession>>) -> Result<Instant, BrowserError> {
        let opened = self.engine.launch(&self.settings.launch).await?;
        *slot = Some(opened);
        Ok(Instant::now())
    }

    /// Sleeps one interval. Returns false when cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            () = self.token.cancelled() => false,
            () = tokio::time::sleep(self.settings.interval) => true,
        }
    }

    fn capture(&self, page: VisitedPage) {
        let Some((extractor, sink)) = &self.capture else {
            return;
        };
        let extracted = extractor.extract(&page.html);
        if extracted.is_empty() {
            debug!(url = %page.url, "Nothing extracted from page");
            return;
        }
        if sink.send(CapturedPage { url: page.url, page: extracted }).is_err() {
            debug!("Capture receiver is gone");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
