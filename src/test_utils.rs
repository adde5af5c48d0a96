//! Test utilities shared by unit and integration tests.
//!
//! Provides an isolated in-memory database, a scripted browser engine and a
//! fixed clock so orchestration can be exercised without network access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::application::AppContext;
use crate::domain::{JobStatus, SessionCookie, TaskError};
use crate::infrastructure::browser::{BrowserEngine, BrowserError, BrowserSession, LaunchOptions, VisitedPage};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::job_repository::JobRepository;
use crate::infrastructure::DatabaseConnection;
use crate::orchestration::Clock;

/// Test database configuration
pub struct TestDatabase {
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    /// Create a new in-memory test database with the full schema
    pub async fn new() -> Result<Self> {
        let connection = DatabaseConnection::in_memory().await?;
        connection.migrate().await?;
        Ok(Self { connection })
    }

    /// Get the database pool for use in repositories
    pub fn pool(&self) -> sqlx::SqlitePool {
        self.connection.pool().clone()
    }
}

/// How one scripted visit ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitOutcome {
    Success,
    Failure(String),
    /// Never completes; only cancellation ends it
    Hang,
    Panic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptStats {
    pub launches: usize,
    pub visits: usize,
    pub closes: usize,
}

struct Script {
    outcomes: Mutex<VecDeque<VisitOutcome>>,
    fallback: VisitOutcome,
    failing_launches: AtomicUsize,
    html: String,
    launches: AtomicUsize,
    visits: AtomicUsize,
    closes: AtomicUsize,
    proxies: Mutex<Vec<Option<String>>>,
    cookies: Mutex<Vec<Vec<SessionCookie>>>,
}

impl Script {
    fn next_outcome(&self) -> VisitOutcome {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Browser engine whose visits follow a script, shared by every session it launches.
#[derive(Clone)]
pub struct ScriptedBrowserEngine {
    script: Arc<Script>,
}

impl ScriptedBrowserEngine {
    /// Every visit ends with `fallback` once the scripted outcomes run out.
    pub fn new(fallback: VisitOutcome) -> Self {
        Self {
            script: Arc::new(Script {
                outcomes: Mutex::new(VecDeque::new()),
                fallback,
                failing_launches: AtomicUsize::new(0),
                html: "<html><head><title>scripted</title></head><body></body></html>".to_string(),
                launches: AtomicUsize::new(0),
                visits: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                proxies: Mutex::new(Vec::new()),
                cookies: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn with_outcomes(self, outcomes: impl IntoIterator<Item = VisitOutcome>) -> Self {
        self.script
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(outcomes);
        self
    }

    /// The next `count` launches fail.
    #[must_use]
    pub fn failing_launches(self, count: usize) -> Self {
        self.script.failing_launches.store(count, Ordering::SeqCst);
        self
    }

    /// Body returned by successful visits. Must be set before the engine is shared.
    #[must_use]
    pub fn with_html(mut self, html: &str) -> Self {
        if let Some(script) = Arc::get_mut(&mut self.script) {
            script.html = html.to_string();
        }
        self
    }

    pub fn stats(&self) -> ScriptStats {
        ScriptStats {
            launches: self.script.launches.load(Ordering::SeqCst),
            visits: self.script.visits.load(Ordering::SeqCst),
            closes: self.script.closes.load(Ordering::SeqCst),
        }
    }

    /// Proxy passed to each launch, in launch order.
    pub fn launched_proxies(&self) -> Vec<Option<String>> {
        self.script.proxies.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Account cookies passed to each launch, in launch order.
    pub fn launched_cookies(&self) -> Vec<Vec<SessionCookie>> {
        self.script.cookies.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl BrowserEngine for ScriptedBrowserEngine {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError> {
        self.script.launches.fetch_add(1, Ordering::SeqCst);
        self.script
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(options.proxy.clone());
        self.script
            .cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(options.cookies.clone());
        let fail = self
            .script
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BrowserError::Launch("scripted launch failure".to_string()));
        }
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            open: true,
        }))
    }
}

struct ScriptedSession {
    script: Arc<Script>,
    open: bool,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn visit(&mut self, url: &str, _timeout: Duration) -> Result<VisitedPage, BrowserError> {
        if !self.open {
            return Err(BrowserError::Closed);
        }
        self.script.visits.fetch_add(1, Ordering::SeqCst);
        match self.script.next_outcome() {
            VisitOutcome::Success => Ok(VisitedPage {
                url: url.to_string(),
                status: 200,
                title: "scripted".to_string(),
                html: self.script.html.clone(),
            }),
            VisitOutcome::Failure(reason) => Err(BrowserError::Navigation {
                url: url.to_string(),
                reason,
            }),
            VisitOutcome::Hang => std::future::pending().await,
            VisitOutcome::Panic => panic!("scripted visit panic"),
        }
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            self.script.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Clock pinned to one local hour.
#[derive(Debug, Clone, Copy)]
pub struct FixedHourClock(pub u32);

impl Clock for FixedHourClock {
    fn current_hour(&self) -> u32 {
        self.0
    }
}

/// Configuration with millisecond cadences for tests.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.ingestion.poll_interval_ms = 20;
    config.crawler.supervisor_poll_ms = 10;
    config.crawler.shutdown_timeout_secs = 5;
    config.crawler.min_request_interval_ms = 0;
    config.sampling.seed = Some(7);
    config
}

/// Complete application over an in-memory database and a scripted browser.
pub struct TestContext {
    pub app: AppContext,
    pub engine: ScriptedBrowserEngine,
}

impl TestContext {
    pub async fn new(engine: ScriptedBrowserEngine) -> Result<Self> {
        Self::with_config(fast_config(), engine).await
    }

    pub async fn with_config(config: AppConfig, engine: ScriptedBrowserEngine) -> Result<Self> {
        let database = DatabaseConnection::in_memory().await?;
        database.migrate().await?;
        let app = AppContext::assemble(config, database, Arc::new(engine.clone()), Arc::new(FixedHourClock(12))).await?;
        Ok(Self { app, engine })
    }
}

/// Polls the job row until it reads `status`. Returns the last status seen.
pub async fn wait_for_status(
    jobs: &JobRepository,
    job_id: i64,
    status: JobStatus,
    timeout: Duration,
) -> Result<Option<JobStatus>, TaskError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = jobs.status(job_id).await?;
        if current == Some(status) || tokio::time::Instant::now() >= deadline {
            return Ok(current);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Helper macros for common test patterns
#[macro_export]
macro_rules! test_db {
    () => {{ $crate::test_utils::TestDatabase::new().await.expect("Failed to create test database") }};
}
