//! Browser automation seam used by crawl workers.
//!
//! [`HttpBrowserEngine`] drives sessions over `reqwest` with a cookie jar
//! seeded from the job's account, an optional proxy and a per-session
//! request pacer.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use reqwest::cookie::Jar;
use reqwest::{Client, ClientBuilder, Url};
use thiserror::Error;
use tracing::debug;

use crate::domain::SessionCookie;
use crate::infrastructure::page_extractor::page_title;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Navigation to {url} timed out after {timeout_ms} ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Browser session is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Proxy URL such as `http://10.0.0.1:8080`
    pub proxy: Option<String>,
    pub user_agent: String,
    /// Minimum spacing between two requests of the session
    pub min_request_interval: Duration,
    /// Account cookies sent to every host the session visits
    pub cookies: Vec<SessionCookie>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            proxy: None,
            user_agent: crate::infrastructure::config::defaults::USER_AGENT.to_string(),
            min_request_interval: Duration::ZERO,
            cookies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitedPage {
    /// URL after redirects
    pub url: String,
    pub status: u16,
    pub title: String,
    pub html: String,
}

#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

#[async_trait]
pub trait BrowserSession: Send {
    async fn visit(&mut self, url: &str, timeout: Duration) -> Result<VisitedPage, BrowserError>;

    /// Releases the session. Calling it more than once is harmless.
    async fn close(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpBrowserEngine;

#[async_trait]
impl BrowserEngine for HttpBrowserEngine {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));

        let jar = Arc::new(Jar::default());
        let mut builder = ClientBuilder::new()
            .user_agent(&options.user_agent)
            .default_headers(headers)
            .cookie_provider(Arc::clone(&jar))
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10));
        if let Some(proxy) = &options.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| BrowserError::Launch(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| BrowserError::Launch(e.to_string()))?;

        let limiter = NonZeroU32::new(1)
            .and_then(|burst| Quota::with_period(options.min_request_interval).map(|q| q.allow_burst(burst)))
            .map(RateLimiter::direct);

        debug!(
            headless = options.headless,
            proxy = options.proxy.as_deref().unwrap_or("direct"),
            cookies = options.cookies.len(),
            "HTTP browser session launched"
        );
        Ok(Box::new(HttpSession {
            client: Some(client),
            limiter,
            jar,
            cookies: options.cookies.clone(),
            seeded_hosts: HashSet::new(),
        }))
    }
}

struct HttpSession {
    client: Option<Client>,
    limiter: Option<DefaultDirectRateLimiter>,
    jar: Arc<Jar>,
    cookies: Vec<SessionCookie>,
    seeded_hosts: HashSet<String>,
}

impl HttpSession {
    /// Account cookies go into the jar once per host, so cookies the site
    /// sets later are not overwritten.
    fn seed_cookies(&mut self, url: &Url) {
        let Some(host) = url.host_str() else {
            return;
        };
        if self.cookies.is_empty() || !self.seeded_hosts.insert(host.to_string()) {
            return;
        }
        for cookie in &self.cookies {
            self.jar.add_cookie_str(&cookie.header_value(), url);
        }
    }
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn visit(&mut self, url: &str, timeout: Duration) -> Result<VisitedPage, BrowserError> {
        if self.client.is_none() {
            return Err(BrowserError::Closed);
        }
        let parsed = Url::parse(url).map_err(|e| BrowserError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.seed_cookies(&parsed);
        let client = self.client.as_ref().ok_or(BrowserError::Closed)?;
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let navigation_error = |e: reqwest::Error| {
            if e.is_timeout() {
                BrowserError::Timeout {
                    url: url.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                BrowserError::Navigation {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = client
            .get(parsed)
            .timeout(timeout)
            .send()
            .await
            .map_err(navigation_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(BrowserError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let final_url = response.url().to_string();
        let html = response.text().await.map_err(navigation_error)?;

        Ok(VisitedPage {
            url: final_url,
            status: status.as_u16(),
            title: page_title(&html),
            html,
        })
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("HTTP browser session closed");
        }
    }
}
