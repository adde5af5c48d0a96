//! Logging system configuration and initialization
//!
//! - Console output and optional daily rolled log files
//! - Optional structured JSON lines
//! - Noisy dependency targets are held at `warn`/`info` unless the base level is `trace`
//! - Local time stamps

#![allow(clippy::uninlined_format_args)]

use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use lazy_static::lazy_static;
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::Directive,
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

// Keeps the non-blocking file writer alive for the life of the process
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>> = Mutex::new(Vec::new());
}

/// Dependency targets that are only interesting at trace level.
const QUIET_TARGETS: &[&str] = &[
    "sqlx::query=warn",
    "sqlx::sqlite=warn",
    "sqlx::migrate=info",
    "reqwest=info",
    "hyper=warn",
    "hyper_util=warn",
    "h2=warn",
    "html5ever=warn",
    "selectors=warn",
    "tokio=info",
    "runtime=warn",
];

struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Builds the filter used by [`init_logging_with_config`]. `RUST_LOG` wins when set.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log level '{}'", config.level))?;

    if !config.level.eq_ignore_ascii_case("trace") {
        for quiet in QUIET_TARGETS {
            filter = filter.add_directive(parse_directive(quiet)?);
        }
    }
    filter = filter.add_directive(parse_directive(&format!("qa_harvester_lib={}", config.level))?);
    for (target, level) in &config.module_filters {
        filter = filter.add_directive(parse_directive(&format!("{target}={level}"))?);
    }
    Ok(filter)
}

fn parse_directive(raw: &str) -> Result<Directive> {
    raw.parse::<Directive>()
        .map_err(|e| anyhow!("invalid log directive '{}': {}", raw, e))
}

/// Initialize logging with custom configuration
///
/// Override filtering with `RUST_LOG`, for example
/// `RUST_LOG="debug,sqlx::query=debug"` to see every statement.
pub fn init_logging_with_config(config: &LoggingConfig, log_dir: &std::path::Path) -> Result<()> {
    let env_filter = build_env_filter(config)?;
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.file_output {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
        let file_appender = rolling::daily(log_dir, &config.file_name);
        let (file_writer, file_guard) = non_blocking(file_appender);
        LOG_GUARDS
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(file_guard);

        let file_layer = fmt::Layer::new()
            .with_writer(file_writer)
            .with_timer(LocalTimeFormatter)
            .with_ansi(false);
        if config.json_format {
            layers.push(
                file_layer
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .boxed(),
            );
        } else {
            layers.push(file_layer.with_target(false).boxed());
        }
    }

    if config.console_output {
        let console_layer = fmt::Layer::new()
            .with_writer(std::io::stdout)
            .with_timer(LocalTimeFormatter)
            .with_target(false);
        if config.json_format && !config.file_output {
            layers.push(console_layer.json().boxed());
        } else {
            layers.push(console_layer.boxed());
        }
    }

    if layers.is_empty() {
        return Err(anyhow!("No logging output configured"));
    }

    Registry::default()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    info!("JSON format: {}", config.json_format);
    info!("Console output: {}", config.console_output);
    if config.file_output {
        info!("Log directory: {:?}", log_dir);
    }
    Ok(())
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== qa-harvester system information ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
    info!("========================================");
}
