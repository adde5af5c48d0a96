#![allow(missing_docs)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use qa_harvester_lib::AppContext;
use qa_harvester_lib::infrastructure::logging::{init_logging_with_config, log_system_info};
use qa_harvester_lib::infrastructure::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    init_logging_with_config(&config.logging, &config.log_dir()).context("failed to initialise logging")?;
    log_system_info();

    let app = AppContext::bootstrap(config).await?;
    let token = CancellationToken::new();
    let consumer = app.spawn_consumer(token.clone());
    info!("qa-harvester is running; press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not listen for Ctrl-C");
    }
    info!("Shutdown requested");

    token.cancel();
    if let Err(e) = consumer.await {
        error!(error = %e, "Queue consumer task ended abnormally");
    }
    app.shutdown().await;
    Ok(())
}
