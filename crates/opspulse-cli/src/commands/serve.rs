//! `opspulse serve` command implementation

use anyhow::Context;
use colored::Colorize;
use opspulse_monitoring::{DashboardServer, MonitoringStack};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::logging;
use crate::settings::AppConfig;

/// Execute the `opspulse serve` command
pub async fn run(
    config_path: Option<&Path>,
    verbose: bool,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let settings = AppConfig::load(config_path)
        .context("Failed to load configuration")?
        .with_overrides(host, port);
    let problems = settings.problems();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("{} {}", "✗".red(), problem);
        }
        anyhow::bail!(
            "Refusing to start: {} configuration problem(s) found",
            problems.len()
        );
    }
    logging::init(&settings.logging, verbose).context("Failed to initialize logging")?;

    info!(
        host = %settings.server.host,
        port = settings.server.port,
        interval_ms = settings.monitoring.collection_interval_ms,
        models = settings.pricing.models.len(),
        "OpsPulse configuration loaded"
    );

    let mut stack = MonitoringStack::new(settings.monitoring.clone(), settings.pricing.clone())
        .context("Failed to start monitoring")?;
    if let Some(dir) = &settings.logging.dir {
        stack = stack.with_log_dir(dir);
    }

    DashboardServer::new(settings.server.clone(), Arc::new(stack))
        .serve_with_shutdown(shutdown_signal())
        .await
        .context("Dashboard server failed")?;

    info!("OpsPulse stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
