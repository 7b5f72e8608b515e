//! hpcmon - HPC job efficiency monitor
//!
//! Runs one monitoring session on this node, serves health and the live
//! snapshot over HTTP while it runs, and writes the final JSON report.

use anyhow::{Context, Result};
use hpcmon::api::{self, AppState};
use hpcmon::config::{AppConfig, LogFormat, LoggingConfig};
use hpcmon_lib::{HealthRegistry, MonitoringSession, SessionBuilder, SessionStatus};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so a report on stdout stays parseable
    match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

fn write_report(session: &MonitoringSession, path: Option<&Path>) -> Result<()> {
    let json = session
        .to_json_pretty()
        .context("Failed to serialize session report")?;
    match path {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging);

    info!(
        version = VERSION,
        target = %config.monitor.session.target,
        duration_secs = ?config.monitor.session.duration_secs,
        "Starting hpcmon"
    );

    let health = HealthRegistry::new();
    let handle = SessionBuilder::new(config.monitor.clone())
        .health(health.clone())
        .start()
        .await
        .context("Failed to start monitoring session")?;

    let api_task = config.api.enabled.then(|| {
        let state = Arc::new(AppState::new(health.clone(), handle.live()));
        tokio::spawn(api::serve(config.api.port, state))
    });

    let canceller = handle.canceller();
    tokio::spawn(async move {
        shutdown_signal().await;
        canceller.cancel();
    });

    let session = handle.wait().await?;
    write_report(&session, config.output_path.as_deref())?;

    if let Some(task) = api_task {
        task.abort();
    }

    info!(
        status = ?session.status(),
        jobs = session.jobs.len(),
        "hpcmon finished"
    );
    if session.status() == SessionStatus::Failed {
        anyhow::bail!("monitoring session failed");
    }
    Ok(())
}
