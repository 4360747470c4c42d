use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use capture_deriver::config::Config;
use capture_deriver::db::{count_unclaimed_jobs, Database};
use capture_deriver::derivation::{report_stuck_claims, run_workers, RunSummary};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting capture-deriver");

    let mut config = Config::from_env().context("Failed to load configuration")?;
    // The store location may also be given as the only argument.
    if let Some(path) = std::env::args_os().nth(1) {
        config.database_path = PathBuf::from(path);
    }
    config.validate().context("Invalid configuration")?;
    config.derived_dir = std::path::absolute(&config.derived_dir).with_context(|| {
        format!(
            "Failed to resolve derived directory: {}",
            config.derived_dir.display()
        )
    })?;

    info!(
        database = %config.database_path.display(),
        derived_dir = %config.derived_dir.display(),
        workers = config.worker_concurrency,
        worker_id = %config.worker_id,
        "Configuration loaded"
    );

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }
    tokio::fs::create_dir_all(&config.derived_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create derived directory: {}",
                config.derived_dir.display()
            )
        })?;

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    let stuck = report_stuck_claims(&db).await?;
    if stuck > 0 {
        warn!(count = stuck, "Claimed jobs found; release them manually if their worker is gone");
    }
    let pending = count_unclaimed_jobs(db.pool()).await?;
    info!(pending, "Backlog loaded");

    let summary = if config.watch_interval.is_some() {
        tokio::select! {
            result = run_workers(&config, &db) => result?,
            () = shutdown_signal() => {
                info!("Shutting down...");
                RunSummary::default()
            }
        }
    } else {
        run_workers(&config, &db).await?
    };

    info!(
        committed = summary.committed,
        failed = summary.failed,
        "Derivation complete"
    );

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,capture_deriver=debug"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
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
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
