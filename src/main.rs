//! Scheduled PostgreSQL backup/restore against an S3-compatible bucket.
//!
//! `backupd restore` (the default) restores the newest backup on a cron
//! schedule, `backupd backup` dumps and uploads one. `--once` runs a single
//! pipeline and exits.

// backupd/src/main.rs
mod backup;
mod config;
mod errors;
mod pipeline;
mod process;
mod restore;
mod retry;
mod scheduler;
mod storage;
mod utils;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use config::{AppConfig, load_backup_config_from_json, load_restore_config_from_json};
use pipeline::{Pipeline, PipelineKind};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    mode: Option<PipelineKind>,
    once: bool,
}

fn parse_mode(value: &str) -> Result<PipelineKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "backup" => Ok(PipelineKind::Backup),
        "2" | "restore" => Ok(PipelineKind::Restore),
        other => anyhow::bail!("Invalid mode '{}'. Use 'backup' or 'restore'.", other),
    }
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<CliArgs> {
    let mut cli = CliArgs { mode: None, once: false };
    for arg in args {
        match arg.as_str() {
            "--once" => cli.once = true,
            flag if flag.starts_with("--") => anyhow::bail!("Unknown flag '{}'", flag),
            value => cli.mode = Some(parse_mode(value)?),
        }
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    utils::logging::init_tracing();

    match run_app().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let cli = parse_args(env::args().skip(1))?;
    let config_path = env::var("BACKUPD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;

    let mode = match cli.mode {
        Some(mode) => mode,
        None => match app_config.raw_json_config.mode.as_deref() {
            Some(value) => parse_mode(value).context("Invalid 'mode' in configuration")?,
            None => PipelineKind::Restore,
        },
    };

    let tools = utils::PgTools::discover()?;
    let store = storage::S3ArtifactStore::new(&app_config.spaces_config).await;
    let runner = process::SubprocessExecutor::default();

    let pipeline: Arc<dyn Pipeline> = match mode {
        PipelineKind::Backup => {
            let backup_config = load_backup_config_from_json(&app_config.raw_json_config)
                .context("Failed to load backup configuration")?;
            info!(source = %backup_config.source, "🚀 Backup mode");
            Arc::new(backup::BackupPipeline::new(
                store,
                runner,
                tools,
                backup_config,
                app_config.retry.clone(),
            ))
        }
        PipelineKind::Restore => {
            let restore_config = load_restore_config_from_json(&app_config.raw_json_config)
                .context("Failed to load restore configuration")?;
            info!(target_db = %restore_config.target, "🔄 Restore mode");
            Arc::new(restore::RestorePipeline::new(
                store,
                runner,
                tools,
                restore_config,
                app_config.retry.clone(),
            ))
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    if cli.once {
        let report = pipeline.run(cancel).await;
        if report.is_success() {
            return Ok(());
        }
        let failed = format!("{} run {} failed", report.kind, report.run_id);
        return match report.error {
            Some(e) => Err(e).context(failed),
            None => Err(anyhow::anyhow!(failed)),
        };
    }

    let scheduler = scheduler::Scheduler::new(pipeline, &app_config.schedule)
        .context("Failed to build scheduler")?;
    scheduler.run(cancel).await;
    info!("Shutdown complete");
    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM. In-flight runs see the token,
/// kill their subprocess and remove their temp file.
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    cancel.cancel();
}
