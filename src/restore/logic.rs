// backupd/src/restore/logic.rs
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::config::RestoreConfig;
use crate::errors::Result;
use crate::pipeline::{
    Pipeline, PipelineKind, RunReport, Step, TempArtifact, attempt, finish_run, run_step,
};
use crate::process::CommandRunner;
use crate::restore::{db_restore, verification};
use crate::retry::RetryPolicy;
use crate::storage::{ArtifactStore, BackupArtifact, choose_latest};
use crate::utils::PgTools;

/// Latest backup from the store into the target database:
/// select, download, reset target, restore, verify, clean up.
pub struct RestorePipeline<S, R> {
    store: S,
    runner: R,
    tools: PgTools,
    restore_config: RestoreConfig,
    retry: RetryPolicy,
}

impl<S: ArtifactStore, R: CommandRunner> RestorePipeline<S, R> {
    pub fn new(store: S, runner: R, tools: PgTools, restore_config: RestoreConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            runner,
            tools,
            restore_config,
            retry,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    pub fn runner(&self) -> &R {
        &self.runner
    }

    async fn perform_restore(&self, report: &mut RunReport, cancel: &CancellationToken) -> Result<()> {
        report.begin(Step::SelectingArtifact);
        let listing = attempt(report, Step::SelectingArtifact, &self.retry, cancel, || {
            self.store.list_artifacts()
        })
        .await?;
        let latest = choose_latest(&listing, &self.restore_config.naming)?;
        report.complete(Step::SelectingArtifact);
        report.artifact = Some(latest.name.clone());

        // From here on the temp file may exist, so cleanup is owed on every path.
        let temp = TempArtifact::for_run(&self.restore_config.temp_dir, report.run_id, &latest.name);
        let outcome = self.restore_from(report, cancel, &latest, &temp).await;
        finish_run(report, temp, outcome).await;
        Ok(())
    }

    async fn restore_from(
        &self,
        report: &mut RunReport,
        cancel: &CancellationToken,
        latest: &BackupArtifact,
        temp: &TempArtifact,
    ) -> Result<()> {
        run_step(report, Step::Transferring, &self.retry, cancel, || {
            self.store.download(latest, temp.path())
        })
        .await?;
        info!("Backup file downloaded to {}", temp.path().display());

        if self.restore_config.verify_connection {
            let check = db_restore::connection_check_command(&self.tools, &self.restore_config);
            run_step(report, Step::CheckingConnection, &self.retry, cancel, || {
                self.runner.run(&check)
            })
            .await?;
            info!(database = %self.restore_config.target, "Database connection successful");
        }

        let reset = db_restore::reset_schema_command(&self.tools, &self.restore_config);
        run_step(report, Step::PreparingTarget, &self.retry, cancel, || {
            self.runner.run(&reset)
        })
        .await?;
        report.past_point_of_no_return = true;
        info!(schema = %self.restore_config.schema, "Database cleared");

        let restore = db_restore::restore_command(&self.tools, &self.restore_config, temp.path());
        let restored = run_step(report, Step::Restoring, &self.retry, cancel, || {
            self.runner.run(&restore)
        })
        .await?;
        if restored.truncated {
            warn!("Restore output exceeded the capture limit and was truncated");
        }
        info!(database = %self.restore_config.target, "Database restored successfully");

        if self.restore_config.verify_after_restore {
            report.begin(Step::Verifying);
            match verification::verify_restore(&self.restore_config).await {
                Ok(_) => report.complete(Step::Verifying),
                Err(e) => {
                    warn!(error = %e, "Restore verification failed; the restore itself completed");
                    report.warnings.push(format!("verification: {}", e));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ArtifactStore, R: CommandRunner> Pipeline for RestorePipeline<S, R> {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Restore
    }

    async fn run(&self, cancel: CancellationToken) -> RunReport {
        let mut report = RunReport::new(PipelineKind::Restore);
        let span = info_span!("run", run_id = %report.run_id, kind = "restore");
        async {
            info!(database = %self.restore_config.target, "Starting database restore");
            let selection = self.perform_restore(&mut report, &cancel).await;
            // Only selection errors reach here; later ones are sealed by finish_run.
            if let Err(e) = selection {
                report.finish(Err(e));
            }
            report.log_outcome();
        }
        .instrument(span)
        .await;
        report
    }
}
