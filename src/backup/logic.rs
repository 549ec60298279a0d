// backupd/src/backup/logic.rs
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::backup::db_dump;
use crate::config::BackupConfig;
use crate::errors::Result;
use crate::pipeline::{Pipeline, PipelineKind, RunReport, Step, TempArtifact, finish_run, run_step};
use crate::process::CommandRunner;
use crate::retry::RetryPolicy;
use crate::storage::ArtifactStore;
use crate::utils::PgTools;

/// Dumps the source database and uploads it as a new artifact.
pub struct BackupPipeline<S, R> {
    store: S,
    runner: R,
    tools: PgTools,
    backup_config: BackupConfig,
    retry: RetryPolicy,
}

impl<S: ArtifactStore, R: CommandRunner> BackupPipeline<S, R> {
    pub fn new(store: S, runner: R, tools: PgTools, backup_config: BackupConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            runner,
            tools,
            backup_config,
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

    async fn dump_and_upload(
        &self,
        report: &mut RunReport,
        cancel: &CancellationToken,
        artifact_name: &str,
        temp: &TempArtifact,
    ) -> Result<()> {
        report.begin(Step::Dumping);
        tokio::fs::create_dir_all(&self.backup_config.temp_dir).await?;

        let dump = db_dump::dump_command(&self.tools, &self.backup_config, temp.path());
        let dumped = run_step(report, Step::Dumping, &self.retry, cancel, || self.runner.run(&dump)).await?;
        if dumped.truncated {
            warn!("pg_dump output exceeded the capture limit and was truncated");
        }
        let size = tokio::fs::metadata(temp.path()).await?.len();
        info!(bytes = size, "Database dumped to {}", temp.path().display());

        run_step(report, Step::Uploading, &self.retry, cancel, || {
            self.store.upload(temp.path(), artifact_name)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl<S: ArtifactStore, R: CommandRunner> Pipeline for BackupPipeline<S, R> {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Backup
    }

    async fn run(&self, cancel: CancellationToken) -> RunReport {
        let mut report = RunReport::new(PipelineKind::Backup);
        let span = info_span!("run", run_id = %report.run_id, kind = "backup");
        async {
            let artifact_name = self.backup_config.naming.name_for(Utc::now());
            info!(database = %self.backup_config.source, artifact = %artifact_name, "Starting database backup");
            report.artifact = Some(artifact_name.clone());

            let temp = TempArtifact::for_run(&self.backup_config.temp_dir, report.run_id, &artifact_name);
            let outcome = self
                .dump_and_upload(&mut report, &cancel, &artifact_name, &temp)
                .await;
            finish_run(&mut report, temp, outcome).await;
            report.log_outcome();
        }
        .instrument(span)
        .await;
        report
    }
}
