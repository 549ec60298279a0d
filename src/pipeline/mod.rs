//! Pieces shared by the backup and restore pipelines: run bookkeeping,
//! the cancellable retried step, and the temporary file guard.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::retry::{RetryPolicy, with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Backup,
    Restore,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineKind::Backup => "backup",
            PipelineKind::Restore => "restore",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SelectingArtifact,
    Transferring,
    CheckingConnection,
    PreparingTarget,
    Restoring,
    Verifying,
    Dumping,
    Uploading,
    CleaningUp,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::SelectingArtifact => "selecting_artifact",
            Step::Transferring => "transferring",
            Step::CheckingConnection => "checking_connection",
            Step::PreparingTarget => "preparing_target",
            Step::Restoring => "restoring",
            Step::Verifying => "verifying",
            Step::Dumping => "dumping",
            Step::Uploading => "uploading",
            Step::CleaningUp => "cleaning_up",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Running(Step),
    Succeeded,
    Failed(Step),
}

/// What a finished run hands back to its trigger.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub kind: PipelineKind,
    pub state: PipelineState,
    pub artifact: Option<String>,
    pub completed_steps: Vec<Step>,
    /// The error that ended the run, unchanged from the failing step.
    pub error: Option<AppError>,
    /// Attempts spent on the failing step.
    pub failed_attempts: u32,
    /// Set once the target has been reset; a later failure leaves it
    /// empty or partially restored.
    pub past_point_of_no_return: bool,
    pub cleanup_error: Option<AppError>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind,
            state: PipelineState::Pending,
            artifact: None,
            completed_steps: Vec::new(),
            error: None,
            failed_attempts: 0,
            past_point_of_no_return: false,
            cleanup_error: None,
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Succeeded
    }

    pub(crate) fn begin(&mut self, step: Step) {
        info!(step = %step, "Entering step");
        self.state = PipelineState::Running(step);
    }

    pub(crate) fn complete(&mut self, step: Step) {
        self.completed_steps.push(step);
    }

    /// Seals the report. The outcome of the pipeline body decides the
    /// terminal state; cleanup results never change it.
    pub(crate) fn finish(&mut self, outcome: Result<()>) {
        self.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => self.state = PipelineState::Succeeded,
            Err(err) => {
                let step = self.failed_step();
                self.state = PipelineState::Failed(step);
                self.error = Some(err);
            }
        }
    }

    fn failed_step(&self) -> Step {
        match self.state {
            PipelineState::Running(step) | PipelineState::Failed(step) => step,
            _ => Step::SelectingArtifact,
        }
    }

    /// Logs the terminal state with the context an operator needs.
    pub fn log_outcome(&self) {
        let elapsed_ms = self
            .finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or_default();
        match (&self.state, &self.error) {
            (PipelineState::Failed(step), Some(err)) => {
                error!(
                    run_id = %self.run_id,
                    kind = %self.kind,
                    step = %step,
                    attempts = self.failed_attempts,
                    artifact = ?self.artifact,
                    elapsed_ms,
                    error = %err,
                    transient = err.is_transient(),
                    "{} run failed",
                    self.kind
                );
                if self.past_point_of_no_return {
                    error!(
                        run_id = %self.run_id,
                        "Target database was reset before the failure and is now empty or partially restored; manual intervention or a new run is required"
                    );
                }
            }
            _ => info!(
                run_id = %self.run_id,
                kind = %self.kind,
                artifact = ?self.artifact,
                elapsed_ms,
                "{} run complete",
                self.kind
            ),
        }
        if let Some(err) = &self.cleanup_error {
            warn!(run_id = %self.run_id, error = %err, "Temporary file cleanup failed");
        }
    }
}

/// A backup or restore workflow that can be triggered repeatedly.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn kind(&self) -> PipelineKind;

    /// Runs one complete pipeline. Never panics on step failures; the
    /// outcome is in the report.
    async fn run(&self, cancel: CancellationToken) -> RunReport;
}

/// Enters `step`, runs it through [`attempt`] and marks it complete on
/// success.
pub(crate) async fn run_step<T, F, Fut>(
    report: &mut RunReport,
    step: Step,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    report.begin(step);
    let value = attempt(report, step, policy, cancel, operation).await?;
    report.complete(step);
    Ok(value)
}

/// Runs one operation through the retry coordinator, racing it against
/// cancellation. Dropping the in-flight attempt kills any subprocess it
/// spawned.
pub(crate) async fn attempt<T, F, Fut>(
    report: &mut RunReport,
    step: Step,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    let result = {
        let counted = || {
            attempts += 1;
            operation()
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled(format!("{} interrupted", step))),
            result = with_retry(policy, step.as_str(), counted) => result,
        }
    };
    if result.is_err() {
        report.failed_attempts = attempts;
    }
    result
}

/// Run-scoped temporary file. `cleanup` removes it and reports failures;
/// dropping an uncleaned guard still removes it, best effort.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    cleaned: bool,
}

impl TempArtifact {
    /// `{temp_dir}/{run_id}-{name}`, unique per run.
    pub fn for_run(temp_dir: &Path, run_id: Uuid, name: &str) -> Self {
        let file_name = format!("{}-{}", run_id, name.replace(['/', '\\'], "_"));
        Self {
            path: temp_dir.join(file_name),
            cleaned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file if it exists. Missing files are fine.
    pub async fn cleanup(mut self) -> Result<()> {
        self.cleaned = true;
        info!("Deleting temporary file: {}", self.path.display());
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AppError::Cleanup {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Shared tail of both pipelines: always remove the temp file, record a
/// failed removal as a warning, then seal the report.
pub(crate) async fn finish_run(report: &mut RunReport, temp: TempArtifact, outcome: Result<()>) {
    let previous = report.state;
    report.begin(Step::CleaningUp);
    match temp.cleanup().await {
        Ok(()) => report.complete(Step::CleaningUp),
        Err(err) => {
            warn!(error = %err, "Cleanup failed, keeping the run outcome");
            report.cleanup_error = Some(err);
        }
    }
    // A failure belongs to the step that produced it, not to cleanup.
    if outcome.is_err() {
        report.state = previous;
    }
    report.finish(outcome);
}
