//! Cron-driven trigger for a pipeline, one run at a time.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::pipeline::{Pipeline, RunReport};

/// Parses a cron expression. Classic five-field expressions
/// (`min hour dom month dow`) get a leading `0` seconds field.
pub fn parse_schedule(expression: &str) -> Result<Schedule, cron::error::Error> {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {}", expression))
    } else {
        Schedule::from_str(expression)
    }
}

/// What happened to a trigger.
#[derive(Debug)]
pub enum Trigger {
    Started(JoinHandle<RunReport>),
    /// A previous run still holds the slot; nothing was started.
    SkippedBusy,
}

pub struct Scheduler {
    pipeline: Arc<dyn Pipeline>,
    schedule: Schedule,
    cron_expression: String,
    run_on_startup: bool,
    slot: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<dyn Pipeline>, schedule_config: &ScheduleConfig) -> Result<Self, cron::error::Error> {
        Ok(Self {
            pipeline,
            schedule: parse_schedule(&schedule_config.cron_expression)?,
            cron_expression: schedule_config.cron_expression.clone(),
            run_on_startup: schedule_config.run_on_startup,
            slot: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }

    /// Starts a run unless one is already in flight.
    pub fn trigger(&self, cancel: &CancellationToken) -> Trigger {
        let permit = match Arc::clone(&self.slot).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(kind = %self.pipeline.kind(), "Previous run still in progress, skipping this trigger");
                return Trigger::SkippedBusy;
            }
        };

        let pipeline = Arc::clone(&self.pipeline);
        let cancel = cancel.clone();
        Trigger::Started(tokio::spawn(async move {
            let report = pipeline.run(cancel).await;
            drop(permit);
            report
        }))
    }

    /// Fires on the schedule until `cancel` is triggered, then waits for the
    /// in-flight run (which sees the same token) to finish its cleanup.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            cron = %self.cron_expression,
            kind = %self.pipeline.kind(),
            run_on_startup = self.run_on_startup,
            "Scheduler started"
        );

        let mut in_flight: Option<JoinHandle<RunReport>> = None;
        if self.run_on_startup {
            info!("Running on startup");
            if let Trigger::Started(handle) = self.trigger(&cancel) {
                in_flight = Some(handle);
            }
        }

        loop {
            let Some(next) = self.next_fire() else {
                warn!("Cron expression has no upcoming fire time, stopping scheduler");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            info!(next_run = %next, "Waiting for next scheduled run");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            if let Trigger::Started(handle) = self.trigger(&cancel) {
                in_flight = Some(handle);
            }
        }

        info!("Scheduler stopping");
        if let Some(handle) = in_flight {
            match handle.await {
                Ok(report) => info!(run_id = %report.run_id, state = ?report.state, "In-flight run finished"),
                Err(e) => error!(error = %e, "In-flight run panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineKind;
    use async_trait::async_trait;
    use chrono::Timelike;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    struct GatedPipeline {
        runs: AtomicU32,
        release: Notify,
    }

    impl GatedPipeline {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU32::new(0),
                release: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl Pipeline for GatedPipeline {
        fn kind(&self) -> PipelineKind {
            PipelineKind::Restore
        }

        async fn run(&self, cancel: CancellationToken) -> RunReport {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = self.release.notified() => {}
                _ = cancel.cancelled() => {}
            }
            let mut report = RunReport::new(PipelineKind::Restore);
            report.finish(Ok(()));
            report
        }
    }

    fn schedule(cron_expression: &str, run_on_startup: bool) -> ScheduleConfig {
        ScheduleConfig {
            cron_expression: cron_expression.to_string(),
            run_on_startup,
        }
    }

    #[test]
    fn test_five_field_expressions_are_accepted() {
        let parsed = parse_schedule("*/15 * * * *").unwrap();
        let next = parsed.upcoming(Utc).next().unwrap();
        assert_eq!(next.second(), 0);
        assert_eq!(next.minute() % 15, 0);

        assert!(parse_schedule("0 0 3 * * *").is_ok());
        assert!(parse_schedule("every day at noon").is_err());
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let pipeline = GatedPipeline::new();
        let scheduler = Scheduler::new(pipeline.clone(), &schedule("0 0 3 * * *", false)).unwrap();
        let cancel = CancellationToken::new();

        let Trigger::Started(first) = scheduler.trigger(&cancel) else {
            panic!("first trigger should start a run");
        };
        assert!(matches!(scheduler.trigger(&cancel), Trigger::SkippedBusy));

        pipeline.release.notify_one();
        let report = first.await.unwrap();
        assert!(report.is_success());

        let Trigger::Started(second) = scheduler.trigger(&cancel) else {
            panic!("slot should be free again");
        };
        pipeline.release.notify_one();
        second.await.unwrap();
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_startup_run() {
        let pipeline = GatedPipeline::new();
        // Far-off schedule: only the startup run fires.
        let scheduler = Scheduler::new(pipeline.clone(), &schedule("0 0 0 1 1 *", true)).unwrap();
        let cancel = CancellationToken::new();

        let loop_task = tokio::spawn(scheduler.run(cancel.clone()));
        while pipeline.runs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), loop_task)
            .await
            .expect("scheduler should stop after cancellation")
            .unwrap();
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 1);
    }
}
