//! In-memory fakes for the store and the command runner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::errors::{AppError, Result};
use crate::process::{CommandRunner, CommandSpec, ExecutionResult};
use crate::storage::{ArtifactStore, BackupArtifact};
use crate::utils::PgTools;

pub fn artifact(name: &str, year: i32, month: u32, day: u32) -> BackupArtifact {
    BackupArtifact {
        name: name.to_string(),
        created_at: Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap(),
        size: None,
    }
}

pub fn fake_tools() -> PgTools {
    PgTools {
        psql: PathBuf::from("psql"),
        pg_dump: PathBuf::from("pg_dump"),
        pg_restore: PathBuf::from("pg_restore"),
    }
}

/// Decrements `counter` if positive; true means "fail this call".
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<Vec<(BackupArtifact, Vec<u8>)>>,
    failing_lists: AtomicU32,
    failing_downloads: AtomicU32,
    failing_uploads: AtomicU32,
    pub list_calls: AtomicU32,
    pub download_calls: AtomicU32,
    pub upload_calls: AtomicU32,
    /// Paths handed to `download`, in call order.
    pub downloaded_to: Mutex<Vec<PathBuf>>,
}

impl MemoryStore {
    pub fn with_objects(objects: Vec<BackupArtifact>) -> Self {
        let store = Self::default();
        {
            let mut stored = store.objects.lock().unwrap();
            for object in objects {
                let bytes = format!("contents of {}", object.name).into_bytes();
                stored.push((object, bytes));
            }
        }
        store
    }

    pub fn fail_next_lists(&self, n: u32) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_downloads(&self, n: u32) {
        self.failing_downloads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_uploads(&self, n: u32) {
        self.failing_uploads.store(n, Ordering::SeqCst);
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _)| a.name == name)
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|(a, _)| a.name.clone())
            .collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn list_artifacts(&self) -> Result<Vec<BackupArtifact>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_lists) {
            return Err(AppError::StoreUnavailable("listing refused".into()));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(a, _)| a.clone())
            .collect())
    }

    async fn download(&self, artifact: &BackupArtifact, destination: &Path) -> Result<()> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.downloaded_to.lock().unwrap().push(destination.to_path_buf());
        if take_failure(&self.failing_downloads) {
            return Err(AppError::Transfer("connection reset".into()));
        }
        let bytes = self
            .object(&artifact.name)
            .ok_or_else(|| AppError::Transfer(format!("no such object {}", artifact.name)))?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, bytes).await?;
        Ok(())
    }

    async fn upload(&self, source: &Path, destination_name: &str) -> Result<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_uploads) {
            return Err(AppError::Transfer("503 Slow Down".into()));
        }
        let bytes = tokio::fs::read(source).await?;
        let mut objects = self.objects.lock().unwrap();
        objects.retain(|(a, _)| a.name != destination_name);
        objects.push((
            BackupArtifact {
                name: destination_name.to_string(),
                created_at: Utc::now(),
                size: Some(bytes.len() as u64),
            },
            bytes,
        ));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub program: String,
    pub spec: CommandSpec,
    /// Whether the last argument named an existing file when the command ran.
    pub input_existed: bool,
}

/// Records every command and succeeds unless told otherwise. `pg_dump`
/// writes a small file to its `-f` target.
#[derive(Default)]
pub struct FakeRunner {
    pub commands: Mutex<Vec<RecordedCommand>>,
    failures: Mutex<HashMap<String, u32>>,
    hanging: Mutex<Vec<String>>,
}

impl FakeRunner {
    /// Makes the next `times` calls of `program` exit with status 1.
    pub fn fail(&self, program: &str, times: u32) {
        self.failures.lock().unwrap().insert(program.to_string(), times);
    }

    /// Makes every call of `program` block until dropped.
    pub fn hang(&self, program: &str) {
        self.hanging.lock().unwrap().push(program.to_string());
    }

    pub fn calls(&self, program: &str) -> Vec<RecordedCommand> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.program == program)
            .cloned()
            .collect()
    }

    pub fn programs(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.program.clone())
            .collect()
    }

    fn should_fail(&self, program: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(program) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        let program = spec.program_name();
        let input_existed = spec
            .args
            .last()
            .map(|a| Path::new(a).is_file())
            .unwrap_or(false);
        self.commands.lock().unwrap().push(RecordedCommand {
            program: program.clone(),
            spec: spec.clone(),
            input_existed,
        });

        let hangs = self.hanging.lock().unwrap().contains(&program);
        if hangs {
            std::future::pending::<()>().await;
        }
        if self.should_fail(&program) {
            return Err(AppError::Process {
                program,
                exit_code: Some(1),
                stderr: "error: simulated failure".to_string(),
            });
        }

        if program == "pg_dump" {
            if let Some(pos) = spec.args.iter().position(|a| a == "-f") {
                if let Some(target) = spec.args.get(pos + 1) {
                    tokio::fs::write(target, b"PGDMP fake dump").await?;
                }
            }
        }
        Ok(ExecutionResult::default())
    }
}
