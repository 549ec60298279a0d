// backupd/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::process::DEFAULT_MAX_OUTPUT_BYTES;
use crate::retry::RetryPolicy;
use crate::storage::ArtifactNaming;
use crate::utils::connection::DatabaseTarget;

const DEFAULT_TEMP_DIR: &str = "./databasebackup";
const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_CRON: &str = "0 0 3 * * *";
const DEFAULT_RESTORE_TIMEOUT_SECS: u64 = 20 * 60;
const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 20 * 60;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub force_path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonArtifactNaming {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonScheduleConfig {
    pub cron_expression: Option<String>,
    pub run_on_startup: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetryConfig {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    pub schema: Option<String>,
    pub verify_connection: Option<bool>,
    pub verify_after_restore: Option<bool>,
    pub restore_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub dump_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub mode: Option<String>,
    pub source_database_url: Option<String>,
    pub target_database_url: Option<String>,
    pub database_password: Option<String>,
    pub temp_dir: Option<PathBuf>,
    pub dump_format: Option<String>,
    pub max_output_bytes: Option<usize>,
    pub artifact_naming: Option<JsonArtifactNaming>,
    pub schedule: Option<JsonScheduleConfig>,
    pub retry: Option<JsonRetryConfig>,
    pub restore_options: Option<JsonRestoreOptions>,
    pub backup_options: Option<JsonBackupOptions>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

impl RawJsonConfig {
    /// Environment variables win over the file, so secrets can stay out of it.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SOURCE_DATABASE_URL") {
            self.source_database_url = Some(v);
        }
        if let Some(v) = get("TARGET_DATABASE_URL") {
            self.target_database_url = Some(v);
        }
        if let Some(v) = get("DB_PASSWORD") {
            self.database_password = Some(v);
        }

        let schedule = self.schedule.get_or_insert_with(Default::default);
        if let Some(v) = get("BACKUP_CRON_SCHEDULE") {
            schedule.cron_expression = Some(v);
        }
        if let Some(v) = get("RUN_ON_STARTUP") {
            schedule.run_on_startup = Some(parse_flag(&v));
        }

        let s3 = self.s3_storage.get_or_insert_with(Default::default);
        if let Some(v) = get("S3_BUCKET") {
            s3.bucket_name = Some(v);
        }
        if let Some(v) = get("S3_REGION") {
            s3.region = Some(v);
        }
        if let Some(v) = get("S3_ENDPOINT_URL") {
            s3.endpoint_url = Some(v);
        }
        if let Some(v) = get("S3_ACCESS_KEY_ID") {
            s3.access_key_id = Some(v);
        }
        if let Some(v) = get("S3_SECRET_ACCESS_KEY") {
            s3.secret_access_key = Some(v);
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub bucket_name: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub folder_prefix: Option<String>,
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    /// `pg_dump --format=custom`, restored with `pg_restore`.
    #[default]
    Custom,
    /// Plain SQL, restored with `psql -f`.
    Plain,
}

impl FromStr for DumpFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "custom" => Ok(DumpFormat::Custom),
            "plain" | "sql" => Ok(DumpFormat::Plain),
            other => Err(anyhow::anyhow!(
                "dump_format must be 'custom' or 'plain', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub cron_expression: String,
    pub run_on_startup: bool,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source: DatabaseTarget,
    pub naming: ArtifactNaming,
    pub temp_dir: PathBuf,
    pub format: DumpFormat,
    pub dump_timeout: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub target: DatabaseTarget,
    pub naming: ArtifactNaming,
    pub temp_dir: PathBuf,
    pub format: DumpFormat,
    pub schema: String,
    pub verify_connection: bool,
    pub verify_after_restore: bool,
    pub restore_timeout: Duration,
    pub command_timeout: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spaces_config: SpacesConfig,
    pub retry: RetryPolicy,
    pub schedule: ScheduleConfig,
    pub raw_json_config: RawJsonConfig, // Store the parsed raw config
}

impl AppConfig {
    /// Reads `config_path` (optional: a missing file means "environment
    /// only"), applies environment overrides and validates the shared parts.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let mut raw_json_config = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file at {}", config_path.display())
            })?;
            serde_json::from_str::<RawJsonConfig>(&config_content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?
        } else {
            tracing::info!(
                "No config file at {}, using environment only",
                config_path.display()
            );
            RawJsonConfig::default()
        };
        raw_json_config.apply_env_overrides(|key| std::env::var(key).ok());

        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw_json_config: RawJsonConfig) -> Result<Self> {
        Ok(AppConfig {
            spaces_config: load_spaces_config(raw_json_config.s3_storage.as_ref())?,
            retry: load_retry_policy(raw_json_config.retry.as_ref())?,
            schedule: load_schedule_config(raw_json_config.schedule.as_ref())?,
            raw_json_config,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn load_spaces_config(raw: Option<&JsonS3StorageConfig>) -> Result<SpacesConfig> {
    let raw = raw.context("s3_storage must be configured (config.json or S3_* environment variables)")?;
    let bucket_name = non_empty(&raw.bucket_name).context("s3_storage.bucket_name must be set")?;

    let access_key_id = non_empty(&raw.access_key_id);
    let secret_access_key = non_empty(&raw.secret_access_key);
    if access_key_id.is_some() != secret_access_key.is_some() {
        return Err(anyhow::anyhow!(
            "s3_storage.access_key_id and s3_storage.secret_access_key must be set together"
        ));
    }

    Ok(SpacesConfig {
        bucket_name,
        region: non_empty(&raw.region).unwrap_or_else(|| "us-east-1".to_string()),
        endpoint_url: non_empty(&raw.endpoint_url),
        access_key_id,
        secret_access_key,
        folder_prefix: non_empty(&raw.folder_prefix),
        force_path_style: raw.force_path_style.unwrap_or(false),
    })
}

fn load_retry_policy(raw: Option<&JsonRetryConfig>) -> Result<RetryPolicy> {
    let defaults = RetryPolicy::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };

    let max_attempts = raw.max_attempts.unwrap_or(defaults.max_attempts);
    if max_attempts == 0 {
        return Err(anyhow::anyhow!("retry.max_attempts must be at least 1"));
    }
    let backoff_multiplier = raw.backoff_multiplier.unwrap_or(defaults.backoff_multiplier);
    if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
        return Err(anyhow::anyhow!(
            "retry.backoff_multiplier must be >= 1.0, got {}",
            backoff_multiplier
        ));
    }
    let initial_delay = raw
        .initial_delay_ms
        .map(Duration::from_millis)
        .unwrap_or(defaults.initial_delay);

    Ok(RetryPolicy::new(max_attempts, initial_delay, backoff_multiplier))
}

fn load_schedule_config(raw: Option<&JsonScheduleConfig>) -> Result<ScheduleConfig> {
    let cron_expression = raw
        .and_then(|s| non_empty(&s.cron_expression))
        .unwrap_or_else(|| DEFAULT_CRON.to_string());
    crate::scheduler::parse_schedule(&cron_expression)
        .with_context(|| format!("Invalid cron expression '{}'", cron_expression))?;

    Ok(ScheduleConfig {
        cron_expression,
        run_on_startup: raw.and_then(|s| s.run_on_startup).unwrap_or(false),
    })
}

fn load_naming(raw_config: &RawJsonConfig) -> Result<ArtifactNaming> {
    let defaults = ArtifactNaming::default();
    let raw = raw_config.artifact_naming.clone().unwrap_or_default();
    let naming = ArtifactNaming::new(
        raw.prefix.unwrap_or(defaults.prefix),
        raw.suffix.unwrap_or(defaults.suffix),
    );
    if naming.prefix.is_empty() {
        return Err(anyhow::anyhow!("artifact_naming.prefix cannot be empty"));
    }
    Ok(naming)
}

fn load_dump_format(raw_config: &RawJsonConfig) -> Result<DumpFormat> {
    raw_config
        .dump_format
        .as_deref()
        .map(DumpFormat::from_str)
        .transpose()
        .map(Option::unwrap_or_default)
}

fn load_database(url: &Option<String>, password: &Option<String>, field: &str) -> Result<DatabaseTarget> {
    let url = non_empty(url).with_context(|| format!("{} must be set in config.json or the environment", field))?;
    let mut target = DatabaseTarget::from_url(&url).with_context(|| format!("{} is not a valid database URL", field))?;
    if let Some(password) = non_empty(password) {
        target.password = Some(password);
    }
    Ok(target)
}

pub fn load_backup_config_from_json(raw_config: &RawJsonConfig) -> Result<BackupConfig> {
    let source = load_database(
        &raw_config.source_database_url,
        &raw_config.database_password,
        "source_database_url",
    )?;
    let backup_opts = raw_config.backup_options.clone().unwrap_or_default();

    Ok(BackupConfig {
        source,
        naming: load_naming(raw_config)?,
        temp_dir: raw_config
            .temp_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR)),
        format: load_dump_format(raw_config)?,
        dump_timeout: Duration::from_secs(
            backup_opts.dump_timeout_secs.unwrap_or(DEFAULT_DUMP_TIMEOUT_SECS),
        ),
        max_output_bytes: raw_config.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
    })
}

pub fn load_restore_config_from_json(raw_config: &RawJsonConfig) -> Result<RestoreConfig> {
    let target = load_database(
        &raw_config.target_database_url,
        &raw_config.database_password,
        "target_database_url",
    )?;
    let restore_opts = raw_config.restore_options.clone().unwrap_or_default();

    let schema = non_empty(&restore_opts.schema).unwrap_or_else(|| DEFAULT_SCHEMA.to_string());

    Ok(RestoreConfig {
        target,
        naming: load_naming(raw_config)?,
        temp_dir: raw_config
            .temp_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR)),
        format: load_dump_format(raw_config)?,
        schema,
        verify_connection: restore_opts.verify_connection.unwrap_or(true),
        verify_after_restore: restore_opts.verify_after_restore.unwrap_or(false),
        restore_timeout: Duration::from_secs(
            restore_opts
                .restore_timeout_secs
                .unwrap_or(DEFAULT_RESTORE_TIMEOUT_SECS),
        ),
        command_timeout: Duration::from_secs(
            restore_opts
                .command_timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
        ),
        max_output_bytes: raw_config.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).unwrap()
    }

    fn minimal() -> RawJsonConfig {
        raw(serde_json::json!({
            "target_database_url": "postgres://app:pw@db.internal:6543/railway",
            "source_database_url": "postgres://app@primary:5432/app",
            "s3_storage": { "bucket_name": "db-backups" }
        }))
    }

    #[test]
    fn test_defaults() -> anyhow::Result<()> {
        let app = AppConfig::from_raw(minimal())?;
        assert_eq!(app.retry, RetryPolicy::default());
        assert_eq!(app.retry.max_attempts, 3);
        assert_eq!(app.retry.initial_delay, Duration::from_millis(5000));
        assert!(!app.schedule.run_on_startup);
        assert_eq!(app.spaces_config.region, "us-east-1");

        let restore = load_restore_config_from_json(&app.raw_json_config)?;
        assert_eq!(restore.schema, "public");
        assert_eq!(restore.naming, ArtifactNaming::default());
        assert_eq!(restore.restore_timeout, Duration::from_secs(1200));
        assert!(restore.verify_connection);
        assert_eq!(restore.format, DumpFormat::Custom);
        assert_eq!(restore.target.host, "db.internal");
        assert_eq!(restore.target.port, 6543);
        Ok(())
    }

    #[test]
    fn test_env_overrides_file_values() -> anyhow::Result<()> {
        let mut config = minimal();
        let env: HashMap<&str, &str> = [
            ("TARGET_DATABASE_URL", "postgres://ops@restore-host:5432/shadow"),
            ("DB_PASSWORD", "from-env"),
            ("BACKUP_CRON_SCHEDULE", "*/15 * * * *"),
            ("RUN_ON_STARTUP", "true"),
            ("S3_BUCKET", "other-bucket"),
        ]
        .into_iter()
        .collect();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        let app = AppConfig::from_raw(config)?;
        assert!(app.schedule.run_on_startup);
        assert_eq!(app.schedule.cron_expression, "*/15 * * * *");
        assert_eq!(app.spaces_config.bucket_name, "other-bucket");

        let restore = load_restore_config_from_json(&app.raw_json_config)?;
        assert_eq!(restore.target.host, "restore-host");
        assert_eq!(restore.target.database, "shadow");
        assert_eq!(restore.target.password.as_deref(), Some("from-env"));
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_retry_settings() {
        let mut config = minimal();
        config.retry = Some(JsonRetryConfig {
            max_attempts: Some(0),
            ..Default::default()
        });
        assert!(AppConfig::from_raw(config).is_err());

        let mut config = minimal();
        config.retry = Some(JsonRetryConfig {
            backoff_multiplier: Some(0.5),
            ..Default::default()
        });
        assert!(AppConfig::from_raw(config).is_err());
    }

    #[test]
    fn test_rejects_bad_cron_expression() {
        let mut config = minimal();
        config.schedule = Some(JsonScheduleConfig {
            cron_expression: Some("every tuesday".to_string()),
            run_on_startup: None,
        });
        assert!(AppConfig::from_raw(config).is_err());
    }

    #[test]
    fn test_missing_bucket_is_an_error() {
        let mut config = minimal();
        config.s3_storage = Some(JsonS3StorageConfig::default());
        assert!(AppConfig::from_raw(config).is_err());
    }

    #[test]
    fn test_half_configured_credentials_rejected() {
        let mut config = minimal();
        config.s3_storage = Some(JsonS3StorageConfig {
            bucket_name: Some("b".into()),
            access_key_id: Some("AKIA".into()),
            ..Default::default()
        });
        assert!(AppConfig::from_raw(config).is_err());
    }

    #[test]
    fn test_mode_specific_url_required() {
        let config = raw(serde_json::json!({ "s3_storage": { "bucket_name": "b" } }));
        assert!(load_backup_config_from_json(&config).is_err());
        assert!(load_restore_config_from_json(&config).is_err());
    }

    #[test]
    fn test_custom_naming_and_format() -> anyhow::Result<()> {
        let mut config = minimal();
        config.artifact_naming = Some(JsonArtifactNaming {
            prefix: Some("nightly-".into()),
            suffix: Some(".sql".into()),
        });
        config.dump_format = Some("plain".into());

        let backup = load_backup_config_from_json(&config)?;
        assert_eq!(backup.naming, ArtifactNaming::new("nightly-", ".sql"));
        assert_eq!(backup.format, DumpFormat::Plain);

        config.dump_format = Some("tar".into());
        assert!(load_backup_config_from_json(&config).is_err());
        Ok(())
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let mut config = minimal();
        config.artifact_naming = Some(JsonArtifactNaming {
            prefix: Some(String::new()),
            suffix: None,
        });
        assert!(load_restore_config_from_json(&config).is_err());
    }
}
