// backupd/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};
use crate::storage::{ArtifactStore, BackupArtifact};

/// Artifact store backed by an S3-compatible service (AWS S3, DigitalOcean
/// Spaces, GCS interoperability endpoint, MinIO).
pub struct S3ArtifactStore {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl S3ArtifactStore {
    /// Builds the client once from the given settings. Credentials fall back
    /// to the default AWS provider chain when not configured.
    pub async fn new(spaces_config: &SpacesConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(spaces_config.region.clone()));

        if let Some(endpoint) = &spaces_config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (
            &spaces_config.access_key_id,
            &spaces_config.secret_access_key,
        ) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id,
                secret,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.force_path_style)
            .build();

        info!(
            bucket = %spaces_config.bucket_name,
            folder_prefix = ?spaces_config.folder_prefix,
            "S3 artifact store configured"
        );

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: spaces_config.bucket_name.clone(),
            folder_prefix: spaces_config
                .folder_prefix
                .as_ref()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    fn object_key(&self, name: &str) -> String {
        object_key(self.folder_prefix.as_deref(), name)
    }

    fn artifact_name(&self, key: &str) -> Option<String> {
        artifact_name(self.folder_prefix.as_deref(), key)
    }
}

fn object_key(folder_prefix: Option<&str>, name: &str) -> String {
    match folder_prefix {
        Some(folder) => format!("{}/{}", folder, name),
        None => name.to_string(),
    }
}

/// Key relative to the folder; `None` for keys outside it or folder markers.
fn artifact_name(folder_prefix: Option<&str>, key: &str) -> Option<String> {
    let name = match folder_prefix {
        Some(folder) => key.strip_prefix(folder)?.strip_prefix('/')?,
        None => key,
    };
    if name.is_empty() || name.ends_with('/') {
        None
    } else {
        Some(name.to_string())
    }
}

fn to_chrono(ts: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn list_artifacts(&self) -> Result<Vec<BackupArtifact>> {
        let list_prefix = self.folder_prefix.as_ref().map(|f| format!("{}/", f));
        let mut artifacts = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(list_prefix.clone())
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    AppError::StoreUnavailable(format!(
                        "Failed to list objects in bucket {}: {}",
                        self.bucket,
                        s3::error::DisplayErrorContext(&e)
                    ))
                })?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let Some(name) = self.artifact_name(key) else { continue };
                let Some(created_at) = object.last_modified().and_then(to_chrono) else {
                    warn!(key, "Object has no modification time, skipping");
                    continue;
                };
                artifacts.push(BackupArtifact {
                    name,
                    created_at,
                    size: object.size().and_then(|s| u64::try_from(s).ok()),
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(artifacts)
    }

    async fn download(&self, artifact: &BackupArtifact, destination: &Path) -> Result<()> {
        let key = self.object_key(&artifact.name);
        info!(
            "Downloading s3://{}/{} to {}",
            self.bucket,
            key,
            destination.display()
        );

        if let Some(parent_dir) = destination.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                tokio::fs::create_dir_all(parent_dir).await.map_err(|e| {
                    AppError::Transfer(format!(
                        "Failed to create directory for download {}: {}",
                        parent_dir.display(),
                        e
                    ))
                })?;
            }
        }

        let mut object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                AppError::Transfer(format!(
                    "Failed to get object s3://{}/{}: {}",
                    self.bucket,
                    key,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;

        let mut output_file = File::create(destination).await.map_err(|e| {
            AppError::Transfer(format!(
                "Failed to create destination file {}: {}",
                destination.display(),
                e
            ))
        })?;

        let mut total_bytes_downloaded = 0usize;
        loop {
            let chunk = object.body.try_next().await.map_err(|e| {
                AppError::Transfer(format!("Failed to read s3://{}/{}: {}", self.bucket, key, e))
            })?;
            let Some(bytes_chunk) = chunk else { break };
            output_file.write_all(&bytes_chunk).await.map_err(|e| {
                AppError::Transfer(format!(
                    "Failed to write to destination file {}: {}",
                    destination.display(),
                    e
                ))
            })?;
            total_bytes_downloaded += bytes_chunk.len();
        }
        output_file.flush().await.map_err(|e| {
            AppError::Transfer(format!("Failed to flush {}: {}", destination.display(), e))
        })?;

        info!(
            bytes = total_bytes_downloaded,
            "Backup downloaded from s3://{}/{}", self.bucket, key
        );
        Ok(())
    }

    async fn upload(&self, source: &Path, destination_name: &str) -> Result<()> {
        let key = self.object_key(destination_name);
        info!(
            "Uploading {} to s3://{}/{}",
            source.display(),
            self.bucket,
            key
        );

        let body = ByteStream::from_path(source).await.map_err(|e| {
            AppError::Transfer(format!(
                "Failed to create ByteStream from file {}: {}",
                source.display(),
                e
            ))
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                AppError::Transfer(format!(
                    "Failed to upload {} to s3://{}/{}: {}",
                    source.display(),
                    self.bucket,
                    key,
                    s3::error::DisplayErrorContext(&e)
                ))
            })?;

        info!("✓ Uploaded {} to s3://{}/{}", source.display(), self.bucket, key);
        Ok(())
    }
}
