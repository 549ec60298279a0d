//! Remote artifact store: listing, latest-backup selection and transfers.

pub(crate) mod s3;

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::errors::{AppError, Result};

pub use s3::S3ArtifactStore;

/// Timestamp layout embedded in artifact names, e.g. `2024-02-01T00-00-00`.
pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// A backup file in the bucket. `created_at` comes from the store's
/// metadata, never from the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size: Option<u64>,
}

/// Prefix/suffix convention that makes an object eligible for restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNaming {
    pub prefix: String,
    pub suffix: String,
}

impl Default for ArtifactNaming {
    fn default() -> Self {
        Self {
            prefix: "backup-".to_string(),
            suffix: ".dump".to_string(),
        }
    }
}

impl ArtifactNaming {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Name must start with the prefix, end with the suffix, and keep
    /// something in between for the timestamp.
    pub fn matches(&self, name: &str) -> bool {
        name.len() > self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }

    pub fn name_for(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}{}{}",
            self.prefix,
            at.format(ARTIFACT_TIMESTAMP_FORMAT),
            self.suffix
        )
    }
}

/// The object store as the pipelines see it. The bucket is fixed when the
/// store is built.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Every object in the bucket (below the configured folder, if any).
    /// An empty bucket is an empty vector, not an error.
    async fn list_artifacts(&self) -> Result<Vec<BackupArtifact>>;

    /// Writes the object's bytes to `destination`, creating parent
    /// directories as needed.
    async fn download(&self, artifact: &BackupArtifact, destination: &Path) -> Result<()>;

    /// Creates or overwrites `destination_name` with the bytes of `source`.
    async fn upload(&self, source: &Path, destination_name: &str) -> Result<()>;
}

#[async_trait]
impl<S: ArtifactStore + ?Sized> ArtifactStore for Arc<S> {
    async fn list_artifacts(&self) -> Result<Vec<BackupArtifact>> {
        (**self).list_artifacts().await
    }

    async fn download(&self, artifact: &BackupArtifact, destination: &Path) -> Result<()> {
        (**self).download(artifact, destination).await
    }

    async fn upload(&self, source: &Path, destination_name: &str) -> Result<()> {
        (**self).upload(source, destination_name).await
    }
}

/// Picks the newest eligible artifact.
///
/// Newest `created_at` wins; equal timestamps fall back to the greater name
/// so the choice does not depend on listing order.
pub fn select_latest(artifacts: &[BackupArtifact], naming: &ArtifactNaming) -> Result<BackupArtifact> {
    artifacts
        .iter()
        .filter(|a| naming.matches(&a.name))
        .max_by(|a, b| compare_recency(a, b))
        .cloned()
        .ok_or_else(|| AppError::NoEligibleArtifact {
            prefix: naming.prefix.clone(),
            suffix: naming.suffix.clone(),
        })
}

fn compare_recency(a: &BackupArtifact, b: &BackupArtifact) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.name.cmp(&b.name))
}

/// Selects the latest backup from a full bucket listing, telling an empty
/// bucket apart from one without eligible names.
pub fn choose_latest(listing: &[BackupArtifact], naming: &ArtifactNaming) -> Result<BackupArtifact> {
    if listing.is_empty() {
        return Err(AppError::NoArtifactsFound);
    }
    debug!(count = listing.len(), "Listed objects");

    let latest = select_latest(listing, naming)?;
    info!(
        artifact = %latest.name,
        created_at = %latest.created_at,
        "Latest backup file selected"
    );
    Ok(latest)
}
