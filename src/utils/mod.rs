pub mod connection;
pub mod logging;

use anyhow::{Context, Result};
use std::path::PathBuf;
use which::which;

/// Locations of the PostgreSQL client tools the pipelines shell out to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTools {
    pub psql: PathBuf,
    pub pg_dump: PathBuf,
    pub pg_restore: PathBuf,
}

impl PgTools {
    /// Finds `psql`, `pg_dump` and `pg_restore` in the system PATH.
    pub fn discover() -> Result<Self> {
        Ok(Self {
            psql: find_executable("psql")?,
            pg_dump: find_executable("pg_dump")?,
            pg_restore: find_executable("pg_restore")?,
        })
    }
}

fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        )
    })
}
