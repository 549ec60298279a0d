// backupd/src/restore/verification.rs
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::RestoreConfig;
use crate::errors::{AppError, Result};

/// Post-restore sanity check: connects to the target and counts the tables
/// in the restored schema.
///
/// A missing schema is an error. An empty one is only reported; some
/// databases are legitimately empty.
pub async fn verify_restore(restore_config: &RestoreConfig) -> Result<i64> {
    let db_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&restore_config.target.sqlx_url()?)
        .await?;

    let schema_exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)")
            .bind(&restore_config.schema)
            .fetch_one(&db_pool)
            .await?;
    if !schema_exists {
        db_pool.close().await;
        return Err(AppError::Verification(format!(
            "schema '{}' does not exist on {}",
            restore_config.schema, restore_config.target
        )));
    }

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_catalog.pg_tables WHERE schemaname = $1",
    )
    .bind(&restore_config.schema)
    .fetch_one(&db_pool)
    .await?;
    db_pool.close().await;

    if table_count == 0 {
        warn!(
            schema = %restore_config.schema,
            database = %restore_config.target,
            "No tables found in the restored schema"
        );
    } else {
        info!(
            schema = %restore_config.schema,
            tables = table_count,
            "✓ Restore verification completed"
        );
    }
    Ok(table_count)
}
