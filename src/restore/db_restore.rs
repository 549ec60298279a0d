// backupd/src/restore/db_restore.rs
use std::path::Path;

use crate::config::{DumpFormat, RestoreConfig};
use crate::process::CommandSpec;
use crate::utils::PgTools;

/// Double-quotes an identifier for use in SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn psql(tools: &PgTools, restore_config: &RestoreConfig) -> CommandSpec {
    CommandSpec::new(&tools.psql)
        .args(["-X", "-v", "ON_ERROR_STOP=1"])
        .max_output_bytes(restore_config.max_output_bytes)
}

/// `SELECT 1` against the target, to fail fast before anything destructive.
pub(crate) fn connection_check_command(tools: &PgTools, restore_config: &RestoreConfig) -> CommandSpec {
    let spec = psql(tools, restore_config)
        .arg("-q")
        .timeout(restore_config.command_timeout);
    restore_config.target.apply(spec).args(["-c", "SELECT 1;"])
}

/// Drops the working schema. Everything in it is gone once this succeeds.
///
/// Only `public` is recreated here: dumps never contain it, while any other
/// schema comes back with its own `CREATE SCHEMA` during the restore.
pub(crate) fn reset_schema_command(tools: &PgTools, restore_config: &RestoreConfig) -> CommandSpec {
    let schema = quote_ident(&restore_config.schema);
    let sql = if restore_config.schema == "public" {
        format!("DROP SCHEMA IF EXISTS {schema} CASCADE; CREATE SCHEMA {schema};")
    } else {
        format!("DROP SCHEMA IF EXISTS {schema} CASCADE;")
    };
    let spec = psql(tools, restore_config)
        .arg("-q")
        .timeout(restore_config.command_timeout);
    restore_config.target.apply(spec).args(["-c".to_string(), sql])
}

/// Loads `dump_file` into the freshly reset target: `pg_restore` for custom
/// archives, `psql -f` for plain SQL.
pub(crate) fn restore_command(
    tools: &PgTools,
    restore_config: &RestoreConfig,
    dump_file: &Path,
) -> CommandSpec {
    let file = dump_file.to_string_lossy().into_owned();
    let spec = match restore_config.format {
        DumpFormat::Custom => CommandSpec::new(&tools.pg_restore)
            .args(["--verbose", "--no-owner", "--no-privileges"])
            .max_output_bytes(restore_config.max_output_bytes),
        DumpFormat::Plain => psql(tools, restore_config),
    };
    let spec = restore_config
        .target
        .apply(spec)
        .timeout(restore_config.restore_timeout);
    match restore_config.format {
        DumpFormat::Custom => spec.arg(file),
        DumpFormat::Plain => spec.args(["-f".to_string(), file]),
    }
}
