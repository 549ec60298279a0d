// backupd/src/backup/db_dump.rs
use std::path::Path;

use crate::config::{BackupConfig, DumpFormat};
use crate::process::CommandSpec;
use crate::utils::PgTools;

/// `pg_dump` of the source database into `output_file`.
pub(crate) fn dump_command(tools: &PgTools, backup_config: &BackupConfig, output_file: &Path) -> CommandSpec {
    let format = match backup_config.format {
        DumpFormat::Custom => "--format=custom",
        DumpFormat::Plain => "--format=plain",
    };
    let spec = CommandSpec::new(&tools.pg_dump)
        .args([format, "--verbose", "--no-owner"])
        .timeout(backup_config.dump_timeout)
        .max_output_bytes(backup_config.max_output_bytes);
    backup_config
        .source
        .apply(spec)
        .args(["-f".to_string(), output_file.to_string_lossy().into_owned()])
}
