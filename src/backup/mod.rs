mod logic;
pub(crate) mod db_dump;

pub use logic::BackupPipeline;
