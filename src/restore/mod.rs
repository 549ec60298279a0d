mod logic;
pub(crate) mod db_restore;
pub(crate) mod verification;

pub use logic::RestorePipeline;
