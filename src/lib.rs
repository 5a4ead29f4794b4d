pub mod database;
pub mod error;
pub mod ingest;
pub mod media;
pub mod ml;
pub mod orchestrator;
pub mod queue;
pub mod utils;
pub mod vision;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{PipelineError, Result};
pub use orchestrator::{PipelineContext, TaskOutcome, Worker};
pub use utils::Settings;

/// Wall-clock seconds since the epoch; a clock before 1970 reads as zero.
pub(crate) fn now_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
