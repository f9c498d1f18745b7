pub mod client;
pub mod orchestrator;
pub mod staleness;
pub mod stats;
pub mod types;

use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

pub use client::{LocalTagClient, RemoteTagClient, TagClient, TaggedElements};
pub use orchestrator::RetagOrchestrator;
pub use staleness::is_stale;
pub use stats::{compute_statistics, update_statistics, DictionaryStatistics};
pub use types::{Document, DocumentTagRecord, SweepReport};

pub const TARGET_RETAG: &str = "retag";

/// Runs a retag sweep every `interval`, forever.
pub async fn retag_loop(orchestrator: Arc<RetagOrchestrator>, interval: Duration) {
    info!(target: TARGET_RETAG, "Retag sweep every {:?}", interval);

    loop {
        if let Err(err) = orchestrator.sweep().await {
            error!(target: TARGET_RETAG, "Retag sweep failed: {:#}", err);
        }
        sleep(interval).await;
    }
}
