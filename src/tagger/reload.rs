use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use super::registry::TaggerRegistry;
use super::source::DictionarySource;
use super::TARGET_TAGGER;

/// Periodically rebuilds the dictionaries whose blacklist or whitelist changed.
///
/// Runs independently of requests; a failed pass is logged and retried on
/// the next tick.
pub async fn reload_loop<S>(registry: Arc<TaggerRegistry>, source: Arc<S>, interval: Duration)
where
    S: DictionarySource + ?Sized,
{
    info!(target: TARGET_TAGGER, "Dictionary reload every {:?}", interval);

    loop {
        sleep(interval).await;

        match registry.reload(source.as_ref()).await {
            Ok(report) if report.rebuilt.is_empty() => {
                debug!(target: TARGET_TAGGER, "All {} dictionaries are up to date", report.unchanged.len());
            }
            Ok(report) => {
                info!(target: TARGET_TAGGER, "Reloaded dictionaries: {}", report.rebuilt.join(", "));
            }
            Err(err) => {
                error!(target: TARGET_TAGGER, "Failed to read dictionary definitions: {}", err);
            }
        }
    }
}
