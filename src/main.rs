use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use tagservice::api::{self, AppState};
use tagservice::db::Database;
use tagservice::environment::ServiceConfig;
use tagservice::logging::configure_logging;
use tagservice::retag::{retag_loop, LocalTagClient, RetagOrchestrator};
use tagservice::tagger::{reload_loop, TaggerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    configure_logging();

    let config = ServiceConfig::from_env();
    info!("Starting tag service with {:?}", config);

    let db = Database::new(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path))?;

    let registry = Arc::new(TaggerRegistry::new());
    match registry.reload(&db).await {
        Ok(report) => info!(
            "Initial build: {} dictionaries ready, {} failed",
            report.rebuilt.len(),
            report.failed.len()
        ),
        Err(e) => error!("Failed to read dictionary definitions: {}", e),
    }

    let reload_handle = tokio::spawn(reload_loop(
        Arc::clone(&registry),
        Arc::new(db.clone()),
        config.reload_interval,
    ));

    let retag_handle = config.retag_interval.map(|interval| {
        let client = Arc::new(LocalTagClient::new(Arc::clone(&registry), db.clone()));
        let orchestrator = Arc::new(RetagOrchestrator::new(
            client,
            db.clone(),
            config.document_elements.clone(),
            config.retag_concurrency,
            config.stats_top_n,
        ));
        tokio::spawn(retag_loop(orchestrator, interval))
    });

    let state = AppState::new(Arc::clone(&registry), db.clone());

    tokio::select! {
        result = api::api_loop(config.port, state) => {
            if let Err(e) = result {
                error!("API server stopped: {:#}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received ctrl-c, shutting down");
        }
    }

    reload_handle.abort();
    if let Some(handle) = retag_handle {
        handle.abort();
    }

    info!("Database stats at shutdown: {}", db.collect_stats().await?);
    Ok(())
}
