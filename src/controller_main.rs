use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use fleetdeck::artefact_storage::ArtefactStorage;
use fleetdeck::controller_api::{self, AppState};
use fleetdeck::controller_config::ControllerConfig;
use fleetdeck::cron::CronScheduler;
use fleetdeck::jobs::{HistoryPruneJob, LifecycleActionsJob, OperatorCacheClearJob};
use fleetdeck::lifecycle::{LifecycleActionScheduler, OperatorGateway};
use fleetdeck::logging::init_tracing;
use fleetdeck::operator_gateway::HttpOperatorGateway;
use fleetdeck::store::{JsonStateStore, StateStore};

#[derive(Parser, Debug)]
#[command(name = "fleetdeck-controller", about = "Fleet controller: desired state, artefacts and scheduling")]
struct Args {
    /// Path to the controller config file
    #[arg(default_value = "controller_config.yaml")]
    config: PathBuf,

    /// Listen address, overrides the config file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ControllerConfig::load(&args.config)?;
    let _log_guard = init_tracing(&config.logging, "controller");

    info!("🚀 Fleetdeck controller starting...");
    info!("Config: {}", args.config.display());

    let store: Arc<dyn StateStore> = Arc::new(
        JsonStateStore::open(&config.state_file)
            .with_context(|| format!("Failed to open state file {}", config.state_file.display()))?,
    );
    let storage = Arc::new(ArtefactStorage::from_config(&config)?);
    let gateway: Arc<dyn OperatorGateway> = Arc::new(HttpOperatorGateway::new(
        config.operators.clone(),
        config.operator_timeout,
    )?);
    info!("Known operators: {:?}", config.operators.keys().collect::<Vec<_>>());

    let mut cron = CronScheduler::new(store.clone())
        .with_failure_backoff(config.cron.failure_backoff)
        .with_fallback_retry(config.cron.fallback_retry);
    let lifecycle = Arc::new(LifecycleActionScheduler::new(
        store.clone(),
        gateway.clone(),
        cron.handle(),
    ));
    cron.register(Arc::new(LifecycleActionsJob::new(
        lifecycle.clone(),
        config.cron.lifecycle_actions_cooldown,
    )));
    cron.register(Arc::new(HistoryPruneJob::new(
        store.clone(),
        config.cron.history_retention,
        config.cron.history_prune_cooldown,
    )));
    cron.register(Arc::new(OperatorCacheClearJob::new(
        gateway,
        config.cron.cache_max_age,
        config.cron.cache_clear_cooldown,
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cron_task = tokio::spawn(cron.run(shutdown_rx));

    let app = controller_api::router(
        AppState {
            store,
            storage,
            lifecycle,
        },
        config.max_upload_bytes,
    );

    let listen = args.listen.unwrap_or(config.listen);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("✅ Fleetdeck controller listening on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("🔙 Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    cron_task.await?;
    Ok(())
}
