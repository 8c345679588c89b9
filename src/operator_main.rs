use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fleetdeck::container::{ContainerRuntime, DockerRuntime};
use fleetdeck::controller_client::{ControllerApi, HttpControllerClient};
use fleetdeck::dispatcher::WorkerDispatcher;
use fleetdeck::download::{DownloadCoordinator, HttpFetcher};
use fleetdeck::executor::DeploymentUpdateExecutor;
use fleetdeck::logging::init_tracing;
use fleetdeck::operator::Operator;
use fleetdeck::operator_api;
use fleetdeck::operator_config::OperatorConfig;

#[derive(Parser, Debug)]
#[command(name = "fleetdeck-operator", about = "Per-host operator: containers and artefact installs")]
struct Args {
    /// Path to the operator config file
    #[arg(default_value = "operator_config.yaml")]
    config: PathBuf,

    /// Listen address, overrides the config file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = OperatorConfig::load(&args.config)?;
    let _log_guard = init_tracing(&config.logging, "operator");

    info!("🚀 Fleetdeck operator starting...");
    info!("Operator ID: {}", config.operator_id);
    info!("Controller: {}", config.controller_url);

    for dir in [&config.data_directory, &config.cache_directory] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let controller: Arc<dyn ControllerApi> = Arc::new(HttpControllerClient::new(
        &config.controller_url,
        config.request_timeout,
    )?);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(
            config.container.name_prefix.clone(),
            config.container.stop_timeout,
        )
        .await?,
    );

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("Failed to create HTTP client")?;
    let downloads = Arc::new(DownloadCoordinator::new(
        &config.cache_directory,
        Arc::new(HttpFetcher::new(http)),
        WorkerDispatcher::new("download", config.download_workers)?,
    ));
    let executor = Arc::new(DeploymentUpdateExecutor::new(
        controller.clone(),
        runtime.clone(),
        downloads.clone(),
        WorkerDispatcher::new("validate", config.validation_workers)?,
        &config.data_directory,
        config.strict_validation,
    ));
    let operator = Arc::new(Operator::new(controller, runtime, executor, downloads));

    let app = operator_api::router(operator);
    let listen = args.listen.unwrap_or(config.listen);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("✅ Fleetdeck operator listening on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("🔙 Shutdown requested");
        })
        .await?;
    Ok(())
}
