use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::container::ContainerRuntime;
use crate::controller_client::ControllerApi;
use crate::download::DownloadCoordinator;
use crate::executor::DeploymentUpdateExecutor;
use crate::model::{ActionReport, LifecycleAction, UpdateReport};

/// Everything an operator does on behalf of the controller.
pub struct Operator {
    controller: Arc<dyn ControllerApi>,
    runtime: Arc<dyn ContainerRuntime>,
    executor: Arc<DeploymentUpdateExecutor>,
    downloads: Arc<DownloadCoordinator>,
}

fn summary(report: &UpdateReport) -> String {
    format!(
        "{} applied, {} failed",
        report.applied.len(),
        report.failures.len()
    )
}

impl Operator {
    pub fn new(
        controller: Arc<dyn ControllerApi>,
        runtime: Arc<dyn ContainerRuntime>,
        executor: Arc<DeploymentUpdateExecutor>,
        downloads: Arc<DownloadCoordinator>,
    ) -> Self {
        Self {
            controller,
            runtime,
            executor,
            downloads,
        }
    }

    pub async fn execute(&self, server: Uuid, action: LifecycleAction) -> Result<ActionReport> {
        info!("🎬 {} requested for server {}", action, server);
        let (message, update) = match action {
            LifecycleAction::Start => {
                self.start(server).await?;
                ("started".to_string(), None)
            }
            LifecycleAction::Stop => {
                self.runtime.stop(server).await?;
                ("stopped".to_string(), None)
            }
            LifecycleAction::Restart => {
                self.runtime.stop(server).await?;
                self.start(server).await?;
                ("restarted".to_string(), None)
            }
            LifecycleAction::Update => {
                let was_running = self.runtime.is_running(server).await?;
                if was_running {
                    self.runtime.stop(server).await?;
                }
                let reconciled = self.executor.reconcile(server, true).await;
                if was_running {
                    if let Err(e) = self.start(server).await {
                        warn!("⚠️  Server {} did not come back after update: {:#}", server, e);
                        if reconciled.is_ok() {
                            return Err(e);
                        }
                    }
                }
                let report = reconciled?;
                (format!("updated: {}", summary(&report)), Some(report))
            }
            LifecycleAction::HotUpdate => {
                let report = self.executor.reconcile(server, false).await?;
                (format!("hot-updated: {}", summary(&report)), Some(report))
            }
        };
        Ok(ActionReport {
            server,
            action,
            message,
            update,
        })
    }

    async fn start(&self, server: Uuid) -> Result<()> {
        let model = self
            .controller
            .server(server)
            .await
            .with_context(|| format!("Failed to fetch server {} from controller", server))?;
        self.runtime
            .start(&model, &self.executor.server_directory(server))
            .await
    }

    /// Evict cached archives older than `max_age`.
    pub async fn clear_cache(&self, max_age: Duration) -> Result<usize> {
        let downloads = self.downloads.clone();
        tokio::task::spawn_blocking(move || downloads.clean_local_cache(max_age)).await?
    }
}
