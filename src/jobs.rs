//! Cron jobs registered by the controller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::cron::CronJob;
use crate::lifecycle::{LifecycleActionScheduler, OperatorGateway, LIFECYCLE_ACTIONS_JOB};
use crate::store::StateStore;

pub const HISTORY_PRUNE_JOB: &str = "history-prune";
pub const OPERATOR_CACHE_CLEAR_JOB: &str = "operator-cache-clear";

pub struct LifecycleActionsJob {
    scheduler: Arc<LifecycleActionScheduler>,
    cooldown: Duration,
}

impl LifecycleActionsJob {
    pub fn new(scheduler: Arc<LifecycleActionScheduler>, cooldown: Duration) -> Self {
        Self {
            scheduler,
            cooldown,
        }
    }
}

#[async_trait]
impl CronJob for LifecycleActionsJob {
    fn job_type(&self) -> &str {
        LIFECYCLE_ACTIONS_JOB
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn run(&self) -> Result<()> {
        let executed = self.scheduler.execute_due().await?;
        if executed > 0 {
            info!("Executed {} scheduled lifecycle action(s)", executed);
        }
        Ok(())
    }
}

/// Drops HISTORY rows older than the retention window.
pub struct HistoryPruneJob {
    store: Arc<dyn StateStore>,
    retention: Duration,
    cooldown: Duration,
}

impl HistoryPruneJob {
    pub fn new(store: Arc<dyn StateStore>, retention: Duration, cooldown: Duration) -> Self {
        Self {
            store,
            retention,
            cooldown,
        }
    }
}

#[async_trait]
impl CronJob for HistoryPruneJob {
    fn job_type(&self) -> &str {
        HISTORY_PRUNE_JOB
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn run(&self) -> Result<()> {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            warn!("History retention {:?} reaches past the earliest date, nothing to prune", self.retention);
            return Ok(());
        };
        let pruned = self.store.prune_history(cutoff)?;
        info!("🧹 Pruned {} history row(s) older than {}", pruned, cutoff);
        Ok(())
    }
}

pub struct OperatorCacheClearJob {
    gateway: Arc<dyn OperatorGateway>,
    max_age: Duration,
    cooldown: Duration,
}

impl OperatorCacheClearJob {
    pub fn new(gateway: Arc<dyn OperatorGateway>, max_age: Duration, cooldown: Duration) -> Self {
        Self {
            gateway,
            max_age,
            cooldown,
        }
    }
}

#[async_trait]
impl CronJob for OperatorCacheClearJob {
    fn job_type(&self) -> &str {
        OPERATOR_CACHE_CLEAR_JOB
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn run(&self) -> Result<()> {
        self.gateway.clear_caches(self.max_age).await
    }
}
