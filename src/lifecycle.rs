//! Immediate and delayed lifecycle actions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::cron::{time_after, CronHandle};
use crate::model::{ActionReport, LifecycleAction, ScheduledLifecycleAction, ServerModel};
use crate::store::StateStore;

/// Cron job type that executes due scheduled actions.
pub const LIFECYCLE_ACTIONS_JOB: &str = "lifecycle-actions";

/// The controller's way of reaching operators.
#[async_trait]
pub trait OperatorGateway: Send + Sync {
    async fn execute(&self, server: &ServerModel, action: LifecycleAction) -> Result<ActionReport>;
    /// Ask every known operator to drop cached archives older than `max_age`.
    async fn clear_caches(&self, max_age: Duration) -> Result<()>;
}

/// A delay that would put the action past the last representable date.
#[derive(Debug, thiserror::Error)]
#[error("delay of {0:?} is out of range")]
pub struct DelayOutOfRange(pub Duration);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleOutcome {
    Executed(ActionReport),
    Scheduled(ScheduledLifecycleAction),
}

pub struct LifecycleActionScheduler {
    store: Arc<dyn StateStore>,
    gateway: Arc<dyn OperatorGateway>,
    cron: CronHandle,
}

impl LifecycleActionScheduler {
    pub fn new(store: Arc<dyn StateStore>, gateway: Arc<dyn OperatorGateway>, cron: CronHandle) -> Self {
        Self {
            store,
            gateway,
            cron,
        }
    }

    /// Execute `action` now, or persist it for `now + delay`.
    pub async fn schedule(
        &self,
        server: Uuid,
        action: LifecycleAction,
        delay: Option<Duration>,
    ) -> Result<ScheduleOutcome> {
        let model = self.store.get_server(server)?;
        let delay = match delay {
            Some(delay) if !delay.is_zero() => delay,
            _ => {
                info!("▶️  Executing {} on server {} ({})", action, model.name, server);
                let report = self.gateway.execute(&model, action).await?;
                return Ok(ScheduleOutcome::Executed(report));
            }
        };

        let at = time_after(Utc::now(), delay).ok_or(DelayOutOfRange(delay))?;
        let scheduled = self.store.upsert_scheduled_action(server, action, at)?;
        info!(
            "📅 Scheduled {} on server {} ({}) for {}",
            action, model.name, server, scheduled.time_of_execution
        );
        self.cron.reschedule(LIFECYCLE_ACTIONS_JOB, scheduled.time_of_execution)?;
        Ok(ScheduleOutcome::Scheduled(scheduled))
    }

    /// Run every due action. Stops at the first failure and leaves it and
    /// the rest pending. Returns how many were executed.
    pub async fn execute_due(&self) -> Result<usize> {
        let due = self.store.list_due_actions(Utc::now())?;
        let mut executed = 0;
        for pending in due {
            let outcome: Result<ActionReport> = async {
                let model = self.store.get_server(pending.server)?;
                self.gateway.execute(&model, pending.action).await
            }
            .await;
            match outcome {
                Ok(report) => {
                    info!("✅ Scheduled {} on {}: {}", pending.action, pending.server, report.message);
                    self.store.delete_scheduled_action(pending.uuid)?;
                    executed += 1;
                }
                Err(e) => {
                    error!(
                        "❌ Scheduled {} on {} failed, keeping it pending: {:#}",
                        pending.action, pending.server, e
                    );
                    return Err(e.context(format!(
                        "executing scheduled {} on server {}",
                        pending.action, pending.server
                    )));
                }
            }
        }
        Ok(executed)
    }
}
