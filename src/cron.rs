//! Periodic job loop of the controller.
//!
//! One task owns every registered [`CronJob`]. Next-run times live in the
//! [`StateStore`] so they survive restarts and can be moved forward from
//! request handlers through a [`CronHandle`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::StoreResult;
use crate::model::CronjobExecution;
use crate::store::StateStore;

/// Wait used when a pass fails before any job could run.
pub const FALLBACK_RETRY: Duration = Duration::from_secs(60);
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(5);
/// Longest cooldown honoured; anything longer is clamped.
const MAX_COOLDOWN: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `now + span`, or `None` when the result is not a representable date.
pub fn time_after(now: DateTime<Utc>, span: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(span)
        .ok()
        .and_then(|span| now.checked_add_signed(span))
}

#[async_trait]
pub trait CronJob: Send + Sync {
    /// Stable key under which the next run is persisted.
    fn job_type(&self) -> &str;
    fn cooldown(&self) -> Duration;
    async fn run(&self) -> Result<()>;
}

/// Moves a job's next run forward and wakes the loop.
#[derive(Clone)]
pub struct CronHandle {
    store: Arc<dyn StateStore>,
    wake: mpsc::UnboundedSender<Duration>,
}

impl CronHandle {
    /// Run `job_type` no later than `at`. A job already planned earlier
    /// keeps its time.
    pub fn reschedule(&self, job_type: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let planned = self
            .store
            .list_cronjob_executions()?
            .into_iter()
            .find(|e| e.job_type == job_type)
            .map(|e| e.next_execution);
        if planned.map_or(true, |planned| planned > at) {
            self.store.upsert_cronjob_execution(CronjobExecution {
                job_type: job_type.to_string(),
                next_execution: at,
            })?;
        }
        let after = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if self.wake.send(after).is_err() {
            debug!("Cron loop is not running, {} will run on its next start", job_type);
        }
        Ok(())
    }
}

struct Registered {
    job: Arc<dyn CronJob>,
    next: DateTime<Utc>,
}

pub struct CronScheduler {
    store: Arc<dyn StateStore>,
    jobs: BTreeMap<String, Registered>,
    wake_tx: mpsc::UnboundedSender<Duration>,
    wake_rx: mpsc::UnboundedReceiver<Duration>,
    failure_backoff: Duration,
    fallback_retry: Duration,
}

impl CronScheduler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Self {
            store,
            jobs: BTreeMap::new(),
            wake_tx,
            wake_rx,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            fallback_retry: FALLBACK_RETRY,
        }
    }

    /// Minimum wait after a pass that left a job due (i.e. it failed).
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Wait after a pass that failed as a whole, e.g. on a store error.
    pub fn with_fallback_retry(mut self, retry: Duration) -> Self {
        self.fallback_retry = retry;
        self
    }

    pub fn handle(&self) -> CronHandle {
        CronHandle {
            store: self.store.clone(),
            wake: self.wake_tx.clone(),
        }
    }

    /// New jobs are due immediately unless the store says otherwise.
    pub fn register(&mut self, job: Arc<dyn CronJob>) {
        let job_type = job.job_type().to_string();
        info!("Registered cron job {} (cooldown {:?})", job_type, job.cooldown());
        self.jobs.insert(
            job_type,
            Registered {
                job,
                next: Utc::now(),
            },
        );
    }

    /// Loop until `shutdown` flips to true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.jobs.is_empty() {
            info!("No cron jobs registered, scheduler not started");
            return;
        }
        info!("🚀 Cron scheduler started with {} job(s)", self.jobs.len());
        let mut deadline = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let wait = match self.run_runnable_jobs().await {
                        Ok(wait) => wait,
                        Err(e) => {
                            error!("❌ Cron pass failed, retrying in {:?}: {:#}", self.fallback_retry, e);
                            self.fallback_retry
                        }
                    };
                    debug!("Next cron pass in {:?}", wait);
                    deadline = Instant::now() + wait;
                }
                Some(after) = self.wake_rx.recv() => {
                    // a wake may only bring the next pass forward
                    let woken = Instant::now() + after;
                    if woken < deadline {
                        debug!("Cron loop rescheduled to wake in {:?}", after);
                        deadline = woken;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("🔙 Cron scheduler stopped");
    }

    /// Run every due job once and return how long to sleep.
    pub async fn run_runnable_jobs(&mut self) -> Result<Duration> {
        let persisted = self
            .store
            .list_cronjob_executions()
            .context("refreshing cron schedule")?;
        for execution in persisted {
            if let Some(registered) = self.jobs.get_mut(&execution.job_type) {
                registered.next = execution.next_execution;
            }
        }

        let now = Utc::now();
        for (job_type, registered) in self.jobs.iter_mut() {
            if registered.next > now {
                continue;
            }
            info!("⏰ Running cron job {}", job_type);
            match registered.job.run().await {
                Ok(()) => {
                    let cooldown = registered.job.cooldown().min(MAX_COOLDOWN);
                    let next = time_after(Utc::now(), cooldown)
                        .with_context(|| format!("cooldown of {} out of range", job_type))?;
                    registered.next = next;
                    self.store
                        .upsert_cronjob_execution(CronjobExecution {
                            job_type: job_type.clone(),
                            next_execution: next,
                        })
                        .with_context(|| format!("persisting next run of {}", job_type))?;
                    info!("✅ Cron job {} done, next run at {}", job_type, next);
                }
                Err(e) => {
                    error!("❌ Cron job {} failed, will retry: {:#}", job_type, e);
                }
            }
        }

        let wait = self
            .jobs
            .values()
            .map(|r| r.next)
            .min()
            .and_then(|next| (next - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Ok(if wait.is_zero() {
            self.failure_backoff
        } else {
            wait
        })
    }
}
