use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use super::run_cron;
use crate::context::Context;
use crate::notify::Notifier;
use crate::utils::{BackupError, Result};

/// Held for the length of one run. A tick that cannot take it is skipped.
pub struct RunGuard {
    busy: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn acquire(busy: &Arc<AtomicBool>) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { busy: busy.clone() })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

fn scheduler_error(e: impl std::fmt::Display) -> BackupError {
    BackupError::Scheduler(e.to_string())
}

pub struct CronScheduler {
    scheduler: Mutex<JobScheduler>,
    ctx: Context,
    notifier: Arc<dyn Notifier>,
    busy: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl CronScheduler {
    pub async fn new(ctx: Context, notifier: Arc<dyn Notifier>, shutdown: CancellationToken) -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            ctx,
            notifier,
            busy: Arc::new(AtomicBool::new(false)),
            shutdown,
        })
    }

    /// Set while a run is in progress
    pub fn busy(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }

    /// Run the backup workflow on every tick of `cron_expression` (local time).
    pub async fn schedule(&self, cron_expression: &str) -> Result<()> {
        let ctx = self.ctx.clone();
        let notifier = self.notifier.clone();
        let busy = self.busy.clone();
        let shutdown = self.shutdown.clone();

        let job = Job::new_async_tz(cron_expression, Local, move |_uuid, _lock| {
            let ctx = ctx.clone();
            let notifier = notifier.clone();
            let busy = busy.clone();
            let shutdown = shutdown.clone();
            Box::pin(async move {
                if shutdown.is_cancelled() {
                    tracing::info!("Skipping scheduled run: shutting down");
                    return;
                }
                let Some(_guard) = RunGuard::acquire(&busy) else {
                    tracing::warn!("Skipping scheduled run: previous run still in progress");
                    return;
                };

                let host = ctx.config.wale.host.clone();
                let today = Local::now().date_naive();
                let report = run_cron(&ctx, notifier.as_ref(), &ctx.config.cron, today, &host).await;
                tracing::info!(
                    run_id = %report.run_id,
                    successes = report.successes.len(),
                    failures = report.failures.len(),
                    "Scheduled run finished"
                );
            })
        })
        .map_err(scheduler_error)?;

        self.scheduler
            .lock()
            .await
            .add(job)
            .await
            .map_err(scheduler_error)?;
        tracing::info!(cron = %cron_expression, "Backup run scheduled");
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.lock().await.start().await.map_err(scheduler_error)?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.lock().await.shutdown().await.map_err(scheduler_error)?;
        Ok(())
    }
}
