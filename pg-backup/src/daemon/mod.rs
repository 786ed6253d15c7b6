//! Long-running mode: the backup workflow on a cron schedule.

pub mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::context::Context;
use crate::cron::scheduler::CronScheduler;
use crate::notify::Notifier;
use crate::utils::Result;
use shutdown::ShutdownCoordinator;

/// How long a run in progress may keep going after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30 * 60);

pub async fn run(ctx: Context, notifier: Arc<dyn Notifier>) -> Result<()> {
    let schedule = ctx.config.cron.schedule.clone();
    let coordinator = ShutdownCoordinator::new();

    let scheduler = CronScheduler::new(ctx, notifier, coordinator.token()).await?;
    scheduler.schedule(&schedule).await?;
    scheduler.start().await?;
    info!(cron = %schedule, "Backup daemon started");

    coordinator.wait_for_signal().await?;
    scheduler.shutdown().await?;
    coordinator.drain(&scheduler.busy(), SHUTDOWN_GRACE).await;
    Ok(())
}
