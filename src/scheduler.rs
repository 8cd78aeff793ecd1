use std::sync::Arc;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::coordinator::{RunCoordinator, Trigger};
use crate::error::SyncError;
use crate::local_store::SqliteStore;
use crate::remote::RemoteApiClient;

/// Default alarm cadence: every 10 minutes.
pub const DEFAULT_CRON: &str = "0 */10 * * * *";

pub struct SchedulerConfig {
    pub cron_expression: String,
    pub daemon: bool,
}

impl SchedulerConfig {
    pub fn new(cron: String, daemon: bool) -> Self {
        Self {
            cron_expression: cron,
            daemon,
        }
    }
}

/// Fires alarm-triggered pulls on the configured cadence until Ctrl+C.
/// Alarms that land while a pull is still running are simply dropped; the
/// coordinator's latch rejects them.
pub async fn start_scheduler(
    coordinator: Arc<RunCoordinator<RemoteApiClient, SqliteStore>>,
    config: SchedulerConfig,
) -> Result<()> {
    let mut scheduler = JobScheduler::new().await?;

    info!("⏰ Scheduler initialized with cron: {}", config.cron_expression);

    let job = Job::new_async(config.cron_expression.as_str(), move |_uuid, _l| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            info!("🔄 Alarm pull triggered");
            match coordinator.run_mirror_pull(Trigger::Alarm).await {
                Ok(stats) => {
                    info!("✅ Alarm pull completed: {}", stats.summary());
                }
                Err(SyncError::AlreadyRunning) => {
                    debug!("Previous pull still running, alarm skipped");
                }
                Err(e) => {
                    error!("❌ Alarm pull failed: {}", e);
                }
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    if config.daemon {
        info!("🔄 Running as daemon. Press Ctrl+C to stop.");
    } else {
        info!("⏰ Scheduler started. Keeping process alive...");
    }
    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down scheduler...");

    scheduler.shutdown().await?;
    Ok(())
}
