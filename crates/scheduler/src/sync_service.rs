use alfred_components::{ComponentManager, SyncReport};
use alfred_core::config::SyncConfig;
use alfred_core::{Error, Result};
use chrono::{DateTime, Local, TimeZone};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Fires [`ComponentManager::sync_all`] once a day at the configured local time.
pub struct SyncService {
    manager: Arc<ComponentManager>,
    schedule: cron::Schedule,
    expr: String,
}

/// Cron expression (with seconds) for a daily run at `hour:minute`.
pub fn daily_expr(hour: u32, minute: u32) -> String {
    format!("0 {} {} * * *", minute, hour)
}

impl SyncService {
    pub fn new(manager: Arc<ComponentManager>, config: &SyncConfig) -> Result<Self> {
        let (hour, minute) = config.hour_minute()?;
        let expr = daily_expr(hour, minute);
        let schedule = cron::Schedule::from_str(&expr)
            .map_err(|e| Error::Config(format!("Invalid sync schedule '{}': {}", expr, e)))?;
        Ok(Self {
            manager,
            schedule,
            expr,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First scheduled run strictly after `now`.
    pub fn next_run_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(now).next()
    }

    pub fn next_run(&self) -> Option<DateTime<Local>> {
        self.next_run_after(&Local::now())
    }

    pub async fn run_now(&self) -> SyncReport {
        let report = self.manager.sync_all().await;
        if report.success() {
            info!(updated = report.updated.len(), "Scheduled sync finished");
        } else {
            warn!(
                failed = ?report.failed,
                error = report.error.as_deref().unwrap_or(""),
                "Scheduled sync finished with errors"
            );
        }
        report
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(schedule = %self.expr, "SyncService started");

        loop {
            let Some(next) = self.next_run() else {
                error!(schedule = %self.expr, "Sync schedule has no upcoming run, stopping");
                break;
            };
            let wait = next
                .signed_duration_since(Local::now())
                .to_std()
                .unwrap_or_default();
            debug!(next = %next.to_rfc3339(), wait_secs = wait.as_secs(), "Next component sync");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.run_now().await;
                }
                _ = shutdown.recv() => {
                    info!("SyncService shutting down");
                    break;
                }
            }
        }
    }
}
