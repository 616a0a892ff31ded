//! Scheduler: two recurring triggers on one cooperative loop.
//!
//! The cron-based job initiator and the interval-based orchestration tick
//! run to completion on the same task, so overlapping firings are
//! structurally impossible. Missed interval ticks are coalesced; a cron
//! firing observed past its misfire grace window is skipped.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::pipeline::{orchestrator, PipelineContext};

/// Grace window for a missed daily-job firing.
pub const DAILY_MISFIRE_GRACE: Duration = Duration::from_secs(300);
/// Grace window for a missed orchestration tick.
pub const TICK_MISFIRE_GRACE: Duration = Duration::from_secs(60);

/// Parse a standard 5-field crontab expression (`min hour dom month dow`).
pub fn parse_cron_expr(expr: &str) -> Result<cron::Schedule, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }
    // The cron crate wants a seconds field up front.
    cron::Schedule::from_str(&format!("0 {}", fields.join(" "))).map_err(|e| e.to_string())
}

/// Write the liveness heartbeat: the current UTC timestamp, RFC 3339.
pub fn write_heartbeat(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, Utc::now().to_rfc3339())
}

/// Age of the heartbeat, when the file exists and parses.
pub fn heartbeat_age(path: &Path) -> Option<chrono::Duration> {
    let raw = std::fs::read_to_string(path).ok()?;
    let stamp = DateTime::parse_from_rfc3339(raw.trim()).ok()?;
    Some(Utc::now().signed_duration_since(stamp.with_timezone(&Utc)))
}

/// The blocking scheduler loop. Returns on SIGTERM/SIGINT after the
/// currently executing trigger finishes.
pub struct Scheduler {
    ctx: Arc<PipelineContext>,
    timezone: Tz,
    schedule: cron::Schedule,
    tick_interval: Duration,
    heartbeat_file: std::path::PathBuf,
}

impl Scheduler {
    pub fn new(ctx: Arc<PipelineContext>) -> AppResult<Self> {
        let automation = &ctx.settings.automation;
        let schedule = parse_cron_expr(&automation.daily_job.cron)
            .map_err(|e| AppError::InvalidInput(format!("invalid cron expression: {}", e)))?;
        let timezone = ctx.settings.timezone();
        let tick_interval =
            Duration::from_secs(automation.orchestration_job.interval_minutes * 60);
        let heartbeat_file = automation.heartbeat.heartbeat_file.clone();
        Ok(Self {
            ctx,
            timezone,
            schedule,
            tick_interval,
            heartbeat_file,
        })
    }

    fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.schedule
            .upcoming(self.timezone)
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(&self) -> AppResult<()> {
        info!(
            "Scheduler started (daily job: '{}' {}, tick: every {}s)",
            self.ctx.settings.automation.daily_job.cron,
            self.timezone,
            self.tick_interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        // Coalesce missed firings to one instead of catching up N times.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first interval::tick resolves immediately; skip it so the
        // first orchestration happens one interval from startup.
        ticker.tick().await;

        let mut next_daily = self.next_fire();

        loop {
            // A schedule with no upcoming firing effectively never fires.
            let daily_wait = next_daily
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::from_secs(86_400 * 365));

            tokio::select! {
                _ = ticker.tick() => {
                    self.run_tick_once().await;
                }
                _ = tokio::time::sleep(daily_wait) => {
                    if let Some(at) = next_daily {
                        self.run_daily_once(at).await;
                    }
                    next_daily = self.next_fire();
                }
                _ = shutdown_signal() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run_tick_once(&self) {
        debug!("poll_and_orchestrate: start");
        if let Err(e) = orchestrator::run_tick(&self.ctx).await {
            error!("Orchestration tick failed: {}", e);
        }
        if let Err(e) = write_heartbeat(&self.heartbeat_file) {
            error!("Failed to write heartbeat: {}", e);
        }
        debug!("poll_and_orchestrate: end");
    }

    async fn run_daily_once(&self, scheduled_at: DateTime<Utc>) {
        let lateness = Utc::now().signed_duration_since(scheduled_at);
        if lateness.to_std().unwrap_or(Duration::ZERO) > DAILY_MISFIRE_GRACE {
            warn!(
                "Skipping daily job firing scheduled at {} ({}s past the grace window)",
                scheduled_at,
                lateness.num_seconds()
            );
            return;
        }
        info!("create_job: start");
        match orchestrator::init_job(&self.ctx).await {
            Ok(job_id) => info!("create_job: end ({})", job_id),
            Err(e) => error!("Daily job initiation failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cron_expr() {
        assert!(parse_cron_expr("0 2 * * *").is_ok());
        assert!(parse_cron_expr("*/5 * * * *").is_ok());
        assert!(parse_cron_expr("0 2 * *").is_err());
        assert!(parse_cron_expr("not a cron").is_err());
        assert!(parse_cron_expr("0 2 * * * *").is_err());
    }

    #[test]
    fn test_heartbeat_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("heartbeat.txt");
        write_heartbeat(&path).unwrap();
        let age = heartbeat_age(&path).unwrap();
        assert!(age.num_seconds() < 5);
    }

    #[test]
    fn test_heartbeat_age_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(heartbeat_age(&dir.path().join("absent")).is_none());
    }

    #[test]
    fn test_heartbeat_age_of_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.txt");
        std::fs::write(&path, "not a timestamp").unwrap();
        assert!(heartbeat_age(&path).is_none());
    }
}
