//! Per-tick orchestration: job initiation (cron) and the orchestration tick
//! (interval) that drives every in-progress job through its stages.
//!
//! Workers and the reconciler never raise to the scheduler; failures are
//! materialized into persistent state and the next tick picks up from there.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Settings;
use crate::db::DbPool;
use crate::error::AppResult;
use crate::models::{ExportKind, ExportState, JobStatus, StageStatus};
use crate::pipeline::{archive, images, poller, reconciler, report, stats, website};
use crate::services::{ObjectStore, TaskService};

/// Seconds to wait before the bootstrap poll after job initiation, giving
/// the remote service time to register the new tasks.
const BOOTSTRAP_POLL_DELAY: Duration = Duration::from_secs(20);

/// Everything a tick needs, threaded through instead of process globals.
pub struct PipelineContext {
    pub db: DbPool,
    pub tasks: Arc<dyn TaskService>,
    pub storage: Option<ObjectStore>,
    pub settings: Arc<Settings>,
    /// Bootstrap poll delay; shortened in tests.
    pub bootstrap_poll_delay: Duration,
}

impl PipelineContext {
    pub fn new(
        db: DbPool,
        tasks: Arc<dyn TaskService>,
        storage: Option<ObjectStore>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            db,
            tasks,
            storage,
            settings,
            bootstrap_poll_delay: BOOTSTRAP_POLL_DELAY,
        }
    }
}

/// Cron-triggered job initiator: create the job, capture the upstream
/// snapshots, run the image stage and bootstrap-poll its tasks.
pub async fn init_job(ctx: &PipelineContext) -> AppResult<String> {
    debug!("Starting a new job");
    let job = ctx
        .db
        .insert_job(&ctx.settings.automation.timezone)
        .await?;
    info!("Created new job {}", job.id);

    // Capture what the upstream collections look like right now. If none of
    // them can be reached the remote service is down and the whole job is
    // failed up front.
    let sources = &ctx.settings.image_export.source_collections;
    let mut failures: Vec<String> = Vec::new();
    let mut reachable = sources.is_empty();
    for (name, collection) in sources {
        match ctx.tasks.collection_dates(collection).await {
            Ok(dates) => {
                reachable = true;
                let last_image = dates
                    .last()
                    .map(|d| d.format("%Y_%m_%d").to_string())
                    .unwrap_or_default();
                if let Err(e) = ctx
                    .db
                    .insert_snapshot(&job.id, name, collection, dates.len() as i32, &last_image)
                    .await
                {
                    error!("Error saving upstream snapshot '{}': {}", name, e);
                }
            }
            Err(e) => {
                error!("Error reading upstream collection '{}': {}", name, e);
                failures.push(format!("Error reading upstream collection '{}': {}", name, e));
            }
        }
    }
    if !reachable {
        let message = failures.join(" | ");
        ctx.db
            .fail_job_and_stages(&job.id, &format!("Error connecting to compute service: {}", message))
            .await?;
        return Ok(job.id);
    }
    for failure in &failures {
        ctx.db
            .set_job_status(&job.id, JobStatus::Running, Some(failure.as_str()))
            .await?;
    }

    images::run_image_stage(&ctx.db, ctx.tasks.as_ref(), &job.id, &ctx.settings.image_export)
        .await?;

    // Bootstrap polling for whatever the image stage just submitted.
    debug!("Bootstrap-polling created tasks");
    tokio::time::sleep(ctx.bootstrap_poll_delay).await;
    poller::run_poll_pass(&ctx.db, ctx.tasks.as_ref(), Some(&job.id)).await?;

    Ok(job.id)
}

/// One orchestration tick: poll due exports, then advance every job that
/// still has work pending.
pub async fn run_tick(ctx: &PipelineContext) -> AppResult<()> {
    debug!("Starting orchestration tick");

    if let Err(e) = poller::run_poll_pass(&ctx.db, ctx.tasks.as_ref(), None).await {
        error!("Poll pass failed: {}", e);
    }

    let jobs = ctx.db.list_orchestratable_jobs().await?;
    debug!("Orchestrating {} pending job(s)", jobs.len());
    for job in jobs {
        if let Err(e) = orchestrate_job(ctx, &job.id).await {
            error!("Error orchestrating job {}: {}", job.id, e);
        }
    }
    Ok(())
}

/// Advance one job: reconcile, run whichever stage worker is now eligible,
/// then report when the job has reached a terminal state.
pub async fn orchestrate_job(ctx: &PipelineContext, job_id: &str) -> AppResult<()> {
    debug!("Orchestrating job {}", job_id);
    let mut job = reconciler::reconcile_job(&ctx.db, job_id).await?;

    if JobStatus::parse(&job.job_status) == Some(JobStatus::Running) {
        if StageStatus::parse(&job.image_export_status) == Some(StageStatus::Running) {
            debug!("Image exports are still running");
            return Ok(());
        }

        match StageStatus::parse(&job.stats_export_status) {
            Some(StageStatus::Pending) => {
                stats::run_stats_stage(
                    &ctx.db,
                    ctx.tasks.as_ref(),
                    ctx.storage.as_ref(),
                    job_id,
                    &ctx.settings.stats_export,
                )
                .await?;
                job = ctx.db.require_job(job_id).await?;
            }
            Some(StageStatus::Running) => {
                debug!("Stats exports are still running");
                return Ok(());
            }
            Some(StageStatus::Completed) | Some(StageStatus::Failed) => {
                let running_tables = ctx
                    .db
                    .count_exports_in_state(job_id, ExportKind::Table, ExportState::Running)
                    .await?;
                if running_tables > 0 {
                    debug!("Stats exports are still running");
                    return Ok(());
                }
                // Stats finished: restore archived versions over any failed
                // outputs before the website is updated.
                if let Some(storage) = ctx.storage.as_ref() {
                    archive::rollback_file_transfers(&ctx.db, storage, job_id).await?;
                }
                job = reconciler::reconcile_job(&ctx.db, job_id).await?;
            }
            _ => return Ok(()),
        }
    }

    if JobStatus::parse(&job.job_status) == Some(JobStatus::Running)
        && matches!(
            StageStatus::parse(&job.stats_export_status),
            Some(StageStatus::Completed) | Some(StageStatus::Failed)
        )
    {
        website::run_website_stage(&ctx.db, ctx.storage.as_ref(), job_id, &ctx.settings).await?;
        job = reconciler::reconcile_job(&ctx.db, job_id).await?;
    }

    let job_done = matches!(
        JobStatus::parse(&job.job_status),
        Some(JobStatus::Completed) | Some(JobStatus::Failed)
    );
    if job_done && StageStatus::parse(&job.report_status) == Some(StageStatus::Pending) {
        report::run_report_stage(&ctx.db, &ctx.settings.email, job_id).await?;
    }

    Ok(())
}
