//! Job reconciler: advances per-stage and overall job statuses from
//! persistent state alone. No remote calls; idempotent (rerunning on a
//! steady-state job yields no writes).
//!
//! Stage order is strict: image, stats, website, report. A later stage is
//! only examined once every earlier stage is terminal.

use tracing::debug;

use crate::db::{jobs::Stage, DbPool};
use crate::entity::job;
use crate::error::AppResult;
use crate::models::{
    ExportKind, ExportState, JobStatus, StageStatus, WebsiteUpdateStatus,
};

const MSG_IMAGE_TASKS_LOST: &str = "One or more Image tasks might have failed to create or could not be saved to DB. Check logs and remote tasks for details.";
const MSG_IMAGE_FAILED: &str = "One or more image exports failed";
const MSG_STATS_TASKS_LOST: &str = "One or more Stats tasks might have failed to create or could not be saved to DB. Check logs and remote tasks for details.";
const MSG_STATS_FAILED: &str = "One or more Stats exports failed";
const MSG_STATS_ABNORMAL: &str =
    "Program produced an abnormal state while running Stats export procedure.";
const MSG_WEBSITE_ABNORMAL: &str =
    "Program produced an abnormal state while running Website update procedure.";
const MSG_IMAGE_UNKNOWN: &str = "Image export procedure entered an unknown state";
const MSG_STATS_UNKNOWN: &str = "Stats export procedure entered an unknown state";
const MSG_JOB_UNKNOWN: &str = "Job execution entered an unknown state";

fn any_running(states: &[ExportState]) -> bool {
    states.iter().any(|s| *s == ExportState::Running)
}

fn any_failed(states: &[ExportState]) -> bool {
    states.iter().any(|s| *s == ExportState::Failed)
}

/// Reconcile one job. Returns the job as it stands after reconciliation.
pub async fn reconcile_job(db: &DbPool, job_id: &str) -> AppResult<job::Model> {
    let job = db.require_job(job_id).await?;

    // Finished jobs never advance again (only the reporter touches
    // report_status afterwards).
    if JobStatus::parse(&job.job_status) != Some(JobStatus::Running) {
        return Ok(job);
    }

    let image = update_image_stage(db, &job).await?;
    if !image.is_terminal() {
        return db.require_job(job_id).await;
    }

    let job = db.require_job(job_id).await?;
    let stats = update_stats_stage(db, &job).await?;
    if !stats.is_terminal() {
        // A failed image stage with stats never started cannot make further
        // progress: no stats worker will run and the website stage is gated
        // on stats. Fail the job directly.
        if image == StageStatus::Failed
            && stats == StageStatus::Pending
            && db.get_website_update_for_job(job_id).await?.is_none()
        {
            db.set_job_status(job_id, JobStatus::Failed, None).await?;
        }
        return db.require_job(job_id).await;
    }

    let job = db.require_job(job_id).await?;
    let website = update_website_stage(db, &job).await?;
    if !matches!(
        website,
        WebsiteUpdateStatus::Completed | WebsiteUpdateStatus::Failed
    ) {
        return db.require_job(job_id).await;
    }

    let job = db.require_job(job_id).await?;
    update_job_status(db, &job, image, stats, website).await?;
    db.require_job(job_id).await
}

/// Image stage rules over the multiset of image export states.
async fn update_image_stage(db: &DbPool, job: &job::Model) -> AppResult<StageStatus> {
    let states = db.export_states(&job.id, ExportKind::Image).await?;

    match StageStatus::parse(&job.image_export_status) {
        Some(StageStatus::Pending) => {
            if states.is_empty() {
                // The stage worker has not run yet.
                Ok(StageStatus::Pending)
            } else {
                // Records exist but the status was never advanced.
                db.set_stage_status(
                    &job.id,
                    Stage::Image,
                    StageStatus::Failed,
                    Some(MSG_IMAGE_TASKS_LOST),
                )
                .await?;
                Ok(StageStatus::Failed)
            }
        }

        Some(StageStatus::Running) => {
            if states.is_empty() {
                // Nothing was required after all.
                db.set_stage_status(&job.id, Stage::Image, StageStatus::Completed, None)
                    .await?;
                Ok(StageStatus::Completed)
            } else if !any_running(&states) {
                if any_failed(&states) {
                    db.set_stage_status(
                        &job.id,
                        Stage::Image,
                        StageStatus::Failed,
                        Some(MSG_IMAGE_FAILED),
                    )
                    .await?;
                    Ok(StageStatus::Failed)
                } else {
                    db.set_stage_status(&job.id, Stage::Image, StageStatus::Completed, None)
                        .await?;
                    Ok(StageStatus::Completed)
                }
            } else {
                Ok(StageStatus::Running)
            }
        }

        Some(StageStatus::Failed) => Ok(StageStatus::Failed),

        Some(StageStatus::Completed) => {
            if any_running(&states) {
                // A late-arriving task was detected; revert while stats has
                // not started yet. Once stats is underway the stage stays
                // terminal and the late task is only observed by the poller.
                let stats = StageStatus::parse(&job.stats_export_status);
                if matches!(
                    stats,
                    Some(StageStatus::NotRequired) | Some(StageStatus::Pending)
                ) {
                    db.set_stage_status(&job.id, Stage::Image, StageStatus::Running, None)
                        .await?;
                    Ok(StageStatus::Running)
                } else {
                    Ok(StageStatus::Completed)
                }
            } else if any_failed(&states) {
                db.set_stage_status(
                    &job.id,
                    Stage::Image,
                    StageStatus::Failed,
                    Some(MSG_IMAGE_FAILED),
                )
                .await?;
                Ok(StageStatus::Failed)
            } else {
                Ok(StageStatus::Completed)
            }
        }

        _ => {
            db.set_stage_status(
                &job.id,
                Stage::Image,
                StageStatus::Failed,
                Some(MSG_IMAGE_UNKNOWN),
            )
            .await?;
            Ok(StageStatus::Failed)
        }
    }
}

/// Stats stage rules, symmetric to the image stage with the NOT_REQUIRED
/// and empty-PENDING extras.
async fn update_stats_stage(db: &DbPool, job: &job::Model) -> AppResult<StageStatus> {
    let states = db.export_states(&job.id, ExportKind::Table).await?;

    match StageStatus::parse(&job.stats_export_status) {
        Some(StageStatus::NotRequired) => {
            if states.is_empty() {
                db.set_stage_status(&job.id, Stage::Stats, StageStatus::Completed, None)
                    .await?;
                Ok(StageStatus::Completed)
            } else {
                db.set_stage_status(
                    &job.id,
                    Stage::Stats,
                    StageStatus::Failed,
                    Some(MSG_STATS_ABNORMAL),
                )
                .await?;
                Ok(StageStatus::Failed)
            }
        }

        Some(StageStatus::Pending) => {
            if states.is_empty() {
                // The stage worker may yet run (and may produce zero tasks).
                Ok(StageStatus::Pending)
            } else {
                db.set_stage_status(
                    &job.id,
                    Stage::Stats,
                    StageStatus::Failed,
                    Some(MSG_STATS_TASKS_LOST),
                )
                .await?;
                Ok(StageStatus::Failed)
            }
        }

        Some(StageStatus::Running) => {
            if states.is_empty() {
                db.set_stage_status(&job.id, Stage::Stats, StageStatus::Completed, None)
                    .await?;
                Ok(StageStatus::Completed)
            } else if !any_running(&states) {
                if any_failed(&states) {
                    db.set_stage_status(
                        &job.id,
                        Stage::Stats,
                        StageStatus::Failed,
                        Some(MSG_STATS_FAILED),
                    )
                    .await?;
                    Ok(StageStatus::Failed)
                } else {
                    db.set_stage_status(&job.id, Stage::Stats, StageStatus::Completed, None)
                        .await?;
                    Ok(StageStatus::Completed)
                }
            } else {
                Ok(StageStatus::Running)
            }
        }

        Some(StageStatus::Failed) => Ok(StageStatus::Failed),

        Some(StageStatus::Completed) => {
            if states.is_empty() {
                Ok(StageStatus::Completed)
            } else if any_running(&states) {
                // Revert while the website stage has not started; once it
                // has, its run may already have consumed the stats output
                // and the stage stays terminal.
                if db.get_website_update_for_job(&job.id).await?.is_none() {
                    db.set_stage_status(&job.id, Stage::Stats, StageStatus::Running, None)
                        .await?;
                    Ok(StageStatus::Running)
                } else {
                    Ok(StageStatus::Completed)
                }
            } else if any_failed(&states) {
                db.set_stage_status(&job.id, Stage::Stats, StageStatus::Failed, None)
                    .await?;
                Ok(StageStatus::Failed)
            } else {
                Ok(StageStatus::Completed)
            }
        }

        _ => {
            db.set_stage_status(
                &job.id,
                Stage::Stats,
                StageStatus::Failed,
                Some(MSG_STATS_UNKNOWN),
            )
            .await?;
            Ok(StageStatus::Failed)
        }
    }
}

/// Mirror the WebsiteUpdate row's status into the job, appending its
/// `last_error` on failure.
async fn update_website_stage(db: &DbPool, job: &job::Model) -> AppResult<WebsiteUpdateStatus> {
    let Some(row) = db.get_website_update_for_job(&job.id).await? else {
        // Waiting for the website worker to create its record.
        return Ok(WebsiteUpdateStatus::Pending);
    };

    let Some(status) = WebsiteUpdateStatus::parse(&row.status) else {
        db.set_website_update_status(
            &job.id,
            WebsiteUpdateStatus::Failed,
            Some(MSG_WEBSITE_ABNORMAL),
        )
        .await?;
        return Ok(WebsiteUpdateStatus::Failed);
    };

    if row.status != job.website_update_status {
        let error_append = if status == WebsiteUpdateStatus::Failed {
            row.last_error.as_deref()
        } else {
            None
        };
        let stage_status = match status {
            WebsiteUpdateStatus::Pending => StageStatus::Pending,
            WebsiteUpdateStatus::Running => StageStatus::Running,
            WebsiteUpdateStatus::Completed => StageStatus::Completed,
            WebsiteUpdateStatus::Failed => StageStatus::Failed,
        };
        db.set_stage_status(&job.id, Stage::Website, stage_status, error_append)
            .await?;
    }

    Ok(status)
}

/// Final job-status rules, reached only once image, stats and website are
/// terminal.
async fn update_job_status(
    db: &DbPool,
    job: &job::Model,
    image: StageStatus,
    stats: StageStatus,
    website: WebsiteUpdateStatus,
) -> AppResult<()> {
    match JobStatus::parse(&job.job_status) {
        Some(JobStatus::Running) => {
            let failed = image == StageStatus::Failed
                || stats == StageStatus::Failed
                || website == WebsiteUpdateStatus::Failed;
            let status = if failed {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            debug!("Job {} reconciled to {}", job.id, status);
            // Stage failures already carry their error messages.
            db.set_job_status(&job.id, status, None).await?;
            Ok(())
        }
        Some(_) => Ok(()),
        None => {
            db.set_job_status(&job.id, JobStatus::Failed, Some(MSG_JOB_UNKNOWN))
                .await?;
            Ok(())
        }
    }
}
