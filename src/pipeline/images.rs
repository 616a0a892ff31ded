//! Image stage worker: plans which months need a snow-cover image and
//! submits one remote image-generation task per retained month.
//!
//! Runs exactly once per job, guarded by `image_export_status = PENDING`.

use chrono::Utc;
use tracing::{debug, error, info};

use crate::config::ImageExportSettings;
use crate::db::{jobs::Stage, DbPool};
use crate::error::AppResult;
use crate::models::{
    ExportKind, ExportTarget, ImageExportRequest, PlannedExport, StageStatus, TaskSubmission,
};
use crate::pipeline::months;
use crate::services::TaskService;

const MSG_INSERTS_LOST: &str =
    "One or more Image tasks could not be saved to DB. Check logs and remote tasks for details.";

/// Plan the months to export: candidates minus already-exported minus
/// months the upstream sources have not completed yet.
async fn plan_export_months(
    tasks: &dyn TaskService,
    settings: &ImageExportSettings,
    collection_path: &str,
    prefix: &str,
) -> AppResult<Vec<String>> {
    let today = Utc::now().date_naive();

    let candidates = match &settings.months_list {
        Some(list) => list.clone(),
        None => months::month_sequence(&settings.min_month, today),
    };

    let existing = tasks.list_image_assets(collection_path).await?;
    let exported = months::exported_months(&existing, prefix);
    let pending = months::pending_months(&candidates, &exported);
    debug!("Images pending export: {:?}", pending);
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let mut per_source = Vec::with_capacity(settings.source_collections.len());
    for (name, path) in &settings.source_collections {
        let dates = tasks.collection_dates(path).await?;
        debug!("Source '{}' provides {} daily image(s)", name, dates.len());
        per_source.push(months::check_months_complete(&pending, &dates, today));
    }

    let mut selected = months::select_months_to_export(&per_source);
    if let Some(max) = settings.max_exports {
        selected.truncate(max);
    }
    Ok(selected)
}

/// Run the image stage for one job.
pub async fn run_image_stage(
    db: &DbPool,
    tasks: &dyn TaskService,
    job_id: &str,
    settings: &ImageExportSettings,
) -> AppResult<()> {
    let job = db.require_job(job_id).await?;

    // Anything other than PENDING means this already ran.
    if StageStatus::parse(&job.image_export_status) != Some(StageStatus::Pending) {
        return Ok(());
    }

    debug!("Starting image export procedure for job {}", job_id);

    let (collection_path, prefix) = match (
        &settings.monthly_collection_path,
        &settings.monthly_image_prefix,
    ) {
        (Some(collection), Some(prefix)) => (collection.clone(), months::fix_name_prefix(prefix)),
        _ => {
            // No monthly collection configured: nothing to generate.
            info!("No monthly collection configured; skipping image exports");
            db.set_image_and_stats_status(
                job_id,
                StageStatus::Completed,
                StageStatus::NotRequired,
            )
            .await?;
            return Ok(());
        }
    };

    let plan = match plan_export_months(tasks, settings, &collection_path, &prefix).await {
        Ok(plan) => plan,
        Err(e) => {
            error!("Error planning monthly image exports: {}", e);
            db.set_stage_status(job_id, Stage::Image, StageStatus::Failed, Some(&e.to_string()))
                .await?;
            return Ok(());
        }
    };

    if plan.is_empty() {
        info!("No image exports generated for this job");
        db.set_image_and_stats_status(job_id, StageStatus::Completed, StageStatus::NotRequired)
            .await?;
        return Ok(());
    }

    info!("Planned {} image export task(s)", plan.len());
    db.set_stage_status(job_id, Stage::Image, StageStatus::Running, None)
        .await?;

    let mut inserted = 0usize;
    for month in &plan {
        let name = format!("{}{}", prefix, month.replace('-', "_"));
        let request = ImageExportRequest {
            name: name.clone(),
            collection_path: collection_path.clone(),
            month: month.clone(),
            aoi_asset_path: settings.aoi_asset_path.clone(),
            dem_asset_path: settings.dem_asset_path.clone(),
        };

        // A rejected submission still gets an export row so the failure is
        // visible to the reconciler and the report.
        let submission = match tasks.submit_image_export(&request).await {
            Ok(submission) => submission,
            Err(e) => {
                error!("Image export submission failed for {}: {}", name, e);
                TaskSubmission::failed("FAILED_TO_CREATE", e.to_string())
            }
        };

        let planned = PlannedExport {
            kind: ExportKind::Image,
            name,
            target: ExportTarget::Gee,
            path: collection_path.clone(),
            submission,
        };
        match db.insert_export(job_id, &planned).await {
            Ok(_) => inserted += 1,
            Err(e) => error!("Error saving export task {} to database: {}", planned.name, e),
        }
    }
    debug!("Inserted {} of {} image export task(s)", inserted, plan.len());

    if inserted < plan.len() {
        db.set_stage_status(job_id, Stage::Image, StageStatus::Failed, Some(MSG_INSERTS_LOST))
            .await?;
    }

    crate::pipeline::reconciler::reconcile_job(db, job_id).await?;
    Ok(())
}
