//! Stats stage worker: per frequency bucket, short-circuits on an unchanged
//! manifest, archives the published outputs, submits the remote table tasks
//! and rewrites the manifest.
//!
//! Guarded by `stats_export_status = PENDING` with no image export still
//! running.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::StatsExportSettings;
use crate::db::{jobs::Stage, DbPool};
use crate::error::AppResult;
use crate::models::{
    ExportKind, ExportState, ExportTarget, JobStatus, PlannedExport, StageStatus, TaskSubmission,
};
use crate::pipeline::archive;
use crate::pipeline::builders::{builders_for_bucket, Frequency};
use crate::pipeline::manifest::{Manifest, ManifestExportEntry, ManifestMetadata, ManifestStore};
use crate::pipeline::months::fix_name_prefix;
use crate::services::{ObjectStore, TaskService};

const MSG_INSERTS_LOST: &str = "One or more Stats tasks could not be saved to DB.";
const MSG_ARCHIVE_MOVE_FAILED: &str = "Failed to move file to archive.";

struct BucketOutcome {
    planned: usize,
    inserted: usize,
}

/// Run the stats stage for one job.
pub async fn run_stats_stage(
    db: &DbPool,
    tasks: &dyn TaskService,
    storage: Option<&ObjectStore>,
    job_id: &str,
    settings: &StatsExportSettings,
) -> AppResult<()> {
    let job = db.require_job(job_id).await?;

    if JobStatus::parse(&job.job_status) != Some(JobStatus::Running) {
        debug!("Skipping stats export: job is not RUNNING");
        return Ok(());
    }
    if StageStatus::parse(&job.stats_export_status) != Some(StageStatus::Pending) {
        debug!("Skipping stats export: status is not PENDING");
        return Ok(());
    }
    let running_images = db
        .count_exports_in_state(job_id, ExportKind::Image, ExportState::Running)
        .await?;
    if running_images > 0 {
        debug!("Skipping stats export: image exports still running");
        return Ok(());
    }

    if settings.export_target == ExportTarget::Storage && storage.is_none() {
        // Stays PENDING; a later tick retries once storage is reachable.
        warn!("No object store available for stats export");
        return Ok(());
    }

    debug!("Starting stats export procedure for job {}", job_id);
    db.set_stage_status(job_id, Stage::Stats, StageStatus::Running, None)
        .await?;

    let mut planned_total = 0usize;
    let mut inserted_total = 0usize;
    for frequency in [Frequency::Monthly, Frequency::Yearly] {
        match run_bucket(db, tasks, storage, job_id, settings, frequency).await {
            Ok(outcome) => {
                planned_total += outcome.planned;
                inserted_total += outcome.inserted;
            }
            Err(e) => {
                error!("Error executing {} stats export: {}", frequency.as_str(), e);
                db.set_stage_status(job_id, Stage::Stats, StageStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Ok(());
            }
        }
    }

    if planned_total == 0 {
        info!("No stats exports generated for this job");
        db.set_stage_status(job_id, Stage::Stats, StageStatus::Completed, None)
            .await?;
    } else {
        info!("Generated {} stats export task(s)", planned_total);
        if inserted_total < planned_total {
            db.set_stage_status(job_id, Stage::Stats, StageStatus::Failed, Some(MSG_INSERTS_LOST))
                .await?;
        }
    }

    crate::pipeline::reconciler::reconcile_job(db, job_id).await?;
    Ok(())
}

/// Process one frequency bucket end to end.
async fn run_bucket(
    db: &DbPool,
    tasks: &dyn TaskService,
    storage: Option<&ObjectStore>,
    job_id: &str,
    settings: &StatsExportSettings,
    frequency: Frequency,
) -> AppResult<BucketOutcome> {
    let none = BucketOutcome {
        planned: 0,
        inserted: 0,
    };

    let (collection, prefix) = match frequency {
        Frequency::Monthly => (
            settings.monthly_collection_path.as_deref(),
            settings.monthly_image_prefix.as_deref(),
        ),
        Frequency::Yearly => (
            settings.yearly_collection_path.as_deref(),
            settings.yearly_image_prefix.as_deref(),
        ),
    };
    let Some(collection) = collection else {
        return Ok(none);
    };
    let builders = builders_for_bucket(settings, frequency);
    if builders.is_empty() {
        return Ok(none);
    }

    let prefix = fix_name_prefix(prefix.unwrap_or_default());
    let current_images: Vec<String> = tasks
        .list_image_assets(collection)
        .await?
        .into_iter()
        .filter(|name| prefix.is_empty() || name.starts_with(&prefix))
        .collect();

    let manifest_store =
        ManifestStore::new(settings.manifest_source, &settings.manifest_path, storage);
    let manifest_name = frequency.manifest_name();

    let mut previous_entries: Vec<ManifestExportEntry> = Vec::new();
    if !settings.skip_manifest {
        if let Some(existing) = manifest_store.read(&manifest_name).await {
            if existing.matches_collection(collection, &current_images) {
                info!(
                    "No changes in source collection for the {} bucket; skipping stats export",
                    frequency.as_str()
                );
                return Ok(none);
            }
            previous_entries = existing.metadata.stats_exports;
        }
    }

    let mut descriptors = Vec::new();
    for builder in &builders {
        descriptors.extend(builder.produce(settings, collection));
    }
    if let Some(max) = settings.max_exports {
        descriptors.truncate(max);
    }
    if descriptors.is_empty() {
        return Ok(none);
    }
    debug!(
        "Planned {} {} table export task(s)",
        descriptors.len(),
        frequency.as_str()
    );

    // Move the currently published outputs aside before their replacements
    // are generated. A file that cannot be archived must not be replaced.
    let today = Utc::now().date_naive();
    let base_export_path = settings.base_export_path.to_string_lossy().to_string();
    let mut move_failures: BTreeSet<(String, String)> = BTreeSet::new();
    if let Some(storage) = storage {
        let mut by_dir: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for descriptor in &descriptors {
            by_dir
                .entry(descriptor.path.clone())
                .or_default()
                .push(descriptor.name.clone());
        }
        for (dir, names) in by_dir {
            let moved =
                archive::move_published_to_archive(storage, &names, &dir, &base_export_path, today)
                    .await;
            for (name, succeeded) in moved {
                if !succeeded {
                    move_failures.insert((dir.clone(), name));
                }
            }
        }
    }

    let bucket_for_storage = match settings.export_target {
        ExportTarget::Storage => settings.storage_bucket.as_deref(),
        _ => None,
    };

    let mut inserted = 0usize;
    let mut started_entries: Vec<ManifestExportEntry> = Vec::new();
    for descriptor in &descriptors {
        let submission = if move_failures.contains(&(descriptor.path.clone(), descriptor.name.clone()))
        {
            TaskSubmission::failed("FAILED_TO_CREATE", MSG_ARCHIVE_MOVE_FAILED)
        } else {
            match tasks.submit_table_export(descriptor, bucket_for_storage).await {
                Ok(submission) => submission,
                Err(e) => {
                    error!("Table export submission failed for {}: {}", descriptor.name, e);
                    TaskSubmission::failed("FAILED_TO_CREATE", e.to_string())
                }
            }
        };

        let planned = PlannedExport {
            kind: ExportKind::Table,
            name: descriptor.name.clone(),
            target: descriptor.target,
            path: descriptor.path.clone(),
            submission,
        };
        let export = match db.insert_export(job_id, &planned).await {
            Ok(export) => export,
            Err(e) => {
                error!("Error saving export task {} to database: {}", planned.name, e);
                continue;
            }
        };
        inserted += 1;

        if let Some(storage) = storage {
            if let Err(e) = archive::record_file_transfer(
                db,
                storage,
                job_id,
                &export.id,
                &descriptor.path,
                &descriptor.name,
                &base_export_path,
                today,
            )
            .await
            {
                error!("Error recording file transfer for {}: {}", descriptor.name, e);
            }
        }

        if matches!(
            planned.submission.state(),
            ExportState::Running | ExportState::Completed
        ) {
            started_entries.push(ManifestExportEntry {
                id: export.id,
                name: descriptor.name.clone(),
                date_updated: today.format("%Y-%m-%d").to_string(),
            });
        }
    }

    if !settings.skip_manifest {
        let merged = Manifest::merge_stats_exports(&previous_entries, started_entries);
        let manifest = Manifest::build(
            collection,
            current_images,
            ManifestMetadata {
                target_system: settings.export_target.to_string(),
                stats_exports: merged,
            },
        );
        if let Err(e) = manifest_store.write(&manifest_name, &manifest).await {
            warn!("Failed to write {} manifest: {}", frequency.as_str(), e);
        }
    }

    Ok(BucketOutcome {
        planned: descriptors.len(),
        inserted,
    })
}
