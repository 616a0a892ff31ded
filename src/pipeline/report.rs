//! Reporter: renders the end-of-job report and delivers it by mail.
//!
//! Guarded by a terminal job with a PENDING report. Delivery failures leave
//! the report PENDING with `last_error` set, so a later tick retries.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::Serialize;
use tera::Tera;
use tracing::{debug, error, info};

use crate::config::EmailSettings;
use crate::db::{jobs::Stage, DbPool};
use crate::entity::export;
use crate::error::{AppError, AppResult};
use crate::models::{ExportKind, JobStatus, ReportStatus, StageStatus};
use crate::services::EmailService;

const TEXT_TEMPLATE: &str = include_str!("../../templates/report.txt");
const HTML_TEMPLATE: &str = include_str!("../../templates/report.html");

fn templates() -> &'static Tera {
    static TERA: OnceLock<Tera> = OnceLock::new();
    TERA.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_template("report.txt", TEXT_TEMPLATE)
            .expect("text report template is valid");
        tera.add_raw_template("report.html", HTML_TEMPLATE)
            .expect("html report template is valid");
        tera
    })
}

#[derive(Debug, Serialize)]
struct TaskLine {
    name: String,
    state: String,
    error: Option<String>,
}

impl From<&export::Model> for TaskLine {
    fn from(row: &export::Model) -> Self {
        Self {
            name: row.name.clone(),
            state: row.state.clone(),
            error: row.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsPathGroup {
    path: String,
    completed: Vec<TaskLine>,
    failed: Vec<TaskLine>,
    other: Vec<TaskLine>,
}

#[derive(Debug, Serialize)]
struct SnapshotLine {
    name: String,
    collection: String,
    images: i32,
    last_image: String,
}

#[derive(Debug, Serialize)]
struct WebsiteLine {
    pull_request_id: Option<String>,
    pull_request_url: Option<String>,
    status: String,
}

#[derive(Debug, Serialize)]
struct ReportContext {
    job_id: String,
    short_id: String,
    job_status: String,
    image_export_status: String,
    stats_export_status: String,
    website_update_status: String,
    created_at: String,
    timezone: String,
    errors: Vec<String>,
    image_exports: Vec<TaskLine>,
    stats_groups: Vec<StatsPathGroup>,
    snapshots: Vec<SnapshotLine>,
    website: Option<WebsiteLine>,
}

/// Assemble the report context from the job, its exports (grouped by kind
/// and path), the upstream snapshots and the website update.
async fn build_context(db: &DbPool, job_id: &str) -> AppResult<ReportContext> {
    let job = db.require_job(job_id).await?;
    let exports = db.get_exports_for_job(job_id).await?;
    let snapshots = db.get_snapshots_for_job(job_id).await?;
    let website = db.get_website_update_for_job(job_id).await?;

    let image_exports: Vec<TaskLine> = exports
        .iter()
        .filter(|row| row.kind == ExportKind::Image.as_str())
        .map(TaskLine::from)
        .collect();

    let mut by_path: BTreeMap<String, StatsPathGroup> = BTreeMap::new();
    for row in exports
        .iter()
        .filter(|row| row.kind == ExportKind::Table.as_str())
    {
        let group = by_path
            .entry(row.path.clone())
            .or_insert_with(|| StatsPathGroup {
                path: row.path.clone(),
                completed: Vec::new(),
                failed: Vec::new(),
                other: Vec::new(),
            });
        match row.state.as_str() {
            "COMPLETED" => group.completed.push(TaskLine::from(row)),
            "FAILED" | "TIMED_OUT" => group.failed.push(TaskLine::from(row)),
            _ => group.other.push(TaskLine::from(row)),
        }
    }

    // Accumulated `|`-delimited errors become a list.
    let errors: Vec<String> = job
        .error
        .as_deref()
        .map(|raw| {
            raw.split(" | ")
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    // Timestamps are reported in the job's configured timezone.
    let created_at = match chrono_tz::Tz::from_str(&job.timezone) {
        Ok(tz) => job
            .created_at
            .with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Err(_) => job.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    };

    Ok(ReportContext {
        short_id: job.id.chars().take(8).collect(),
        job_id: job.id,
        job_status: job.job_status,
        image_export_status: job.image_export_status,
        stats_export_status: job.stats_export_status,
        website_update_status: job.website_update_status,
        created_at,
        timezone: job.timezone,
        errors,
        image_exports,
        stats_groups: by_path.into_values().collect(),
        snapshots: snapshots
            .into_iter()
            .map(|row| SnapshotLine {
                name: row.name,
                collection: row.collection,
                images: row.images,
                last_image: row.last_image,
            })
            .collect(),
        website: website.map(|row| WebsiteLine {
            pull_request_id: row.pull_request_id,
            pull_request_url: row.pull_request_url,
            status: row.status,
        }),
    })
}

fn render(context: &ReportContext) -> AppResult<(String, String)> {
    let tera_context = tera::Context::from_serialize(context)
        .map_err(|e| AppError::Report(format!("context error: {}", e)))?;
    let text = templates().render("report.txt", &tera_context)?;
    let html = templates().render("report.html", &tera_context)?;
    Ok((text, html))
}

/// Generate and deliver the report for a finished job.
pub async fn run_report_stage(
    db: &DbPool,
    email_settings: &EmailSettings,
    job_id: &str,
) -> AppResult<()> {
    let job = db.require_job(job_id).await?;

    // Report only once the job has finished and reporting is still pending.
    let job_done = matches!(
        JobStatus::parse(&job.job_status),
        Some(JobStatus::Completed) | Some(JobStatus::Failed)
    );
    let report_pending = StageStatus::parse(&job.report_status) == Some(StageStatus::Pending);
    if !job_done || !report_pending {
        debug!("Skipping report generation: job not finished or report not pending");
        return Ok(());
    }

    info!("Generating report for job {}", job_id);
    let record = db.create_or_bump_report(job_id).await?;

    let delivery = async {
        let context = build_context(db, job_id).await?;
        let (text, html) = render(&context)?;
        let subject = format!(
            "Snow pipeline job {} - {}",
            context.short_id, context.job_status
        );
        if email_settings.enable_email {
            let mailer = EmailService::new(email_settings)?;
            mailer.send_report(&subject, &text, &html).await?;
        } else {
            info!("Email reporting is disabled; report rendered but not sent");
        }
        Ok::<(), AppError>(())
    };

    match delivery.await {
        Ok(()) => {
            db.set_report_status(record.id, ReportStatus::Completed, None)
                .await?;
            db.set_stage_status(job_id, Stage::Report, StageStatus::Completed, None)
                .await?;
            info!("Report completed for job {}", job_id);
            Ok(())
        }
        Err(e) => {
            // Stays PENDING for an unbounded retry on a later tick.
            error!("Error generating report for job {}: {}", job_id, e);
            db.set_report_status(record.id, ReportStatus::Pending, Some(&e.to_string()))
                .await?;
            Ok(())
        }
    }
}
