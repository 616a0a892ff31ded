//! End-to-end orchestration tests against an in-memory SQLite database and
//! a scripted fake remote-task service.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use ipa_orchestrator::config::Settings;
use ipa_orchestrator::db::jobs::Stage;
use ipa_orchestrator::db::DbPool;
use ipa_orchestrator::error::{AppError, AppResult};
use ipa_orchestrator::models::{
    ExportKind, ExportTarget, ImageExportRequest, PlannedExport, RemoteTaskStatus, StageStatus,
    TableTaskDescriptor, TaskSubmission,
};
use ipa_orchestrator::pipeline::{orchestrator, poller, reconciler, PipelineContext};
use ipa_orchestrator::services::TaskService;

const MONTHLY_COLLECTION: &str = "projects/snow/assets/monthly";
const TERRA: &str = "upstream/terra";
const AQUA: &str = "upstream/aqua";

/// Scripted in-process stand-in for the geospatial compute service.
#[derive(Default)]
struct FakeTaskService {
    assets: Mutex<BTreeMap<String, Vec<String>>>,
    dates: Mutex<BTreeMap<String, Vec<NaiveDate>>>,
    /// Per-task queues of scripted status responses; `Err` simulates a
    /// transient adapter failure.
    statuses: Mutex<BTreeMap<String, VecDeque<Result<RemoteTaskStatus, String>>>>,
    submissions: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl FakeTaskService {
    fn set_assets(&self, collection: &str, names: &[&str]) {
        self.assets.lock().unwrap().insert(
            collection.to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        );
    }

    fn set_dates(&self, collection: &str, from: NaiveDate, to: NaiveDate) {
        let mut dates = Vec::new();
        let mut cursor = from;
        while cursor <= to {
            dates.push(cursor);
            cursor += chrono::Duration::days(1);
        }
        self.dates
            .lock()
            .unwrap()
            .insert(collection.to_string(), dates);
    }

    fn script_status(&self, task_id: &str, response: Result<&str, &str>) {
        let entry = match response {
            Ok(status) => Ok(RemoteTaskStatus {
                status: status.to_string(),
                error: None,
            }),
            Err(message) => Err(message.to_string()),
        };
        self.statuses
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push_back(entry);
    }

    fn script_failed_status(&self, task_id: &str, message: &str) {
        self.statuses
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push_back(Ok(RemoteTaskStatus {
                status: "FAILED".to_string(),
                error: Some(message.to_string()),
            }));
    }

    fn submitted(&self) -> Vec<String> {
        self.submissions.lock().unwrap().clone()
    }

    fn submit(&self, name: &str) -> TaskSubmission {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.submissions.lock().unwrap().push(name.to_string());
        TaskSubmission {
            task_id: Some(format!("operations/task-{}", id)),
            task_status: "PENDING".to_string(),
            error: None,
        }
    }
}

#[async_trait]
impl TaskService for FakeTaskService {
    async fn list_image_assets(&self, collection_path: &str) -> AppResult<Vec<String>> {
        Ok(self
            .assets
            .lock()
            .unwrap()
            .get(collection_path)
            .cloned()
            .unwrap_or_default())
    }

    async fn collection_dates(&self, collection_path: &str) -> AppResult<Vec<NaiveDate>> {
        Ok(self
            .dates
            .lock()
            .unwrap()
            .get(collection_path)
            .cloned()
            .unwrap_or_default())
    }

    async fn submit_image_export(&self, request: &ImageExportRequest) -> AppResult<TaskSubmission> {
        Ok(self.submit(&request.name))
    }

    async fn submit_table_export(
        &self,
        descriptor: &TableTaskDescriptor,
        _bucket: Option<&str>,
    ) -> AppResult<TaskSubmission> {
        Ok(self.submit(&descriptor.name))
    }

    async fn task_status(&self, task_id: &str) -> AppResult<RemoteTaskStatus> {
        let next = self
            .statuses
            .lock()
            .unwrap()
            .get_mut(task_id)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Ok(status)) => Ok(status),
            Some(Err(message)) => Err(AppError::RemoteTask(message)),
            None => Ok(RemoteTaskStatus {
                status: "RUNNING".to_string(),
                error: None,
            }),
        }
    }
}

fn test_settings(manifest_dir: &Path, months: &[&str]) -> Settings {
    let months_toml = months
        .iter()
        .map(|m| format!("\"{}\"", m))
        .collect::<Vec<_>>()
        .join(", ");
    let doc = format!(
        r#"
[google]
credentials_file = "/etc/ipa/service-account.json"

[image_export]
aoi_asset_path = "projects/snow/assets/aoi"
dem_asset_path = "projects/snow/assets/dem"
monthly_collection_path = "{collection}"
monthly_image_prefix = "Snow_TAC"
months_list = [{months}]

[image_export.source_collections]
terra = "{terra}"
aqua = "{aqua}"

[stats_export]
monthly_collection_path = "{collection}"
monthly_image_prefix = "Snow_TAC"
export_target = "gee"
base_export_path = "stats"
manifest_source = "file"
manifest_path = "{manifest}"
basin_codes = ["023", "038"]
elevation_stats = false
monthly_stats = false
yearly_stats = false
month_tbl_export_path = "month"
sca_m_basin_tbl_prefix = "SCA_m_BNA_"

[automation]
timezone = "UTC"

[automation.db]
type = "sqlite"
db_path = "./unused"

[automation.website]
gcs_base_assets_path = "stats"
local_repo_path = "./unused"
repo_base_assets_path = "public/assets"
work_branch = "stats-auto-update"

[automation.website.github]
repo_url = "https://github.com/example/website"
app_id = "12345"
private_key_path = "/etc/ipa/app-key.pem"
"#,
        collection = MONTHLY_COLLECTION,
        months = months_toml,
        terra = TERRA,
        aqua = AQUA,
        manifest = manifest_dir.display(),
    );
    toml::from_str(&doc).expect("test settings parse")
}

async fn test_context(
    settings: Settings,
    tasks: Arc<FakeTaskService>,
) -> (PipelineContext, DbPool) {
    let db = DbPool::connect_url("sqlite::memory:").await.unwrap();
    db.run_migrations().await.unwrap();
    let mut ctx = PipelineContext::new(db.clone(), tasks, None, Arc::new(settings));
    ctx.bootstrap_poll_delay = Duration::ZERO;
    (ctx, db)
}

fn planned_running_export(kind: ExportKind, name: &str, task_id: &str) -> PlannedExport {
    PlannedExport {
        kind,
        name: name.to_string(),
        target: ExportTarget::Gee,
        path: MONTHLY_COLLECTION.to_string(),
        submission: TaskSubmission {
            task_id: Some(task_id.to_string()),
            task_status: "PENDING".to_string(),
            error: None,
        },
    }
}

#[tokio::test]
async fn test_job_with_nothing_to_do_completes_in_one_tick() {
    let tasks = Arc::new(FakeTaskService::default());
    tasks.set_dates(
        TERRA,
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
    );
    let manifest_dir = tempfile::tempdir().unwrap();
    let (ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    let job_id = orchestrator::init_job(&ctx).await.unwrap();
    let job = db.require_job(&job_id).await.unwrap();
    assert_eq!(job.image_export_status, "COMPLETED");
    assert_eq!(job.stats_export_status, "NOT_REQUIRED");
    assert_eq!(job.job_status, "RUNNING");

    // Snapshot captured for the reachable upstream source.
    let snapshots = db.get_snapshots_for_job(&job_id).await.unwrap();
    assert_eq!(snapshots.len(), 2);

    orchestrator::run_tick(&ctx).await.unwrap();

    let job = db.require_job(&job_id).await.unwrap();
    assert_eq!(job.job_status, "COMPLETED");
    assert_eq!(job.stats_export_status, "COMPLETED");
    assert_eq!(job.website_update_status, "COMPLETED");
    assert_eq!(job.report_status, "COMPLETED");

    // Website finished without a pull request.
    let website = db.get_website_update_for_job(&job_id).await.unwrap().unwrap();
    assert_eq!(website.status, "COMPLETED");
    assert!(website.pull_request_url.is_none());

    // Report row exists and completed.
    let report = db.get_report_for_job(&job_id).await.unwrap().unwrap();
    assert_eq!(report.status, "COMPLETED");
    assert_eq!(report.attempts, 1);

    assert!(tasks.submitted().is_empty());
}

#[tokio::test]
async fn test_single_month_flows_through_stats() {
    let tasks = Arc::new(FakeTaskService::default());
    // Upstream complete for 2024-01 (leading buffer included) in both sources.
    tasks.set_dates(
        TERRA,
        NaiveDate::from_ymd_opt(2023, 12, 28).unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
    );
    tasks.set_dates(
        AQUA,
        NaiveDate::from_ymd_opt(2023, 12, 28).unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
    );
    let manifest_dir = tempfile::tempdir().unwrap();
    let (ctx, db) =
        test_context(test_settings(manifest_dir.path(), &["2024-01"]), tasks.clone()).await;

    let job_id = orchestrator::init_job(&ctx).await.unwrap();
    let job = db.require_job(&job_id).await.unwrap();
    assert_eq!(job.image_export_status, "RUNNING");
    assert_eq!(job.stats_export_status, "PENDING");
    assert_eq!(tasks.submitted(), vec!["Snow_TAC_2024_01"]);

    let exports = db.get_exports_for_job(&job_id).await.unwrap();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].name, "Snow_TAC_2024_01");
    assert_eq!(exports[0].state, "RUNNING");
    let image_task = exports[0].task_id.clone().unwrap();

    // The remote task completes and the new image appears upstream. The
    // bootstrap poll already pushed next_check_at out, so poll directly.
    tasks.script_status(&image_task, Ok("COMPLETED"));
    let row = db.get_export(&exports[0].id).await.unwrap().unwrap();
    poller::poll_export(&db, tasks.as_ref(), &row).await.unwrap();
    tasks.set_assets(MONTHLY_COLLECTION, &["Snow_TAC_2024_01"]);

    orchestrator::run_tick(&ctx).await.unwrap();

    let job = db.require_job(&job_id).await.unwrap();
    assert_eq!(job.image_export_status, "COMPLETED");
    assert_eq!(job.stats_export_status, "RUNNING");

    // One table export per configured basin.
    let tables: Vec<_> = db
        .get_exports_for_job(&job_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.kind == "table")
        .collect();
    assert_eq!(tables.len(), 2);
    assert!(tables.iter().any(|t| t.name == "SCA_m_BNA_023.csv"));
    assert!(tables.iter().any(|t| t.name == "SCA_m_BNA_038.csv"));

    // Manifest rewritten with the new image as last_image.
    let manifest_raw =
        std::fs::read_to_string(manifest_dir.path().join("monthly_manifest.json")).unwrap();
    let manifest: serde_json::Value = serde_json::from_str(&manifest_raw).unwrap();
    assert_eq!(manifest["source"]["last_image"], "Snow_TAC_2024_01");
    assert_eq!(
        manifest["metadata"]["stats_exports"]
            .as_array()
            .unwrap()
            .len(),
        2
    );

    // Table tasks complete; with no object store configured the website
    // update records a failed attempt and stays eligible for retry.
    for table in &tables {
        tasks.script_status(table.task_id.as_deref().unwrap(), Ok("COMPLETED"));
    }
    orchestrator::run_tick(&ctx).await.unwrap();

    let job = db.require_job(&job_id).await.unwrap();
    assert_eq!(job.stats_export_status, "COMPLETED");
    assert_eq!(job.job_status, "RUNNING");
    let website = db.get_website_update_for_job(&job_id).await.unwrap().unwrap();
    assert_eq!(website.status, "PENDING");
    assert_eq!(website.attempts, 1);
    assert!(website.last_error.is_some());
}

#[tokio::test]
async fn test_failed_image_task_fails_job() {
    let tasks = Arc::new(FakeTaskService::default());
    tasks.set_dates(
        TERRA,
        NaiveDate::from_ymd_opt(2023, 12, 28).unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
    );
    tasks.set_dates(
        AQUA,
        NaiveDate::from_ymd_opt(2023, 12, 28).unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
    );
    let manifest_dir = tempfile::tempdir().unwrap();
    let (ctx, db) =
        test_context(test_settings(manifest_dir.path(), &["2024-01"]), tasks.clone()).await;

    let job_id = orchestrator::init_job(&ctx).await.unwrap();
    let exports = db.get_exports_for_job(&job_id).await.unwrap();
    let image_task = exports[0].task_id.clone().unwrap();
    tasks.script_failed_status(&image_task, "Internal error computing image");
    let row = db.get_export(&exports[0].id).await.unwrap().unwrap();
    poller::poll_export(&db, tasks.as_ref(), &row).await.unwrap();

    orchestrator::run_tick(&ctx).await.unwrap();

    let job = db.require_job(&job_id).await.unwrap();
    assert_eq!(job.image_export_status, "FAILED");
    assert_eq!(job.stats_export_status, "PENDING");
    assert_eq!(job.job_status, "FAILED");
    assert!(job
        .error
        .as_deref()
        .unwrap()
        .contains("One or more image exports failed"));

    // The website stage never ran; the report went out for the failed job.
    assert!(db.get_website_update_for_job(&job_id).await.unwrap().is_none());
    assert_eq!(job.report_status, "COMPLETED");

    let export = db.get_exports_for_job(&job_id).await.unwrap().remove(0);
    assert_eq!(export.state, "FAILED");
    assert!(export.error.unwrap().contains("Internal error"));
}

#[tokio::test]
async fn test_manifest_short_circuit_skips_stats() {
    let tasks = Arc::new(FakeTaskService::default());
    tasks.set_dates(
        TERRA,
        NaiveDate::from_ymd_opt(2023, 12, 28).unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
    );
    tasks.set_dates(
        AQUA,
        NaiveDate::from_ymd_opt(2023, 12, 28).unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
    );
    let manifest_dir = tempfile::tempdir().unwrap();
    let (ctx, db) =
        test_context(test_settings(manifest_dir.path(), &["2024-01"]), tasks.clone()).await;

    // The collection already holds the new image and the manifest matches
    // it exactly.
    tasks.set_assets(MONTHLY_COLLECTION, &["Snow_TAC_2024_01"]);
    let manifest = ipa_orchestrator::pipeline::manifest::Manifest::build(
        MONTHLY_COLLECTION,
        vec!["Snow_TAC_2024_01".to_string()],
        Default::default(),
    );
    let manifest_path = manifest_dir.path().join("monthly_manifest.json");
    std::fs::write(&manifest_path, manifest.to_json().unwrap()).unwrap();
    let manifest_before = std::fs::read_to_string(&manifest_path).unwrap();

    // 2024-01 is already exported, but force the stats stage to run by
    // submitting a second month.
    let job_id = orchestrator::init_job(&ctx).await.unwrap();
    let exports = db.get_exports_for_job(&job_id).await.unwrap();
    assert_eq!(exports.len(), 0, "already exported month must not resubmit");
    let job = db.require_job(&job_id).await.unwrap();
    assert_eq!(job.stats_export_status, "NOT_REQUIRED");

    // Force the stats-pending path: pretend an image export ran and completed.
    db.set_image_and_stats_status(&job_id, StageStatus::Running, StageStatus::Pending)
        .await
        .unwrap();
    db.insert_export(
        &job_id,
        &planned_running_export(ExportKind::Image, "Snow_TAC_2023_12", "operations/img-1"),
    )
    .await
    .unwrap();
    tasks.script_status("operations/img-1", Ok("COMPLETED"));

    orchestrator::run_tick(&ctx).await.unwrap();

    let job = db.require_job(&job_id).await.unwrap();
    // The unchanged manifest short-circuited the bucket: no table exports,
    // stage completed, manifest untouched.
    assert_eq!(job.stats_export_status, "COMPLETED");
    assert_eq!(job.job_status, "COMPLETED");
    let tables: Vec<_> = db
        .get_exports_for_job(&job_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.kind == "table")
        .collect();
    assert!(tables.is_empty());
    assert_eq!(
        std::fs::read_to_string(&manifest_path).unwrap(),
        manifest_before
    );

    // Nothing to replace: website completed without a pull request.
    let website = db.get_website_update_for_job(&job_id).await.unwrap().unwrap();
    assert_eq!(website.status, "COMPLETED");
    assert!(website.pull_request_url.is_none());
}

#[tokio::test]
async fn test_reconciler_is_idempotent() {
    let tasks = Arc::new(FakeTaskService::default());
    let manifest_dir = tempfile::tempdir().unwrap();
    let (ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    let job_id = orchestrator::init_job(&ctx).await.unwrap();
    orchestrator::run_tick(&ctx).await.unwrap();

    let settled = db.require_job(&job_id).await.unwrap();
    assert_eq!(settled.job_status, "COMPLETED");

    // Steady state: further reconciliations must not write.
    reconciler::reconcile_job(&db, &job_id).await.unwrap();
    reconciler::reconcile_job(&db, &job_id).await.unwrap();
    let after = db.require_job(&job_id).await.unwrap();
    assert_eq!(after, settled);

    // A job mid-flight is just as steady while its export keeps running.
    let running = db.insert_job("UTC").await.unwrap();
    db.set_stage_status(&running.id, Stage::Image, StageStatus::Running, None)
        .await
        .unwrap();
    db.insert_export(
        &running.id,
        &planned_running_export(ExportKind::Image, "Snow_TAC_2024_03", "operations/slow"),
    )
    .await
    .unwrap();
    let first = reconciler::reconcile_job(&db, &running.id).await.unwrap();
    let second = reconciler::reconcile_job(&db, &running.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(second.image_export_status, "RUNNING");
}

#[tokio::test]
async fn test_polling_backoff_then_completion() {
    let tasks = Arc::new(FakeTaskService::default());
    let manifest_dir = tempfile::tempdir().unwrap();
    let (_ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    let job = db.insert_job("UTC").await.unwrap();
    let export = db
        .insert_export(
            &job.id,
            &planned_running_export(ExportKind::Image, "Snow_TAC_2024_01", "operations/flaky"),
        )
        .await
        .unwrap();

    // Three transient failures, then success.
    tasks.script_status("operations/flaky", Err("connect timeout"));
    tasks.script_status("operations/flaky", Err("connect timeout"));
    tasks.script_status("operations/flaky", Err("connect timeout"));
    tasks.script_status("operations/flaky", Ok("COMPLETED"));

    let mut expected_interval = 15;
    for attempt in 1..=3 {
        let row = db.get_export(&export.id).await.unwrap().unwrap();
        poller::poll_export(&db, tasks.as_ref(), &row).await.unwrap();
        let row = db.get_export(&export.id).await.unwrap().unwrap();
        expected_interval *= 2;
        assert_eq!(row.attempts, attempt);
        assert_eq!(row.poll_interval_sec, expected_interval);
        assert_eq!(row.state, "RUNNING");
        assert!(row.error.as_deref().unwrap().contains("connect timeout"));
        assert!(row.next_check_at > chrono::Utc::now());
    }

    let row = db.get_export(&export.id).await.unwrap().unwrap();
    poller::poll_export(&db, tasks.as_ref(), &row).await.unwrap();
    let row = db.get_export(&export.id).await.unwrap().unwrap();
    assert_eq!(row.state, "COMPLETED");
    assert_eq!(row.task_status, "COMPLETED");
    assert!(row.error.is_none());
}

#[tokio::test]
async fn test_terminal_export_is_never_polled_again() {
    let tasks = Arc::new(FakeTaskService::default());
    let manifest_dir = tempfile::tempdir().unwrap();
    let (_ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    let job = db.insert_job("UTC").await.unwrap();
    let export = db
        .insert_export(
            &job.id,
            &planned_running_export(ExportKind::Table, "SCA_m_BNA_023.csv", "operations/done"),
        )
        .await
        .unwrap();
    tasks.script_status("operations/done", Ok("COMPLETED"));

    let row = db.get_export(&export.id).await.unwrap().unwrap();
    poller::poll_export(&db, tasks.as_ref(), &row).await.unwrap();
    let terminal = db.get_export(&export.id).await.unwrap().unwrap();
    assert_eq!(terminal.state, "COMPLETED");

    // Terminal rows never appear in the lease scan.
    let leased = db.lease_due_exports(None).await.unwrap();
    assert!(leased.is_empty());

    // Even handed in directly, a terminal row is untouched.
    poller::poll_export(&db, tasks.as_ref(), &terminal)
        .await
        .unwrap();
    let after = db.get_export(&export.id).await.unwrap().unwrap();
    assert_eq!(after, terminal);
}

#[tokio::test]
async fn test_lease_claims_due_running_exports() {
    let tasks = Arc::new(FakeTaskService::default());
    let manifest_dir = tempfile::tempdir().unwrap();
    let (_ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    let job = db.insert_job("UTC").await.unwrap();
    db.insert_export(
        &job.id,
        &planned_running_export(ExportKind::Image, "Snow_TAC_2024_01", "operations/a"),
    )
    .await
    .unwrap();
    db.insert_export(
        &job.id,
        &planned_running_export(ExportKind::Image, "Snow_TAC_2024_02", "operations/b"),
    )
    .await
    .unwrap();

    let leased = db.lease_due_exports(None).await.unwrap();
    assert_eq!(leased.len(), 2);
    assert!(leased.iter().all(|row| row.lease_until.is_some()));

    // A second scan within the lease window claims nothing new.
    let again = db.lease_due_exports(None).await.unwrap();
    assert_eq!(again.len(), 2, "leased rows are still due for this process");
}

#[tokio::test]
async fn test_late_running_image_task_reverts_completed_stage() {
    let tasks = Arc::new(FakeTaskService::default());
    let manifest_dir = tempfile::tempdir().unwrap();
    let (_ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    let job = db.insert_job("UTC").await.unwrap();
    db.set_stage_status(&job.id, Stage::Image, StageStatus::Completed, None)
        .await
        .unwrap();
    db.insert_export(
        &job.id,
        &planned_running_export(ExportKind::Image, "Snow_TAC_2024_01", "operations/late"),
    )
    .await
    .unwrap();

    let job = reconciler::reconcile_job(&db, &job.id).await.unwrap();
    assert_eq!(job.image_export_status, "RUNNING");
    assert_eq!(job.job_status, "RUNNING");
}

#[tokio::test]
async fn test_late_running_image_task_kept_terminal_once_stats_started() {
    let tasks = Arc::new(FakeTaskService::default());
    let manifest_dir = tempfile::tempdir().unwrap();
    let (_ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    // Stats is already underway: the completed image stage must stay
    // terminal even though a late image task shows up running.
    let job = db.insert_job("UTC").await.unwrap();
    db.set_image_and_stats_status(&job.id, StageStatus::Completed, StageStatus::Running)
        .await
        .unwrap();
    db.insert_export(
        &job.id,
        &planned_running_export(ExportKind::Image, "Snow_TAC_2024_01", "operations/late"),
    )
    .await
    .unwrap();
    db.insert_export(
        &job.id,
        &planned_running_export(ExportKind::Table, "SCA_m_BNA_023.csv", "operations/tbl"),
    )
    .await
    .unwrap();

    let job = reconciler::reconcile_job(&db, &job.id).await.unwrap();
    assert_eq!(job.image_export_status, "COMPLETED");
    assert_eq!(job.stats_export_status, "RUNNING");
    assert_eq!(job.job_status, "RUNNING");
}

#[tokio::test]
async fn test_late_running_table_kept_terminal_once_website_started() {
    let tasks = Arc::new(FakeTaskService::default());
    let manifest_dir = tempfile::tempdir().unwrap();
    let (_ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    // The website stage already ran against the stats output; a late
    // running table task must not reopen the completed stats stage, and
    // the job still reaches its terminal state.
    let job = db.insert_job("UTC").await.unwrap();
    db.set_image_and_stats_status(&job.id, StageStatus::Completed, StageStatus::Completed)
        .await
        .unwrap();
    db.insert_export(
        &job.id,
        &planned_running_export(ExportKind::Table, "SCA_m_BNA_023.csv", "operations/late-tbl"),
    )
    .await
    .unwrap();
    db.get_or_create_website_update(&job.id).await.unwrap();
    db.complete_website_update(&job.id, None, None).await.unwrap();

    let job = reconciler::reconcile_job(&db, &job.id).await.unwrap();
    assert_eq!(job.stats_export_status, "COMPLETED");
    assert_eq!(job.website_update_status, "COMPLETED");
    assert_eq!(job.job_status, "COMPLETED");
}

#[tokio::test]
async fn test_pending_stage_with_records_is_anomalous() {
    let tasks = Arc::new(FakeTaskService::default());
    let manifest_dir = tempfile::tempdir().unwrap();
    let (_ctx, db) = test_context(test_settings(manifest_dir.path(), &[]), tasks.clone()).await;

    let job = db.insert_job("UTC").await.unwrap();
    // Export rows exist while the stage was never advanced out of PENDING.
    db.insert_export(
        &job.id,
        &planned_running_export(ExportKind::Image, "Snow_TAC_2024_01", "operations/x"),
    )
    .await
    .unwrap();

    let job = reconciler::reconcile_job(&db, &job.id).await.unwrap();
    assert_eq!(job.image_export_status, "FAILED");
    assert!(job.error.as_deref().unwrap().contains("Image tasks"));
}
