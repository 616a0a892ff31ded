//! Descriptors exchanged with the remote compute service.

use crate::models::status::{ExportKind, ExportState, ExportTarget};

/// Result of submitting one remote task.
///
/// `task_id` is absent when the remote side rejected the submission; the
/// export row is still written so the failure is visible in the job report.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub task_id: Option<String>,
    pub task_status: String,
    pub error: Option<String>,
}

impl TaskSubmission {
    pub fn failed(status: &str, error: impl Into<String>) -> Self {
        Self {
            task_id: None,
            task_status: status.to_string(),
            error: Some(error.into()),
        }
    }

    pub fn state(&self) -> ExportState {
        ExportState::project(&self.task_status)
    }
}

/// Current remote-side view of a task, as reported by the status endpoint.
#[derive(Debug, Clone)]
pub struct RemoteTaskStatus {
    pub status: String,
    pub error: Option<String>,
}

/// Request to generate one monthly snow-cover image as a remote asset.
#[derive(Debug, Clone)]
pub struct ImageExportRequest {
    /// Asset name, `<prefix>YYYY_MM`.
    pub name: String,
    /// Target image collection the asset is written into.
    pub collection_path: String,
    /// Month being collapsed, `YYYY-MM`.
    pub month: String,
    pub aoi_asset_path: String,
    pub dem_asset_path: String,
}

/// One planned remote table-statistics task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTaskDescriptor {
    /// Output file name, `<common_prefix><family_prefix><basin>.csv`.
    pub name: String,
    /// Output directory inside the export target.
    pub path: String,
    pub target: ExportTarget,
    /// Basin the statistics are computed over.
    pub basin_code: String,
    /// Source image collection the statistics are derived from.
    pub source_collection: String,
}

/// A task planned by a stage worker, paired with its submission outcome.
///
/// This is what gets persisted as an `exports` row.
#[derive(Debug, Clone)]
pub struct PlannedExport {
    pub kind: ExportKind,
    pub name: String,
    pub target: ExportTarget,
    pub path: String,
    pub submission: TaskSubmission,
}
