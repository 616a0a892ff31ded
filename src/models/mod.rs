//! Domain models: status lattices and remote-task descriptors.

pub mod status;
pub mod task;

pub use status::{
    join_error_msgs, ExportKind, ExportState, ExportTarget, JobStatus, ReportStatus, StageStatus,
    TransferStatus, WebsiteUpdateStatus,
};
pub use task::{
    ImageExportRequest, PlannedExport, RemoteTaskStatus, TableTaskDescriptor, TaskSubmission,
};
