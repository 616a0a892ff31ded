//! Status lattices shared across the orchestrator.
//!
//! All statuses are persisted as upper-case strings. The remote compute
//! service reports task states from an open set; `ExportState::project`
//! collapses them into the five-value lattice the poller and reconciler
//! operate on.

use serde::{Deserialize, Serialize};

/// Overall job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// A job no longer advances once it has completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-stage status on a job (image, stats, website and report columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NotRequired,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::NotRequired => "NOT_REQUIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "NOT_REQUIRED" => Some(Self::NotRequired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Orchestrator-level projection of a remote task's state.
///
/// `Completed`, `Failed` and `TimedOut` are terminal; a terminal export is
/// never touched by the poller again. `Unknown` is a non-terminal probe state
/// that keeps being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportState {
    Running,
    Completed,
    Failed,
    TimedOut,
    Unknown,
}

impl ExportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "TIMED_OUT" => Some(Self::TimedOut),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Map a raw remote task status onto the internal lattice.
    ///
    /// Remote "NOT_STARTED" and the cancellation states count as completed:
    /// the task will never produce output but nothing went wrong on our side.
    pub fn project(raw_status: &str) -> Self {
        match raw_status.to_ascii_uppercase().as_str() {
            "PENDING" | "UNKNOWN" | "SUBMITTED" | "READY" | "RUNNING" | "STARTED" => Self::Running,
            "NOT_STARTED" | "EXCLUDED" | "COMPLETED" | "CANCELED" | "CANCEL_REQUESTED" => {
                Self::Completed
            }
            "FAILED" | "FAILED_TO_CREATE" | "FAILED_TO_START" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ExportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Export row kind: one remote image-generation task or one table-statistics task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Image,
    Table,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Table => "table",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "table" => Some(Self::Table),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a remote task delivers its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportTarget {
    /// An asset inside the remote compute service itself.
    Gee,
    /// A blob in the object store.
    Storage,
    /// A shared drive folder.
    Drive,
}

impl ExportTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gee => "gee",
            Self::Storage => "storage",
            Self::Drive => "drive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gee" => Some(Self::Gee),
            "storage" => Some(Self::Storage),
            "drive" => Some(Self::Drive),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExportTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Archive bookkeeping status of a single published table output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    HasArchive,
    NoArchive,
    RolledBack,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasArchive => "HAS_ARCHIVE",
            Self::NoArchive => "NO_ARCHIVE",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HAS_ARCHIVE" => Some(Self::HasArchive),
            "NO_ARCHIVE" => Some(Self::NoArchive),
            "ROLLED_BACK" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Website publication record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebsiteUpdateStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WebsiteUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WebsiteUpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Report row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Join two accumulated error messages into one, separated by `' | '`.
///
/// Empty segments are dropped; both inputs may already be `|`-delimited lists.
pub fn join_error_msgs(msg1: Option<&str>, msg2: Option<&str>) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for msg in [msg1, msg2].into_iter().flatten() {
        parts.extend(msg.split(" | ").map(str::trim).filter(|p| !p.is_empty()));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_lattice() {
        for raw in ["PENDING", "UNKNOWN", "SUBMITTED", "READY", "RUNNING", "STARTED"] {
            assert_eq!(ExportState::project(raw), ExportState::Running, "{raw}");
        }
        for raw in [
            "NOT_STARTED",
            "EXCLUDED",
            "COMPLETED",
            "CANCELED",
            "CANCEL_REQUESTED",
        ] {
            assert_eq!(ExportState::project(raw), ExportState::Completed, "{raw}");
        }
        for raw in ["FAILED", "FAILED_TO_CREATE", "FAILED_TO_START"] {
            assert_eq!(ExportState::project(raw), ExportState::Failed, "{raw}");
        }
        assert_eq!(ExportState::project("SOMETHING_NEW"), ExportState::Unknown);
    }

    #[test]
    fn test_projection_is_case_insensitive() {
        assert_eq!(ExportState::project("completed"), ExportState::Completed);
        assert_eq!(ExportState::project("Failed"), ExportState::Failed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExportState::Completed.is_terminal());
        assert!(ExportState::Failed.is_terminal());
        assert!(ExportState::TimedOut.is_terminal());
        assert!(!ExportState::Running.is_terminal());
        assert!(!ExportState::Unknown.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [StageStatus::Pending, StageStatus::NotRequired, StageStatus::Failed] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("bogus"), None);
    }

    #[test]
    fn test_join_error_msgs() {
        assert_eq!(join_error_msgs(None, None), None);
        assert_eq!(join_error_msgs(Some("a"), None), Some("a".to_string()));
        assert_eq!(
            join_error_msgs(Some("a | b"), Some("c")),
            Some("a | b | c".to_string())
        );
        // duplicates are preserved
        assert_eq!(
            join_error_msgs(Some("a"), Some("a")),
            Some("a | a".to_string())
        );
        assert_eq!(join_error_msgs(Some("  "), Some("")), None);
    }
}
