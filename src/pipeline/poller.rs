//! Task poller: leases due exports in batches and refreshes their remote
//! state with exponential backoff.
//!
//! Errors from the remote adapter never propagate; they are written onto the
//! affected export and retried on a later tick. Only `deadline_at` can turn
//! a stuck task into TIMED_OUT.

use chrono::Utc;
use tracing::{debug, warn};

use crate::db::DbPool;
use crate::entity::export;
use crate::error::AppResult;
use crate::models::ExportState;
use crate::services::TaskService;

/// One poll pass: lease due exports (optionally scoped to a job) and query
/// each. Returns how many exports were examined.
pub async fn run_poll_pass(
    db: &DbPool,
    tasks: &dyn TaskService,
    job_id: Option<&str>,
) -> AppResult<usize> {
    let due = db.lease_due_exports(job_id).await?;
    debug!("Updating status for {} due export(s)", due.len());
    for row in &due {
        poll_export(db, tasks, row).await?;
    }
    Ok(due.len())
}

/// Query the remote state of one leased export and write the outcome back.
pub async fn poll_export(
    db: &DbPool,
    tasks: &dyn TaskService,
    row: &export::Model,
) -> AppResult<()> {
    // Double check in case a terminal row was handed in.
    match ExportState::parse(&row.state) {
        Some(state) if state.is_terminal() => return Ok(()),
        _ => {}
    }

    if let Some(deadline) = row.deadline_at {
        if deadline < Utc::now() {
            warn!("Export {} is past its deadline, marking TIMED_OUT", row.id);
            return db.mark_export_timed_out(&row.id).await;
        }
    }

    let Some(task_id) = row.task_id.as_deref() else {
        // Submission never yielded a handle; nothing to query.
        return db
            .record_poll_error(&row.id, "Export has no remote task handle")
            .await;
    };

    let status = match tasks.task_status(task_id).await {
        Ok(status) => status,
        Err(e) => {
            // Transient: back off and try again later.
            return db.record_poll_error(&row.id, &e.to_string()).await;
        }
    };

    match ExportState::project(&status.status) {
        ExportState::Running => db.record_poll_running(&row.id, &status.status).await,
        ExportState::Completed => {
            db.record_poll_terminal(&row.id, ExportState::Completed, &status.status, None)
                .await
        }
        ExportState::Failed => {
            db.record_poll_terminal(
                &row.id,
                ExportState::Failed,
                &status.status,
                status.error.as_deref(),
            )
            .await
        }
        ExportState::Unknown => {
            db.record_poll_unknown(
                &row.id,
                &status.status,
                &format!("Unknown state {}", status.status),
            )
            .await
        }
        // project() never yields TIMED_OUT.
        ExportState::TimedOut => Ok(()),
    }
}
