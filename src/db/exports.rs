//! Database queries for exports: insertion, the poller's lease scan, and
//! poll-result writes.

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, QueryFilter, QuerySelect, Set,
};
use uuid::Uuid;

use crate::entity::export::{self, ActiveModel, Entity as Export};
use crate::error::{AppError, AppResult};
use crate::models::{ExportKind, ExportState, PlannedExport};

use super::DbPool;

/// Default seconds between status polls for a fresh export.
pub const DEFAULT_POLL_INTERVAL_SEC: i32 = 15;
/// Upper bound on the poll interval after backoff.
pub const MAX_POLL_INTERVAL_SEC: i32 = 1800;
/// Seconds a leased export is claimed for.
pub const LEASE_SECONDS: i64 = 60;
/// Maximum exports leased per poll pass.
pub const MAX_BATCH_SIZE: u64 = 20;

/// Geometric backoff on the poll interval, capped.
pub fn next_backoff(poll_interval_sec: i32) -> i32 {
    (poll_interval_sec.max(1) * 2).min(MAX_POLL_INTERVAL_SEC)
}

impl DbPool {
    /// Persist one planned export and its submission outcome.
    pub async fn insert_export(
        &self,
        job_id: &str,
        planned: &PlannedExport,
    ) -> AppResult<export::Model> {
        let now = Utc::now();
        let model = ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            job_id: Set(job_id.to_string()),
            state: Set(planned.submission.state().as_str().to_string()),
            kind: Set(planned.kind.as_str().to_string()),
            name: Set(planned.name.clone()),
            target: Set(planned.target.as_str().to_string()),
            path: Set(planned.path.clone()),
            task_id: Set(planned.submission.task_id.clone()),
            task_status: Set(planned.submission.task_status.clone()),
            error: Set(planned.submission.error.clone()),
            next_check_at: Set(now),
            lease_until: Set(None),
            poll_interval_sec: Set(DEFAULT_POLL_INTERVAL_SEC),
            attempts: Set(0),
            deadline_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let result = model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert export: {}", e)))?;

        Ok(result)
    }

    /// Get an export by ID.
    pub async fn get_export(&self, id: &str) -> AppResult<Option<export::Model>> {
        let result = Export::find_by_id(id)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get export: {}", e)))?;

        Ok(result)
    }

    /// All exports of a job, oldest first.
    pub async fn get_exports_for_job(&self, job_id: &str) -> AppResult<Vec<export::Model>> {
        use sea_orm::QueryOrder;
        let result = Export::find()
            .filter(export::Column::JobId.eq(job_id))
            .order_by_asc(export::Column::CreatedAt)
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get exports for job: {}", e)))?;

        Ok(result)
    }

    /// Projection states of a job's exports of one kind.
    pub async fn export_states(
        &self,
        job_id: &str,
        kind: ExportKind,
    ) -> AppResult<Vec<ExportState>> {
        let rows = Export::find()
            .filter(export::Column::JobId.eq(job_id))
            .filter(export::Column::Kind.eq(kind.as_str()))
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get export states: {}", e)))?;

        Ok(rows
            .iter()
            .filter_map(|row| ExportState::parse(&row.state))
            .collect())
    }

    /// Count a job's exports of one kind still in a given state.
    pub async fn count_exports_in_state(
        &self,
        job_id: &str,
        kind: ExportKind,
        state: ExportState,
    ) -> AppResult<u64> {
        use sea_orm::PaginatorTrait;
        let count = Export::find()
            .filter(export::Column::JobId.eq(job_id))
            .filter(export::Column::Kind.eq(kind.as_str()))
            .filter(export::Column::State.eq(state.as_str()))
            .count(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to count exports: {}", e)))?;

        Ok(count)
    }

    /// A job's exports of one kind that reached a given state.
    pub async fn exports_in_state(
        &self,
        job_id: &str,
        kind: ExportKind,
        state: ExportState,
    ) -> AppResult<Vec<export::Model>> {
        let rows = Export::find()
            .filter(export::Column::JobId.eq(job_id))
            .filter(export::Column::Kind.eq(kind.as_str()))
            .filter(export::Column::State.eq(state.as_str()))
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get exports: {}", e)))?;

        Ok(rows)
    }

    /// Lease due exports and return the claimed rows.
    ///
    /// Two steps: claim up to `MAX_BATCH_SIZE` unleased due rows by setting
    /// `lease_until`, then read back every currently-leased due row. The
    /// lease guards against double-polling under an accidental second
    /// process; it is defensive, not a distributed lock.
    ///
    /// TIMED_OUT sits in the scan set but is filtered out again by the
    /// poller's terminal check before any remote call.
    pub async fn lease_due_exports(&self, job_id: Option<&str>) -> AppResult<Vec<export::Model>> {
        let now = Utc::now();
        let lease_until = now + Duration::seconds(LEASE_SECONDS);

        let mut due = Export::find()
            .filter(
                export::Column::State.is_in([
                    ExportState::Running.as_str(),
                    ExportState::Unknown.as_str(),
                    ExportState::TimedOut.as_str(),
                ]),
            )
            .filter(export::Column::NextCheckAt.lte(now))
            .filter(
                Condition::any()
                    .add(export::Column::LeaseUntil.is_null())
                    .add(export::Column::LeaseUntil.lte(now)),
            )
            .limit(MAX_BATCH_SIZE);
        if let Some(job_id) = job_id {
            due = due.filter(export::Column::JobId.eq(job_id));
        }
        let due_ids: Vec<String> = due
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to scan due exports: {}", e)))?
            .into_iter()
            .map(|row| row.id)
            .collect();

        if !due_ids.is_empty() {
            Export::update_many()
                .col_expr(
                    export::Column::LeaseUntil,
                    sea_orm::sea_query::Expr::value(lease_until),
                )
                .filter(export::Column::Id.is_in(due_ids))
                .exec(self.connection())
                .await
                .map_err(|e| AppError::Database(format!("Failed to lease exports: {}", e)))?;
        }

        let mut leased = Export::find()
            .filter(export::Column::LeaseUntil.gt(now))
            .filter(export::Column::NextCheckAt.lte(now));
        if let Some(job_id) = job_id {
            leased = leased.filter(export::Column::JobId.eq(job_id));
        }
        let rows = leased
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to read leased exports: {}", e)))?;

        Ok(rows)
    }

    /// Terminal transition past `deadline_at`.
    pub async fn mark_export_timed_out(&self, id: &str) -> AppResult<()> {
        let export = self
            .get_export(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Export {}", id)))?;

        let mut active: ActiveModel = export.into();
        active.state = Set(ExportState::TimedOut.as_str().to_string());
        active.updated_at = Set(Utc::now());
        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to time out export: {}", e)))?;

        Ok(())
    }

    /// A poll saw the task still running; reschedule with backoff.
    /// The error column is left untouched.
    pub async fn record_poll_running(&self, id: &str, task_status: &str) -> AppResult<()> {
        let export = self
            .get_export(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Export {}", id)))?;

        let now = Utc::now();
        let next_interval = next_backoff(export.poll_interval_sec);

        let mut active: ActiveModel = export.into();
        active.state = Set(ExportState::Running.as_str().to_string());
        active.task_status = Set(task_status.to_string());
        active.poll_interval_sec = Set(next_interval);
        active.next_check_at = Set(now + Duration::seconds(next_interval as i64));
        active.updated_at = Set(now);
        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to reschedule export: {}", e)))?;

        Ok(())
    }

    /// A poll projected an unrecognized remote state; probe again later at
    /// the current interval.
    pub async fn record_poll_unknown(
        &self,
        id: &str,
        task_status: &str,
        diagnostic: &str,
    ) -> AppResult<()> {
        let export = self
            .get_export(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Export {}", id)))?;

        let now = Utc::now();
        let interval = export.poll_interval_sec;

        let mut active: ActiveModel = export.into();
        active.state = Set(ExportState::Unknown.as_str().to_string());
        active.task_status = Set(task_status.to_string());
        active.next_check_at = Set(now + Duration::seconds(interval as i64));
        active.error = Set(Some(diagnostic.to_string()));
        active.updated_at = Set(now);
        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to record unknown state: {}", e)))?;

        Ok(())
    }

    /// A poll observed a terminal remote state.
    pub async fn record_poll_terminal(
        &self,
        id: &str,
        state: ExportState,
        task_status: &str,
        error: Option<&str>,
    ) -> AppResult<()> {
        let export = self
            .get_export(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Export {}", id)))?;

        let mut active: ActiveModel = export.into();
        active.state = Set(state.as_str().to_string());
        active.task_status = Set(task_status.to_string());
        active.error = Set(error.map(|e| e.to_string()));
        active.updated_at = Set(Utc::now());
        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to finalize export: {}", e)))?;

        Ok(())
    }

    /// The status call itself failed; back off and try again later.
    pub async fn record_poll_error(&self, id: &str, error: &str) -> AppResult<()> {
        let export = self
            .get_export(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Export {}", id)))?;

        let now = Utc::now();
        let next_interval = next_backoff(export.poll_interval_sec);
        let attempts = export.attempts + 1;

        let mut active: ActiveModel = export.into();
        active.attempts = Set(attempts);
        active.poll_interval_sec = Set(next_interval);
        active.next_check_at = Set(now + Duration::seconds(next_interval as i64));
        active.error = Set(Some(error.to_string()));
        active.updated_at = Set(now);
        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to record poll error: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_geometrically_and_caps() {
        assert_eq!(next_backoff(15), 30);
        assert_eq!(next_backoff(30), 60);
        assert_eq!(next_backoff(1000), 1800);
        assert_eq!(next_backoff(1800), 1800);
        assert_eq!(next_backoff(0), 2);
    }
}
