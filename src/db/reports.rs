//! Database queries for job reports.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};

use crate::entity::report::{self, ActiveModel, Entity as Report};
use crate::error::{AppError, AppResult};
use crate::models::ReportStatus;

use super::DbPool;

impl DbPool {
    /// The job's report row, if one exists (at most one per job).
    pub async fn get_report_for_job(&self, job_id: &str) -> AppResult<Option<report::Model>> {
        let result = Report::find()
            .filter(report::Column::JobId.eq(job_id))
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get report: {}", e)))?;

        Ok(result)
    }

    /// Create the report row on first delivery attempt, or bump `attempts`
    /// on a retry.
    pub async fn create_or_bump_report(&self, job_id: &str) -> AppResult<report::Model> {
        let now = Utc::now();
        match self.get_report_for_job(job_id).await? {
            Some(existing) => {
                let attempts = existing.attempts + 1;
                let mut active: ActiveModel = existing.into();
                active.attempts = Set(attempts);
                active.updated_at = Set(now);
                let result = active
                    .update(self.connection())
                    .await
                    .map_err(|e| AppError::Database(format!("Failed to bump report: {}", e)))?;
                Ok(result)
            }
            None => {
                let model = ActiveModel {
                    job_id: Set(job_id.to_string()),
                    status: Set(ReportStatus::Pending.as_str().to_string()),
                    attempts: Set(1),
                    last_error: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                let result = model
                    .insert(self.connection())
                    .await
                    .map_err(|e| AppError::Database(format!("Failed to insert report: {}", e)))?;
                Ok(result)
            }
        }
    }

    /// Update a report's status and last error.
    pub async fn set_report_status(
        &self,
        report_id: i32,
        status: ReportStatus,
        last_error: Option<&str>,
    ) -> AppResult<report::Model> {
        let report = Report::find_by_id(report_id)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get report: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Report {}", report_id)))?;

        let mut active: ActiveModel = report.into();
        active.status = Set(status.as_str().to_string());
        active.last_error = Set(last_error.map(|e| e.to_string()));
        active.updated_at = Set(Utc::now());

        let result = active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to update report: {}", e)))?;

        Ok(result)
    }
}
