//! Database queries for jobs.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, Condition, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use crate::entity::job::{self, ActiveModel, Entity as Job};
use crate::error::{AppError, AppResult};
use crate::models::{join_error_msgs, JobStatus, StageStatus};

use super::DbPool;

/// Which per-stage column a status write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Image,
    Stats,
    Website,
    Report,
}

impl DbPool {
    /// Insert a new job in RUNNING state with all stages PENDING.
    pub async fn insert_job(&self, timezone: &str) -> AppResult<job::Model> {
        let now = Utc::now();
        let model = ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            job_status: Set(JobStatus::Running.as_str().to_string()),
            image_export_status: Set(StageStatus::Pending.as_str().to_string()),
            stats_export_status: Set(StageStatus::Pending.as_str().to_string()),
            website_update_status: Set(StageStatus::Pending.as_str().to_string()),
            report_status: Set(StageStatus::Pending.as_str().to_string()),
            error: Set(None),
            timezone: Set(timezone.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let result = model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert job: {}", e)))?;

        Ok(result)
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &str) -> AppResult<Option<job::Model>> {
        let result = Job::find_by_id(id)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get job: {}", e)))?;

        Ok(result)
    }

    /// Get a job by ID, erroring when absent.
    pub async fn require_job(&self, id: &str) -> AppResult<job::Model> {
        self.get_job(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {}", id)))
    }

    /// Jobs the orchestration tick still has work for: RUNNING, or finished
    /// with a pending report.
    pub async fn list_orchestratable_jobs(&self) -> AppResult<Vec<job::Model>> {
        let result = Job::find()
            .filter(
                Condition::any()
                    .add(job::Column::JobStatus.eq(JobStatus::Running.as_str()))
                    .add(job::Column::ReportStatus.eq(StageStatus::Pending.as_str())),
            )
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to list jobs: {}", e)))?;

        Ok(result)
    }

    /// Update one stage-status column, optionally appending to the job's
    /// accumulated error list.
    pub async fn set_stage_status(
        &self,
        id: &str,
        stage: Stage,
        status: StageStatus,
        error_append: Option<&str>,
    ) -> AppResult<job::Model> {
        let job = self.require_job(id).await?;
        let error = match error_append {
            Some(msg) => join_error_msgs(job.error.as_deref(), Some(msg)),
            None => job.error.clone(),
        };

        let mut active: ActiveModel = job.into();
        let value = Set(status.as_str().to_string());
        match stage {
            Stage::Image => active.image_export_status = value,
            Stage::Stats => active.stats_export_status = value,
            Stage::Website => active.website_update_status = value,
            Stage::Report => active.report_status = value,
        }
        active.error = Set(error);
        active.updated_at = Set(Utc::now());

        let result = active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to update stage status: {}", e)))?;

        Ok(result)
    }

    /// Update the image and stats stage columns together (the image worker's
    /// terminal write).
    pub async fn set_image_and_stats_status(
        &self,
        id: &str,
        image: StageStatus,
        stats: StageStatus,
    ) -> AppResult<job::Model> {
        let job = self.require_job(id).await?;
        let mut active: ActiveModel = job.into();
        active.image_export_status = Set(image.as_str().to_string());
        active.stats_export_status = Set(stats.as_str().to_string());
        active.updated_at = Set(Utc::now());

        let result = active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to update stage statuses: {}", e)))?;

        Ok(result)
    }

    /// Update the overall job status, optionally appending an error.
    pub async fn set_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error_append: Option<&str>,
    ) -> AppResult<job::Model> {
        let job = self.require_job(id).await?;
        let error = match error_append {
            Some(msg) => join_error_msgs(job.error.as_deref(), Some(msg)),
            None => job.error.clone(),
        };

        let mut active: ActiveModel = job.into();
        active.job_status = Set(status.as_str().to_string());
        active.error = Set(error);
        active.updated_at = Set(Utc::now());

        let result = active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to update job status: {}", e)))?;

        Ok(result)
    }

    /// Mark the job and all pipeline stages FAILED. Used when the remote
    /// compute service cannot be reached during job initiation.
    pub async fn fail_job_and_stages(&self, id: &str, error_append: &str) -> AppResult<job::Model> {
        let job = self.require_job(id).await?;
        let error = join_error_msgs(job.error.as_deref(), Some(error_append));

        let mut active: ActiveModel = job.into();
        active.job_status = Set(JobStatus::Failed.as_str().to_string());
        active.image_export_status = Set(StageStatus::Failed.as_str().to_string());
        active.stats_export_status = Set(StageStatus::Failed.as_str().to_string());
        active.website_update_status = Set(StageStatus::Failed.as_str().to_string());
        active.error = Set(error);
        active.updated_at = Set(Utc::now());

        let result = active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to fail job: {}", e)))?;

        Ok(result)
    }
}
