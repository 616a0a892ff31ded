//! Database queries for website update records.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};

use crate::entity::website_update::{self, ActiveModel, Entity as WebsiteUpdate};
use crate::error::{AppError, AppResult};
use crate::models::WebsiteUpdateStatus;

use super::DbPool;

impl DbPool {
    /// The job's website update row, if one exists (at most one per job).
    pub async fn get_website_update_for_job(
        &self,
        job_id: &str,
    ) -> AppResult<Option<website_update::Model>> {
        let result = WebsiteUpdate::find()
            .filter(website_update::Column::JobId.eq(job_id))
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get website update: {}", e)))?;

        Ok(result)
    }

    /// The website worker is idempotent: reuse the existing row when present.
    pub async fn get_or_create_website_update(
        &self,
        job_id: &str,
    ) -> AppResult<website_update::Model> {
        if let Some(existing) = self.get_website_update_for_job(job_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let model = ActiveModel {
            job_id: Set(job_id.to_string()),
            status: Set(WebsiteUpdateStatus::Pending.as_str().to_string()),
            pull_request_id: Set(None),
            pull_request_url: Set(None),
            attempts: Set(0),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        let result = model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert website update: {}", e)))?;

        Ok(result)
    }

    /// Record a failed publication attempt; the row stays PENDING so a later
    /// tick retries.
    pub async fn record_website_attempt_failure(
        &self,
        job_id: &str,
        error: &str,
    ) -> AppResult<website_update::Model> {
        let row = self
            .get_website_update_for_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("WebsiteUpdate for job {}", job_id)))?;

        let attempts = row.attempts + 1;
        let mut active: ActiveModel = row.into();
        active.attempts = Set(attempts);
        active.last_error = Set(Some(error.to_string()));
        active.updated_at = Set(Utc::now());

        let result = active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to record website attempt: {}", e)))?;

        Ok(result)
    }

    /// Mark the publication COMPLETED, recording the pull request when one
    /// was opened.
    pub async fn complete_website_update(
        &self,
        job_id: &str,
        pull_request_id: Option<String>,
        pull_request_url: Option<String>,
    ) -> AppResult<website_update::Model> {
        let row = self
            .get_website_update_for_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("WebsiteUpdate for job {}", job_id)))?;

        let mut active: ActiveModel = row.into();
        active.status = Set(WebsiteUpdateStatus::Completed.as_str().to_string());
        active.pull_request_id = Set(pull_request_id);
        active.pull_request_url = Set(pull_request_url);
        active.updated_at = Set(Utc::now());

        let result = active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to complete website update: {}", e)))?;

        Ok(result)
    }

    /// Force a website update status (used for abnormal-state handling).
    pub async fn set_website_update_status(
        &self,
        job_id: &str,
        status: WebsiteUpdateStatus,
        last_error: Option<&str>,
    ) -> AppResult<website_update::Model> {
        let row = self
            .get_website_update_for_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("WebsiteUpdate for job {}", job_id)))?;

        let mut active: ActiveModel = row.into();
        active.status = Set(status.as_str().to_string());
        if let Some(error) = last_error {
            active.last_error = Set(Some(error.to_string()));
        }
        active.updated_at = Set(Utc::now());

        let result = active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to set website status: {}", e)))?;

        Ok(result)
    }
}
