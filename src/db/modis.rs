//! Database queries for upstream-collection snapshots.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};

use crate::entity::modis::{self, ActiveModel, Entity as Modis};
use crate::error::{AppError, AppResult};

use super::DbPool;

impl DbPool {
    /// Record what one upstream source collection looked like at job
    /// creation time.
    pub async fn insert_snapshot(
        &self,
        job_id: &str,
        name: &str,
        collection: &str,
        images: i32,
        last_image: &str,
    ) -> AppResult<modis::Model> {
        let now = Utc::now();
        let model = ActiveModel {
            job_id: Set(job_id.to_string()),
            name: Set(name.to_string()),
            collection: Set(collection.to_string()),
            images: Set(images),
            last_image: Set(last_image.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        let result = model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert snapshot: {}", e)))?;

        Ok(result)
    }

    /// All snapshots captured for a job.
    pub async fn get_snapshots_for_job(&self, job_id: &str) -> AppResult<Vec<modis::Model>> {
        let result = Modis::find()
            .filter(modis::Column::JobId.eq(job_id))
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get snapshots: {}", e)))?;

        Ok(result)
    }
}
