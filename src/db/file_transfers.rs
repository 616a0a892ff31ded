//! Database queries for file transfers (archive bookkeeping and rollback).

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};

use crate::entity::export::{self, Entity as Export};
use crate::entity::file_transfer::{self, ActiveModel, Entity as FileTransfer};
use crate::error::{AppError, AppResult};
use crate::models::{ExportState, TransferStatus};

use super::DbPool;

impl DbPool {
    /// Record the archive mapping for one export's output file.
    pub async fn insert_file_transfer(
        &self,
        job_id: &str,
        export_id: &str,
        source_path: &str,
        destination_path: &str,
        status: TransferStatus,
    ) -> AppResult<file_transfer::Model> {
        let now = Utc::now();
        let model = ActiveModel {
            job_id: Set(job_id.to_string()),
            export_id: Set(export_id.to_string()),
            source_path: Set(source_path.to_string()),
            destination_path: Set(destination_path.to_string()),
            status: Set(status.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        let result = model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert file transfer: {}", e)))?;

        Ok(result)
    }

    /// All transfers recorded for a job.
    pub async fn get_file_transfers_for_job(
        &self,
        job_id: &str,
    ) -> AppResult<Vec<file_transfer::Model>> {
        let result = FileTransfer::find()
            .filter(file_transfer::Column::JobId.eq(job_id))
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get file transfers: {}", e)))?;

        Ok(result)
    }

    /// Transfers eligible for rollback: the export FAILED and an archived
    /// prior version exists.
    pub async fn rollback_candidates(&self, job_id: &str) -> AppResult<Vec<file_transfer::Model>> {
        let failed_export_ids: Vec<String> = Export::find()
            .filter(export::Column::JobId.eq(job_id))
            .filter(export::Column::State.eq(ExportState::Failed.as_str()))
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get failed exports: {}", e)))?
            .into_iter()
            .map(|row| row.id)
            .collect();

        if failed_export_ids.is_empty() {
            return Ok(Vec::new());
        }

        let result = FileTransfer::find()
            .filter(file_transfer::Column::JobId.eq(job_id))
            .filter(file_transfer::Column::ExportId.is_in(failed_export_ids))
            .filter(file_transfer::Column::Status.eq(TransferStatus::HasArchive.as_str()))
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get rollback candidates: {}", e)))?;

        Ok(result)
    }

    /// Mark a transfer rolled back.
    pub async fn mark_transfer_rolled_back(&self, transfer_id: i32) -> AppResult<()> {
        let row = FileTransfer::find_by_id(transfer_id)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to get file transfer: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("FileTransfer {}", transfer_id)))?;

        let mut active: ActiveModel = row.into();
        active.status = Set(TransferStatus::RolledBack.as_str().to_string());
        active.updated_at = Set(Utc::now());
        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to mark rollback: {}", e)))?;

        Ok(())
    }
}
