//! Object-store adapter over the S3 API.
//!
//! Covers what the pipeline needs: blob existence checks, small text blobs
//! (manifests), copy/move/delete for the archive contract, prefix listing,
//! and downloads into the website working copy.

use std::path::Path;

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use tracing::info;

use crate::error::{AppError, AppResult};

/// S3 storage client wrapper bound to one bucket.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
}

impl ObjectStore {
    /// Create a client from the ambient credential chain and verify the
    /// bucket is reachable.
    pub async fn new(bucket: &str) -> AppResult<Self> {
        let shared_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(s3_config);

        let store = Self {
            client,
            bucket: bucket.to_string(),
        };

        store
            .client
            .head_bucket()
            .bucket(&store.bucket)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Cannot access bucket '{}': {}",
                    store.bucket,
                    e.into_service_error()
                ))
            })?;

        info!("Object store initialized: bucket={}", bucket);
        Ok(store)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Whether a blob exists.
    pub async fn exists(&self, key: &str) -> AppResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(AppError::Storage(format!(
                        "Failed to check blob '{}': {}",
                        key, service_error
                    )))
                }
            }
        }
    }

    /// Read a small text blob (e.g. a manifest).
    pub async fn read_text(&self, key: &str) -> AppResult<String> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!("Failed to get blob '{}': {}", key, e.into_service_error()))
            })?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to read blob '{}': {}", key, e)))?
            .into_bytes();
        String::from_utf8(bytes.to_vec())
            .map_err(|e| AppError::Storage(format!("Blob '{}' is not valid UTF-8: {}", key, e)))
    }

    /// Write a small text blob, replacing any existing one.
    pub async fn write_text(&self, key: &str, body: &str) -> AppResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(aws_sdk_s3::primitives::ByteStream::from(
                body.as_bytes().to_vec(),
            ))
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!("Failed to put blob '{}': {}", key, e.into_service_error()))
            })?;
        Ok(())
    }

    /// Server-side copy within the bucket.
    pub async fn copy(&self, src_key: &str, dest_key: &str) -> AppResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src_key))
            .key(dest_key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Failed to copy '{}' to '{}': {}",
                    src_key,
                    dest_key,
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }

    /// Delete a blob.
    pub async fn delete(&self, key: &str) -> AppResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "Failed to delete blob '{}': {}",
                    key,
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }

    /// Move a blob (copy then delete the source).
    pub async fn rename(&self, src_key: &str, dest_key: &str) -> AppResult<()> {
        self.copy(src_key, dest_key).await?;
        self.delete(src_key).await
    }

    /// List blob keys under a prefix, following pagination.
    pub async fn list(&self, prefix: &str) -> AppResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(|e| {
                AppError::Storage(format!(
                    "Failed to list prefix '{}': {}",
                    prefix,
                    e.into_service_error()
                ))
            })?;
            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            continuation = response.next_continuation_token().map(|t| t.to_string());
            if continuation.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    /// Download a blob to a local file, creating parent directories.
    pub async fn download_to_file(&self, key: &str, local_path: &Path) -> AppResult<()> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                AppError::Storage(format!("Failed to get blob '{}': {}", key, e.into_service_error()))
            })?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to read blob '{}': {}", key, e)))?
            .into_bytes();
        tokio::fs::write(local_path, &bytes).await.map_err(|e| {
            AppError::Storage(format!("Failed to write {}: {}", local_path.display(), e))
        })?;
        Ok(())
    }
}
