//! Remote-task adapter: thin boundary over the geospatial compute service.
//!
//! The orchestrator only consumes four operations: list the members of an
//! image collection, submit an image/table export task, and query a task's
//! state. Everything the service does internally (the geospatial algorithms)
//! is out of scope.
//!
//! Errors never cross this boundary as panics or control flow; callers get a
//! `Result` and decide whether to back off (poller) or materialize a failure
//! (stage workers).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::{ImageExportRequest, RemoteTaskStatus, TableTaskDescriptor, TaskSubmission};

/// HTTP connect timeout for compute-service calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// HTTP total timeout for compute-service calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Access tokens are refreshed one minute before they expire.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Boundary the stage workers and the poller talk through.
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Names of the image assets inside a collection (final path segment).
    async fn list_image_assets(&self, collection_path: &str) -> AppResult<Vec<String>>;

    /// Dates of the daily images inside an upstream source collection,
    /// sorted ascending.
    async fn collection_dates(&self, collection_path: &str) -> AppResult<Vec<chrono::NaiveDate>>;

    /// Submit one monthly image-generation task.
    async fn submit_image_export(&self, request: &ImageExportRequest) -> AppResult<TaskSubmission>;

    /// Submit one table-statistics task.
    async fn submit_table_export(
        &self,
        descriptor: &TableTaskDescriptor,
        bucket: Option<&str>,
    ) -> AppResult<TaskSubmission>;

    /// Current remote state of a previously submitted task.
    async fn task_status(&self, task_id: &str) -> AppResult<RemoteTaskStatus>;
}

/// Service-account credential document (the fields this adapter consumes).
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
    project_id: String,
}

#[derive(serde::Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

/// HTTP client for the geospatial compute service, authenticated with a
/// service-account identity.
pub struct GeoComputeClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    client_email: String,
    private_key: SecretString,
    token_uri: String,
    token_cache: Arc<RwLock<Option<CachedToken>>>,
}

const DEFAULT_BASE_URL: &str = "https://earthengine.googleapis.com/v1";
const TOKEN_SCOPE: &str =
    "https://www.googleapis.com/auth/earthengine https://www.googleapis.com/auth/cloud-platform";

impl GeoComputeClient {
    /// Build a client from the configured credential document.
    pub fn from_credentials_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::RemoteTask(format!("Cannot read credentials file {}: {}", path.display(), e))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .map_err(|e| AppError::RemoteTask(format!("Invalid credentials document: {}", e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::RemoteTask(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            project_id: key.project_id,
            client_email: key.client_email,
            private_key: SecretString::from(key.private_key),
            token_uri: key.token_uri,
            token_cache: Arc::new(RwLock::new(None)),
        })
    }

    /// Override the service endpoint (used against emulators).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Mint or reuse a bearer token for the service identity.
    async fn access_token(&self) -> AppResult<SecretString> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.expires_at > Instant::now() + TOKEN_EXPIRY_SLACK {
                    return Ok(cached.token.clone());
                }
            }
        }

        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            iss: &self.client_email,
            scope: TOKEN_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
                .map_err(|e| AppError::RemoteTask(format!("Invalid service-account key: {}", e)))?,
        )
        .map_err(|e| AppError::RemoteTask(format!("Failed to sign token assertion: {}", e)))?;

        debug!("Requesting compute-service access token");
        let response = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::RemoteTask(format!("Token exchange failed: {}", e)))?;
        let token: TokenResponse = response.json().await?;

        let secret = SecretString::from(token.access_token);
        let mut cache = self.token_cache.write().await;
        *cache = Some(CachedToken {
            token: secret.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(secret)
    }

    async fn get_json(&self, url: &str) -> AppResult<serde_json::Value> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::RemoteTask(e.to_string()))?;
        Ok(response.json().await?)
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> AppResult<serde_json::Value> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token.expose_secret())
            .json(body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AppError::RemoteTask(e.to_string()))?;
        Ok(response.json().await?)
    }

    /// List every asset name in a collection, following pagination.
    async fn list_assets(&self, collection_path: &str) -> AppResult<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/{}:listAssets?pageSize=1000",
                self.base_url, collection_path
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", token));
            }
            let body = self.get_json(&url).await?;
            if let Some(assets) = body.get("assets").and_then(|a| a.as_array()) {
                for asset in assets {
                    if let Some(name) = asset.get("name").and_then(|n| n.as_str()) {
                        if let Some(leaf) = name.rsplit('/').next() {
                            names.push(leaf.to_string());
                        }
                    }
                }
            }
            page_token = body
                .get("nextPageToken")
                .and_then(|t| t.as_str())
                .map(|t| t.to_string());
            if page_token.is_none() {
                break;
            }
        }
        Ok(names)
    }

    fn submission_from_operation(body: &serde_json::Value) -> TaskSubmission {
        let task_id = body
            .get("name")
            .and_then(|n| n.as_str())
            .map(|n| n.to_string());
        let task_status = body
            .pointer("/metadata/state")
            .and_then(|s| s.as_str())
            .unwrap_or("PENDING")
            .to_string();
        let error = body
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string());
        TaskSubmission {
            task_id,
            task_status,
            error,
        }
    }
}

/// Parse a trailing `YYYY[-_]MM[-_]DD` date out of an asset name.
fn parse_trailing_date(name: &str) -> Option<chrono::NaiveDate> {
    if name.len() < 10 {
        return None;
    }
    let tail = &name[name.len() - 10..];
    let bytes = tail.as_bytes();
    let seps_ok = (bytes[4] == b'-' || bytes[4] == b'_') && (bytes[7] == b'-' || bytes[7] == b'_');
    if !seps_ok {
        return None;
    }
    let normalized = tail.replace('_', "-");
    chrono::NaiveDate::parse_from_str(&normalized, "%Y-%m-%d").ok()
}

#[async_trait]
impl TaskService for GeoComputeClient {
    async fn list_image_assets(&self, collection_path: &str) -> AppResult<Vec<String>> {
        self.list_assets(collection_path).await
    }

    async fn collection_dates(&self, collection_path: &str) -> AppResult<Vec<chrono::NaiveDate>> {
        let names = self.list_assets(collection_path).await?;
        let mut dates: Vec<chrono::NaiveDate> =
            names.iter().filter_map(|n| parse_trailing_date(n)).collect();
        dates.sort();
        if dates.is_empty() {
            warn!("Collection {} contains no dated images", collection_path);
        }
        Ok(dates)
    }

    async fn submit_image_export(&self, request: &ImageExportRequest) -> AppResult<TaskSubmission> {
        let url = format!("{}/projects/{}/image:export", self.base_url, self.project_id);
        let body = serde_json::json!({
            "description": request.name,
            "assetExportOptions": {
                "assetId": format!("{}/{}", request.collection_path, request.name),
            },
            "parameters": {
                "month": request.month,
                "aoi": request.aoi_asset_path,
                "dem": request.dem_asset_path,
            },
        });
        let response = self.post_json(&url, &body).await?;
        Ok(Self::submission_from_operation(&response))
    }

    async fn submit_table_export(
        &self,
        descriptor: &TableTaskDescriptor,
        bucket: Option<&str>,
    ) -> AppResult<TaskSubmission> {
        let url = format!("{}/projects/{}/table:export", self.base_url, self.project_id);
        let mut body = serde_json::json!({
            "description": descriptor.name,
            "parameters": {
                "basin": descriptor.basin_code,
                "sourceCollection": descriptor.source_collection,
            },
        });
        match bucket {
            Some(bucket) => {
                body["fileExportOptions"] = serde_json::json!({
                    "cloudStorageDestination": {
                        "bucket": bucket,
                        "filenamePrefix": format!("{}/{}", descriptor.path, descriptor.name),
                    },
                });
            }
            None => {
                body["fileExportOptions"] = serde_json::json!({
                    "driveDestination": {
                        "folder": descriptor.path,
                        "filenamePrefix": descriptor.name,
                    },
                });
            }
        }
        let response = self.post_json(&url, &body).await?;
        Ok(Self::submission_from_operation(&response))
    }

    async fn task_status(&self, task_id: &str) -> AppResult<RemoteTaskStatus> {
        let url = format!("{}/{}", self.base_url, task_id);
        let body = self.get_json(&url).await?;
        let status = body
            .pointer("/metadata/state")
            .and_then(|s| s.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        let error = body
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string());
        Ok(RemoteTaskStatus { status, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trailing_date() {
        assert_eq!(
            parse_trailing_date("2024_01_15"),
            Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
        );
        assert_eq!(
            parse_trailing_date("MOD10A1_2023-12-31"),
            Some(chrono::NaiveDate::from_ymd_opt(2023, 12, 31).unwrap())
        );
        assert_eq!(parse_trailing_date("Snow_TAC_2024_01"), None);
        assert_eq!(parse_trailing_date("short"), None);
    }

    #[test]
    fn test_submission_from_operation() {
        let body = serde_json::json!({
            "name": "projects/snow/operations/ABC123",
            "metadata": { "state": "PENDING" },
        });
        let submission = GeoComputeClient::submission_from_operation(&body);
        assert_eq!(
            submission.task_id.as_deref(),
            Some("projects/snow/operations/ABC123")
        );
        assert_eq!(submission.task_status, "PENDING");
        assert!(submission.error.is_none());
        assert_eq!(submission.state(), crate::models::ExportState::Running);
    }
}
