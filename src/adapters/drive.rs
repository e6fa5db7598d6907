//! Google Drive v3 REST backend.
//!
//! Authentication is out of scope: the client is given a bearer token that
//! was obtained elsewhere. Retries happen in the pipeline; this client maps
//! every HTTP failure onto a [`StorageError`] so the pipeline can tell
//! transient failures from fatal ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::DriveConfig;
use crate::core::{
    ByteSource, ByteStream, ExportSpec, ListQuery, LocationFilter, RemoteFile, StorageClient,
};
use crate::error::StorageError;

const LIST_FIELDS: &str = "nextPageToken,files(id,name,size,mimeType,modifiedTime,createdTime,ownedByMe,driveId,sharedWithMeTime)";

pub struct DriveClient {
    http: Client,
    api_base: String,
    access_token: String,
    page_size: u32,
    /// Bound for metadata requests. Streams are bounded per chunk by the caller.
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    /// Int64 encoded as a string; absent for native documents.
    size: Option<String>,
    mime_type: String,
    modified_time: Option<String>,
    created_time: Option<String>,
    #[serde(default)]
    owned_by_me: bool,
    drive_id: Option<String>,
    shared_with_me_time: Option<String>,
}

impl From<DriveFile> for RemoteFile {
    fn from(file: DriveFile) -> Self {
        Self {
            size: file
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            owned_by_me: file.owned_by_me,
            in_primary_drive: file.drive_id.is_none() && file.shared_with_me_time.is_none(),
            modified_time: parse_time(file.modified_time.as_deref()),
            created_time: parse_time(file.created_time.as_deref()),
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
        }
    }
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ErrorReason {
    #[serde(default)]
    reason: String,
}

impl DriveClient {
    pub fn new(config: &DriveConfig, request_timeout: Duration) -> anyhow::Result<Self> {
        let access_token = config
            .access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No Drive access token configured (set drive.access_token or DARC_DRIVE__ACCESS_TOKEN)"
                )
            })?;

        let http = Client::builder()
            .connect_timeout(request_timeout)
            .user_agent(concat!("darc/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            access_token,
            page_size: config.page_size,
            request_timeout,
        })
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, id)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StorageError> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await
    }

    async fn open_stream(&self, request: RequestBuilder) -> Result<ByteStream, StorageError> {
        let response = self.send(request).await?;
        Ok(Box::new(ResponseStream { response }))
    }
}

#[async_trait]
impl StorageClient for DriveClient {
    async fn list(&self, query: ListQuery) -> Result<Vec<RemoteFile>, StorageError> {
        let q = if query.owned_only {
            "'me' in owners and trashed = false"
        } else {
            "trashed = false"
        };

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(format!("{}/files", self.api_base))
                .timeout(self.request_timeout)
                .query(&[
                    ("q", q),
                    ("fields", LIST_FIELDS),
                    ("spaces", "drive"),
                ])
                .query(&[("pageSize", self.page_size)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let page: FileList = self
                .send(request)
                .await?
                .json()
                .await
                .map_err(|e| StorageError::Fatal(format!("malformed file list: {}", e)))?;

            debug!(count = page.files.len(), "Listed page");
            files.extend(page.files.into_iter().map(RemoteFile::from));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        if query.location == LocationFilter::PrimaryDrive {
            files.retain(|f| f.in_primary_drive);
        }
        Ok(files)
    }

    async fn download(&self, id: &str) -> Result<ByteStream, StorageError> {
        let request = self.http.get(self.file_url(id)).query(&[("alt", "media")]);
        self.open_stream(request).await
    }

    async fn export_native(&self, id: &str, format: &ExportSpec) -> Result<ByteStream, StorageError> {
        let request = self
            .http
            .get(format!("{}/export", self.file_url(id)))
            .query(&[("mimeType", format.mime_type.as_str())]);
        self.open_stream(request).await
    }

    async fn trash(&self, id: &str) -> Result<(), StorageError> {
        let request = self
            .http
            .patch(self.file_url(id))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({ "trashed": true }));
        self.send(request).await?;
        Ok(())
    }
}

struct ResponseStream {
    response: Response,
}

#[async_trait]
impl ByteSource for ResponseStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let chunk = self.response.chunk().await.map_err(transport_error)?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}

fn transport_error(e: reqwest::Error) -> StorageError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        StorageError::Transient(e.to_string())
    } else {
        StorageError::Fatal(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> StorageError {
    let (message, reasons) = match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => (
            parsed.error.message,
            parsed
                .error
                .errors
                .into_iter()
                .map(|e| e.reason)
                .collect::<Vec<_>>(),
        ),
        Err(_) => (body.chars().take(200).collect(), Vec::new()),
    };
    let detail = format!("HTTP {}: {}", status.as_u16(), message);

    match status {
        StatusCode::UNAUTHORIZED => StorageError::Unauthorized(detail),
        StatusCode::NOT_FOUND => StorageError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => StorageError::RateLimited(detail),
        StatusCode::FORBIDDEN if reasons.iter().any(|r| is_rate_limit_reason(r)) => {
            StorageError::RateLimited(detail)
        }
        StatusCode::REQUEST_TIMEOUT => StorageError::Transient(detail),
        s if s.is_server_error() => StorageError::Transient(detail),
        _ => StorageError::Fatal(detail),
    }
}

/// Drive reports per-user throttling as 403 with one of these reasons.
fn is_rate_limit_reason(reason: &str) -> bool {
    matches!(reason, "rateLimitExceeded" | "userRateLimitExceeded")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            StorageError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            StorageError::NotFound(_)
        ));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad"),
            StorageError::Fatal(_)
        ));
    }

    #[test]
    fn test_forbidden_rate_limit_is_transient_but_quota_is_not() {
        let throttled = r#"{"error":{"message":"Rate Limit Exceeded","errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, throttled),
            StorageError::RateLimited(_)
        ));

        let quota = r#"{"error":{"message":"The user's Drive storage quota has been exceeded.","errors":[{"reason":"storageQuotaExceeded"}]}}"#;
        match classify_status(StatusCode::FORBIDDEN, quota) {
            StorageError::Fatal(detail) => assert!(detail.contains("quota")),
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_drive_file_conversion() {
        let json = r#"{
            "files": [
                {"id": "a", "name": "trip.jpg", "size": "314572800", "mimeType": "image/jpeg",
                 "modifiedTime": "2025-06-15T10:00:00.000Z", "ownedByMe": true},
                {"id": "b", "name": "Notes", "mimeType": "application/vnd.google-apps.document",
                 "modifiedTime": "not a date", "ownedByMe": true, "sharedWithMeTime": "2024-01-01T00:00:00Z"}
            ],
            "nextPageToken": "next"
        }"#;
        let list: FileList = serde_json::from_str(json).unwrap();
        assert_eq!(list.next_page_token.as_deref(), Some("next"));

        let files: Vec<RemoteFile> = list.files.into_iter().map(RemoteFile::from).collect();
        assert_eq!(files[0].size, 314_572_800);
        assert!(files[0].in_primary_drive);
        assert!(files[0].modified_time.is_some());

        assert_eq!(files[1].size, 0);
        assert!(!files[1].in_primary_drive);
        assert!(files[1].modified_time.is_none());
    }

    #[test]
    fn test_missing_token_is_rejected() {
        let config = DriveConfig::default();
        assert!(DriveClient::new(&config, Duration::from_secs(5)).is_err());
    }
}
