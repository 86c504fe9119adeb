//! Upload module
//!
//! Moves a local file to object storage through pre-signed URLs, one chunk
//! at a time. Three wire protocols are supported:
//!
//! | Provider | Requests | Success | Finalize | Abort |
//! |----------|----------|---------|----------|-------|
//! | S3 | one `PUT` per part URL | `200` + `ETag` | control plane finish with tags | control plane finish with error |
//! | Azure | one `PUT` per block URL | `201` | `PUT` block list | `PUT` empty block list |
//! | Google | `PUT` ranges to one session URL | `308` / `200` | implicit on last range | `DELETE` session |
//!
//! Every variant runs the same lifecycle:
//!
//! ```text
//! INIT -> TRANSFERRING -> FINALIZING -> DONE
//!              |               |
//!              +-------+-------+
//!                      v
//!                  ABORTING -> FAILED
//! ```
//!
//! A failure during transfer or finalize triggers exactly one abort, and the
//! caller receives one [`UploadError::Aborted`] naming the original cause and
//! any cleanup failures.

use crate::config::{HttpConfig, UploadConfig, DEFAULT_CHUNK_SIZE, DEFAULT_STREAM_WINDOW};
use crate::control_plane::{ControlPlane, ControlPlaneError, FinishUpload};
use crate::progress::ProgressTracker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod azure;
pub mod body;
pub mod chunk;
pub mod google;
pub mod s3;

pub use azure::AzureUploader;
pub use body::StreamingRequestBody;
pub use chunk::{Chunk, ChunkReader};
pub use google::GoogleUploader;
pub use s3::S3Uploader;

/// Storage provider behind a set of pre-signed URLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    S3,
    Azure,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::S3 => "s3",
            Provider::Azure => "azure",
            Provider::Google => "google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to read {}: {source}", .path.display())]
    ChunkRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("Protocol violation: {provider} {operation} returned HTTP {status}, expected {expected}")]
    UnexpectedStatus {
        provider: Provider,
        operation: &'static str,
        status: u16,
        expected: &'static str,
    },

    #[error("Protocol violation: {provider}: {message}")]
    Protocol { provider: Provider, message: String },

    #[error("Invalid upload descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("{cause}{}", describe_cleanup(.cleanup))]
    Aborted {
        cause: Box<UploadError>,
        cleanup: Vec<UploadError>,
    },
}

fn describe_cleanup(cleanup: &[UploadError]) -> String {
    if cleanup.is_empty() {
        return String::new();
    }
    let failures: Vec<String> = cleanup.iter().map(|e| e.to_string()).collect();
    format!(" (cleanup also failed: {})", failures.join("; "))
}

impl UploadError {
    pub(crate) fn transport(operation: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| UploadError::Transport { operation, source }
    }

    pub(crate) fn protocol(provider: Provider, message: impl Into<String>) -> Self {
        UploadError::Protocol {
            provider,
            message: message.into(),
        }
    }

    /// Combine the original failure with whatever went wrong while cleaning up
    pub(crate) fn aborted(cause: UploadError, cleanup: Vec<UploadError>) -> Self {
        UploadError::Aborted {
            cause: Box::new(cause),
            cleanup,
        }
    }

    /// The failure that started the abort, or `self` when nothing was aborted
    pub fn cause(&self) -> &UploadError {
        match self {
            UploadError::Aborted { cause, .. } => cause.cause(),
            other => other,
        }
    }

    /// Failures raised by the abort path, empty when cleanup succeeded
    pub fn cleanup_failures(&self) -> &[UploadError] {
        match self {
            UploadError::Aborted { cleanup, .. } => cleanup,
            _ => &[],
        }
    }

    /// The provider answered, but not the way its protocol says it should
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self.cause(),
            UploadError::UnexpectedStatus { .. } | UploadError::Protocol { .. }
        )
    }

    /// The request never produced a usable response
    pub fn is_transport(&self) -> bool {
        matches!(self.cause(), UploadError::Transport { .. })
    }
}

/// Where to upload, as issued by the control plane
///
/// Index `i` of the target URLs is part/block `i` of the file. The descriptor
/// is immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor {
    upload_id: String,
    #[serde(alias = "urls")]
    target_urls: Vec<String>,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

impl UploadDescriptor {
    pub fn new(upload_id: impl Into<String>, target_urls: Vec<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            target_urls,
            created_at: Utc::now(),
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn target_urls(&self) -> &[String] {
        &self.target_urls
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Parse the control plane's JSON response
    pub fn from_json(json: &str) -> Result<Self, UploadError> {
        let descriptor: Self = serde_json::from_str(json)
            .map_err(|e| UploadError::InvalidDescriptor(e.to_string()))?;
        if descriptor.upload_id.is_empty() {
            return Err(UploadError::InvalidDescriptor("uploadId is empty".into()));
        }
        if descriptor.target_urls.is_empty() {
            return Err(UploadError::InvalidDescriptor(
                "no target URLs were issued".into(),
            ));
        }
        Ok(descriptor)
    }
}

/// Completed S3 part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartResult {
    pub part_number: u32,
    pub e_tag: String,
}

impl PartResult {
    pub fn new(part_number: u32, e_tag: impl Into<String>) -> Self {
        Self {
            part_number,
            e_tag: e_tag.into(),
        }
    }
}

/// Result of a finished upload
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub provider: Provider,
    pub upload_id: String,
    pub bytes_uploaded: u64,
    pub requests: u32,
    /// Ordered part tags; only S3 produces any
    pub parts: Vec<PartResult>,
    pub duration: Duration,
}

/// Tuning shared by all uploaders
#[derive(Debug, Clone)]
pub struct UploaderOptions {
    pub chunk_size: u64,
    pub stream_window: usize,
    /// Nested output directory; selects the directory variant of the finish call
    pub output_dir: Option<String>,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            stream_window: DEFAULT_STREAM_WINDOW,
            output_dir: None,
        }
    }
}

impl UploaderOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            stream_window: config.stream_window,
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, output_dir: Option<String>) -> Self {
        self.output_dir = output_dir;
        self
    }

    pub fn chunk_reader(&self) -> ChunkReader {
        ChunkReader::new(self.chunk_size)
    }

    pub(crate) fn finish_request(&self, request: FinishUpload) -> FinishUpload {
        request.with_output_dir(self.output_dir.clone())
    }
}

/// Provider-neutral upload contract
#[async_trait]
pub trait ProviderUploader: Send + Sync {
    fn provider(&self) -> Provider;

    /// Transfer, finalize, and on failure abort. Resolves only once the
    /// upload has reached DONE or FAILED.
    async fn upload_file(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
        tracker: Arc<ProgressTracker>,
    ) -> Result<UploadReport, UploadError>;

    /// Best-effort cleanup of an incomplete upload. Safe to call after a
    /// partial or zero-progress transfer.
    async fn abort_upload(&self, file: &Path, descriptor: &UploadDescriptor)
        -> Result<(), UploadError>;
}

/// Closed set of protocol implementations, chosen by the target's provider
pub enum Uploader {
    S3(S3Uploader),
    Azure(AzureUploader),
    Google(GoogleUploader),
}

impl Uploader {
    pub fn for_provider(
        provider: Provider,
        http: reqwest::Client,
        control_plane: Arc<dyn ControlPlane>,
        options: UploaderOptions,
    ) -> Self {
        match provider {
            Provider::S3 => Uploader::S3(S3Uploader::new(http, control_plane, options)),
            Provider::Azure => Uploader::Azure(AzureUploader::new(http, control_plane, options)),
            Provider::Google => {
                Uploader::Google(GoogleUploader::new(http, control_plane, options))
            }
        }
    }

    fn inner(&self) -> &dyn ProviderUploader {
        match self {
            Uploader::S3(uploader) => uploader,
            Uploader::Azure(uploader) => uploader,
            Uploader::Google(uploader) => uploader,
        }
    }
}

#[async_trait]
impl ProviderUploader for Uploader {
    fn provider(&self) -> Provider {
        self.inner().provider()
    }

    async fn upload_file(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
        tracker: Arc<ProgressTracker>,
    ) -> Result<UploadReport, UploadError> {
        self.inner().upload_file(file, descriptor, tracker).await
    }

    async fn abort_upload(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
    ) -> Result<(), UploadError> {
        self.inner().abort_upload(file, descriptor).await
    }
}

/// Build the HTTP client used for provider requests
///
/// Timeouts are only set when configured. Redirects are never followed: a
/// Google `308 Resume Incomplete` is a protocol answer, not a redirect.
pub fn build_http_client(config: &HttpConfig) -> Result<reqwest::Client, UploadError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::none());
    if let Some(timeout) = config.timeout() {
        builder = builder.timeout(timeout);
    }
    if let Some(timeout) = config.connect_timeout() {
        builder = builder.connect_timeout(timeout);
    }
    builder.build().map_err(UploadError::transport("client setup"))
}

/// Name reported to the control plane for `file`
///
/// Uploaders resolve it before the first request; a path without a name
/// never leaves INIT, so there is nothing to abort.
pub(crate) fn file_name_of(file: &Path) -> Result<String, UploadError> {
    file.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| UploadError::ChunkRead {
            path: file.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        })
}

/// Parts expected for a file: one per chunk, and a single empty part for an
/// empty file
pub(crate) fn expected_parts(reader: &ChunkReader, file_size: u64) -> u64 {
    reader.chunk_count(file_size).max(1)
}

/// Tell the control plane the upload was abandoned
pub(crate) async fn notify_failure(
    control_plane: &dyn ControlPlane,
    options: &UploaderOptions,
    descriptor: &UploadDescriptor,
    file_name: &str,
) -> Result<(), UploadError> {
    let request = options.finish_request(FinishUpload::failed(descriptor.upload_id(), file_name));
    control_plane.finish(&request).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_control_plane_json() {
        let json = r#"{
            "uploadId": "up-1",
            "urls": ["https://bucket.s3.amazonaws.com/k?partNumber=1"],
            "createdAt": "2024-03-01T10:00:00Z"
        }"#;
        let descriptor = UploadDescriptor::from_json(json).unwrap();
        assert_eq!(descriptor.upload_id(), "up-1");
        assert_eq!(descriptor.target_urls().len(), 1);
        assert_eq!(descriptor.created_at().to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_descriptor_requires_urls() {
        let result = UploadDescriptor::from_json(r#"{"uploadId": "up-1", "urls": []}"#);
        assert!(matches!(result, Err(UploadError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_aborted_error_message() {
        let cause = UploadError::UnexpectedStatus {
            provider: Provider::Azure,
            operation: "put block",
            status: 500,
            expected: "201",
        };
        let cleanup = vec![UploadError::protocol(Provider::Azure, "abort rejected")];
        let error = UploadError::aborted(cause, cleanup);

        assert_eq!(
            error.to_string(),
            "Protocol violation: azure put block returned HTTP 500, expected 201 \
             (cleanup also failed: Protocol violation: azure: abort rejected)"
        );
        assert!(error.is_protocol_violation());
        assert!(!error.is_transport());
        assert_eq!(error.cleanup_failures().len(), 1);
    }

    #[test]
    fn test_aborted_without_cleanup_failure() {
        let error = UploadError::aborted(UploadError::InvalidDescriptor("x".into()), vec![]);
        assert_eq!(error.to_string(), "Invalid upload descriptor: x");
    }

    #[test]
    fn test_expected_parts_for_empty_file() {
        let reader = ChunkReader::new(10);
        assert_eq!(expected_parts(&reader, 0), 1);
        assert_eq!(expected_parts(&reader, 10), 1);
        assert_eq!(expected_parts(&reader, 11), 2);
    }

    #[test]
    fn test_provider_display() {
        assert_eq!(Provider::Google.to_string(), "google");
    }
}
