//! Control plane collaborator
//!
//! The control plane issues upload descriptors and is told how each upload
//! ended. Only the *finish* call is made from this crate: with part tags on
//! success, or with `withError = true` and no tags when the upload is
//! abandoned.
//!
//! # Example
//!
//! ```no_run
//! use presign_uploadr::control_plane::{ControlPlane, FinishUpload, HttpControlPlane};
//! use presign_uploadr::upload::PartResult;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let control_plane = HttpControlPlane::builder()
//!     .endpoint("https://api.example.com")
//!     .token("my-token")
//!     .build()?;
//!
//! let request = FinishUpload::completed(
//!     "upload-123",
//!     "reads.fastq.gz",
//!     vec![PartResult::new(1, "\"etag-1\"")],
//! );
//! control_plane.finish(&request).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ControlPlaneConfig;
use crate::upload::PartResult;
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Characters escaped inside a URL path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/');

/// Same as [`PATH_SEGMENT`] but keeps `/` so nested directories stay nested
const PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Default timeout for control plane requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Control plane errors
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Control plane returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Finish call for one upload
///
/// `output_dir` selects the nested-directory variant of the call; it is part
/// of the request path rather than the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishUpload {
    pub upload_id: String,
    pub file_name: String,
    pub with_error: bool,
    pub tags: Vec<PartResult>,
    #[serde(skip)]
    pub output_dir: Option<String>,
}

impl FinishUpload {
    /// Report a successful upload with its ordered part tags
    pub fn completed(
        upload_id: impl Into<String>,
        file_name: impl Into<String>,
        tags: Vec<PartResult>,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            file_name: file_name.into(),
            with_error: false,
            tags,
            output_dir: None,
        }
    }

    /// Report an abandoned upload; never carries tags
    pub fn failed(upload_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            file_name: file_name.into(),
            with_error: true,
            tags: Vec::new(),
            output_dir: None,
        }
    }

    /// Target a nested output directory instead of the dataset root
    pub fn with_output_dir(mut self, output_dir: Option<String>) -> Self {
        self.output_dir = output_dir.filter(|dir| !dir.trim_matches('/').is_empty());
        self
    }
}

/// Control plane trait
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Close out an upload session, successfully or with error
    async fn finish(&self, request: &FinishUpload) -> Result<(), ControlPlaneError>;
}

/// Control plane that only logs; for standalone uploads without a backend
pub struct NoopControlPlane;

#[async_trait]
impl ControlPlane for NoopControlPlane {
    async fn finish(&self, request: &FinishUpload) -> Result<(), ControlPlaneError> {
        tracing::info!(
            upload_id = %request.upload_id,
            file_name = %request.file_name,
            with_error = request.with_error,
            tags = request.tags.len(),
            "No control plane configured, skipping finish call"
        );
        Ok(())
    }
}

/// REST control plane client
pub struct HttpControlPlane {
    endpoint: String,
    token: Option<String>,
    workspace_id: Option<String>,
    client: reqwest::Client,
}

/// Builder for HttpControlPlane
#[derive(Default)]
pub struct HttpControlPlaneBuilder {
    endpoint: Option<String>,
    token: Option<String>,
    workspace_id: Option<String>,
    timeout: Option<Duration>,
}

impl HttpControlPlaneBuilder {
    /// Set the API base URL
    pub fn endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    /// Set the bearer token
    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Scope requests to a workspace
    pub fn workspace_id(mut self, workspace_id: &str) -> Self {
        self.workspace_id = Some(workspace_id.to_string());
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the HttpControlPlane
    pub fn build(self) -> Result<HttpControlPlane, ControlPlaneError> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| ControlPlaneError::ConfigError("endpoint is required".into()))?;
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ControlPlaneError::ConfigError(format!(
                "endpoint '{}' must start with http:// or https://",
                endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()?;

        Ok(HttpControlPlane {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: self.token,
            workspace_id: self.workspace_id,
            client,
        })
    }
}

impl HttpControlPlane {
    /// Create a new builder for HttpControlPlane
    pub fn builder() -> HttpControlPlaneBuilder {
        HttpControlPlaneBuilder::default()
    }

    /// Build from the `control_plane` configuration section
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let mut builder = Self::builder().endpoint(&config.endpoint);
        if let Some(ref token) = config.token {
            builder = builder.token(token);
        }
        if let Some(ref workspace_id) = config.workspace_id {
            builder = builder.workspace_id(workspace_id);
        }
        builder.build()
    }

    /// URL of the finish call; the nested variant appends the output directory
    pub fn finish_url(&self, request: &FinishUpload) -> String {
        let upload_id = utf8_percent_encode(&request.upload_id, PATH_SEGMENT);
        match request.output_dir {
            Some(ref dir) => format!(
                "{}/uploads/{}/finish/{}",
                self.endpoint,
                upload_id,
                utf8_percent_encode(dir.trim_matches('/'), PATH)
            ),
            None => format!("{}/uploads/{}/finish", self.endpoint, upload_id),
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    #[tracing::instrument(
        name = "control_plane.finish",
        skip(self, request),
        fields(
            upload.id = %request.upload_id,
            upload.with_error = request.with_error,
            upload.tags = request.tags.len(),
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn finish(&self, request: &FinishUpload) -> Result<(), ControlPlaneError> {
        let mut builder = self.client.post(self.finish_url(request)).json(request);
        if let Some(ref workspace_id) = self.workspace_id {
            builder = builder.query(&[("workspaceId", workspace_id)]);
        }
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(file_name = %request.file_name, "Finish call accepted");
        Ok(())
    }
}
