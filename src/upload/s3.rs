//! S3-style multipart upload through pre-signed part URLs
//!
//! Each target URL receives one `PUT` with the raw bytes of the matching
//! chunk and must answer `200` with an `ETag`. The ordered tags are handed to
//! the control plane, which completes (or abandons) the multipart upload on
//! the storage side. There is no storage-side abort call.

use super::{
    expected_parts, file_name_of, PartResult, Provider, ProviderUploader, StreamingRequestBody,
    UploadDescriptor, UploadError, UploadReport, UploaderOptions,
};
use crate::control_plane::{ControlPlane, FinishUpload};
use crate::metrics;
use crate::progress::ProgressTracker;
use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// S3 multipart uploader
pub struct S3Uploader {
    http: reqwest::Client,
    control_plane: Arc<dyn ControlPlane>,
    options: UploaderOptions,
}

impl S3Uploader {
    pub fn new(
        http: reqwest::Client,
        control_plane: Arc<dyn ControlPlane>,
        options: UploaderOptions,
    ) -> Self {
        Self {
            http,
            control_plane,
            options,
        }
    }

    /// Upload every part in order; stops at the first failure
    async fn transfer(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<(Vec<PartResult>, u64), UploadError> {
        let reader = self.options.chunk_reader();
        let file_size = reader.file_size(file).await?;
        let urls = descriptor.target_urls();
        let expected = expected_parts(&reader, file_size);

        if urls.len() as u64 != expected {
            return Err(UploadError::InvalidDescriptor(format!(
                "{} part URLs issued for a file that needs {} parts of at most {} bytes",
                urls.len(),
                expected,
                reader.chunk_size()
            )));
        }

        let mut parts = Vec::with_capacity(urls.len());
        let mut uploaded = 0;
        for (index, url) in urls.iter().enumerate() {
            let chunk = reader.read_chunk(file, index as u64).await?;
            let part_number = (index + 1) as u32;
            let part = self.upload_part(url, part_number, chunk.bytes, tracker).await?;
            uploaded += part.len;
            parts.push(PartResult::new(part_number, part.tag));
        }

        parts.sort_by_key(|part| part.part_number);
        Ok((parts, uploaded))
    }

    #[tracing::instrument(
        name = "upload.s3.part",
        skip(self, url, body, tracker),
        fields(
            upload.part_number = part_number,
            upload.bytes = body.len(),
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn upload_part(
        &self,
        url: &str,
        part_number: u32,
        body: bytes::Bytes,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<UploadedPart, UploadError> {
        let body = StreamingRequestBody::new(body, self.options.stream_window, tracker.clone());
        let len = body.content_length();

        let response = self
            .http
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(body.into_body())
            .send()
            .await
            .map_err(UploadError::transport("upload part"))?;

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());
        metrics::record_request(Provider::S3, "upload_part", status.as_u16());

        if status != StatusCode::OK {
            return Err(UploadError::UnexpectedStatus {
                provider: Provider::S3,
                operation: "upload part",
                status: status.as_u16(),
                expected: "200",
            });
        }

        let tag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                UploadError::protocol(
                    Provider::S3,
                    format!(
                        "part {} was accepted without an ETag header; \
                         the bucket CORS configuration must expose ETag",
                        part_number
                    ),
                )
            })?;

        tracing::debug!(part_number = part_number, etag = %tag, "Uploaded part");
        Ok(UploadedPart { tag, len })
    }

    /// Abort, then wrap the original failure
    async fn fail(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
        cause: UploadError,
    ) -> UploadError {
        tracing::error!(
            upload_id = %descriptor.upload_id(),
            error = %cause,
            "S3 upload failed, abandoning multipart upload"
        );
        metrics::record_upload_failure(Provider::S3);

        let mut cleanup = Vec::new();
        if let Err(e) = self.abort_upload(file, descriptor).await {
            tracing::warn!(error = %e, "Failed to abandon multipart upload");
            cleanup.push(e);
        }
        UploadError::aborted(cause, cleanup)
    }
}

struct UploadedPart {
    tag: String,
    len: u64,
}

#[async_trait]
impl ProviderUploader for S3Uploader {
    fn provider(&self) -> Provider {
        Provider::S3
    }

    #[tracing::instrument(
        name = "upload.s3",
        skip(self, file, descriptor, tracker),
        fields(
            upload.id = %descriptor.upload_id(),
            upload.parts = descriptor.target_urls().len(),
            upload.file = %file.display()
        ),
        err
    )]
    async fn upload_file(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
        tracker: Arc<ProgressTracker>,
    ) -> Result<UploadReport, UploadError> {
        let started = Instant::now();
        let file_name = file_name_of(file)?;

        let (parts, uploaded) = match self.transfer(file, descriptor, &tracker).await {
            Ok(result) => result,
            Err(e) => return Err(self.fail(file, descriptor, e).await),
        };

        let request = self.options.finish_request(FinishUpload::completed(
            descriptor.upload_id(),
            file_name,
            parts.clone(),
        ));
        if let Err(e) = self.control_plane.finish(&request).await {
            return Err(self.fail(file, descriptor, e.into()).await);
        }

        let duration = started.elapsed();
        metrics::record_upload_success(Provider::S3, uploaded, duration.as_secs_f64());
        tracing::info!(
            parts = parts.len(),
            bytes = uploaded,
            duration_ms = duration.as_millis(),
            "S3 multipart upload completed"
        );

        Ok(UploadReport {
            provider: Provider::S3,
            upload_id: descriptor.upload_id().to_string(),
            bytes_uploaded: uploaded,
            requests: parts.len() as u32,
            parts,
            duration,
        })
    }

    /// Tell the control plane to abandon the multipart upload
    async fn abort_upload(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
    ) -> Result<(), UploadError> {
        let file_name = file_name_of(file)?;
        let result =
            super::notify_failure(self.control_plane.as_ref(), &self.options, descriptor, &file_name)
                .await;
        metrics::record_abort(Provider::S3, result.is_ok());
        result
    }
}
