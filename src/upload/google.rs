//! Google Cloud Storage resumable upload
//!
//! One session URL receives successive `PUT`s, each carrying a
//! `Content-Range` window. `308 Resume Incomplete` answers with a `Range`
//! header naming the last byte the server persisted, which may be short of
//! what was sent; the next window starts right after it. `200`/`201` ends
//! the session. Aborting is a `DELETE` of the session URL.
//!
//! Progress counts each byte once, the first time it is streamed; a range
//! re-sent after a short `308` does not advance the tracker again.

use super::{
    file_name_of, notify_failure, Provider, ProviderUploader, StreamingRequestBody,
    UploadDescriptor, UploadError, UploadReport, UploaderOptions,
};
use crate::control_plane::{ControlPlane, FinishUpload};
use crate::metrics;
use crate::progress::ProgressTracker;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// 308 Resume Incomplete
const RESUME_INCOMPLETE: u16 = 308;

/// Status Google answers to a successful session cancellation
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Outcome of one `PUT` to the session
#[derive(Debug, PartialEq, Eq)]
enum SessionState {
    Complete,
    /// Resume from this byte offset
    Incomplete(u64),
}

/// Google resumable uploader
pub struct GoogleUploader {
    http: reqwest::Client,
    control_plane: Arc<dyn ControlPlane>,
    options: UploaderOptions,
}

impl GoogleUploader {
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

    /// Send windows until the session reports completion
    async fn transfer(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<(u64, u32), UploadError> {
        let session_url = session_url(descriptor)?;
        let reader = self.options.chunk_reader();
        let file_size = reader.file_size(file).await?;
        let mut requests = 0;

        if file_size == 0 {
            requests += 1;
            let state = self
                .put_range(session_url, bytes::Bytes::new(), "bytes */0", 0, tracker)
                .await?;
            return match state {
                SessionState::Complete => Ok((0, requests)),
                SessionState::Incomplete(_) => Err(UploadError::protocol(
                    Provider::Google,
                    "session did not complete after an empty upload",
                )),
            };
        }

        let mut next_byte: u64 = 0;
        // Highest offset already reported to the tracker; bytes below it are
        // re-sent after a short 308 and must not be counted twice.
        let mut counted_up_to: u64 = 0;
        while next_byte < file_size {
            let chunk = reader.read_from(file, next_byte).await?;
            let chunk_end = next_byte + chunk.len();
            let content_range = format!("bytes {}-{}/{}", next_byte, chunk_end - 1, file_size);
            let already_counted = counted_up_to.saturating_sub(next_byte).min(chunk.len());
            counted_up_to = counted_up_to.max(chunk_end);

            requests += 1;
            match self
                .put_range(
                    session_url,
                    chunk.bytes,
                    &content_range,
                    already_counted,
                    tracker,
                )
                .await?
            {
                SessionState::Complete => return Ok((file_size, requests)),
                SessionState::Incomplete(resume_at) => {
                    if resume_at <= next_byte {
                        return Err(UploadError::protocol(
                            Provider::Google,
                            format!(
                                "session made no progress: resume offset {} after sending {}",
                                resume_at, content_range
                            ),
                        ));
                    }
                    tracing::debug!(
                        sent = %content_range,
                        resume_at = resume_at,
                        "Resume incomplete"
                    );
                    next_byte = resume_at;
                }
            }
        }

        // Every byte is persisted but the session is still open: ask for its
        // final status.
        requests += 1;
        let status_range = format!("bytes */{}", file_size);
        match self
            .put_range(session_url, bytes::Bytes::new(), &status_range, 0, tracker)
            .await?
        {
            SessionState::Complete => Ok((file_size, requests)),
            SessionState::Incomplete(_) => Err(UploadError::protocol(
                Provider::Google,
                "all bytes were persisted but the session never completed",
            )),
        }
    }

    #[tracing::instrument(
        name = "upload.google.range",
        skip(self, url, body, tracker),
        fields(upload.bytes = body.len(), http.status_code = tracing::field::Empty),
        err
    )]
    async fn put_range(
        &self,
        url: &str,
        body: bytes::Bytes,
        content_range: &str,
        already_counted: u64,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<SessionState, UploadError> {
        let body = StreamingRequestBody::resend(
            body,
            self.options.stream_window,
            tracker.clone(),
            already_counted,
        );

        let response = self
            .http
            .put(url)
            .header(CONTENT_LENGTH, body.content_length())
            .header(CONTENT_RANGE, content_range)
            .body(body.into_body())
            .send()
            .await
            .map_err(UploadError::transport("put range"))?;

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());
        metrics::record_request(Provider::Google, "put_range", status.as_u16());

        match status.as_u16() {
            200 | 201 => Ok(SessionState::Complete),
            RESUME_INCOMPLETE => Ok(SessionState::Incomplete(resume_offset(response.headers())?)),
            other => Err(UploadError::UnexpectedStatus {
                provider: Provider::Google,
                operation: "put range",
                status: other,
                expected: "200, 201 or 308",
            }),
        }
    }

    /// Cancel the session, then tell the control plane; both failures are kept
    async fn fail(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
        file_name: &str,
        cause: UploadError,
    ) -> UploadError {
        tracing::error!(
            upload_id = %descriptor.upload_id(),
            error = %cause,
            "Google upload failed, cancelling session"
        );
        metrics::record_upload_failure(Provider::Google);

        let mut cleanup = Vec::new();
        if let Err(e) = self.abort_upload(file, descriptor).await {
            tracing::warn!(error = %e, "Failed to cancel resumable session");
            cleanup.push(e);
        }
        if let Err(e) =
            notify_failure(self.control_plane.as_ref(), &self.options, descriptor, file_name).await
        {
            tracing::warn!(error = %e, "Failed to report upload failure to control plane");
            cleanup.push(e);
        }
        UploadError::aborted(cause, cleanup)
    }
}

#[async_trait]
impl ProviderUploader for GoogleUploader {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    #[tracing::instrument(
        name = "upload.google",
        skip(self, file, descriptor, tracker),
        fields(upload.id = %descriptor.upload_id(), upload.file = %file.display()),
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

        let (uploaded, requests) = match self.transfer(file, descriptor, &tracker).await {
            Ok(result) => result,
            Err(e) => return Err(self.fail(file, descriptor, &file_name, e).await),
        };

        // The object exists once the session completes; only report it.
        let request = self.options.finish_request(FinishUpload::completed(
            descriptor.upload_id(),
            file_name,
            Vec::new(),
        ));
        self.control_plane.finish(&request).await?;

        let duration = started.elapsed();
        metrics::record_upload_success(Provider::Google, uploaded, duration.as_secs_f64());
        tracing::info!(
            requests = requests,
            bytes = uploaded,
            duration_ms = duration.as_millis(),
            "Google resumable upload completed"
        );

        Ok(UploadReport {
            provider: Provider::Google,
            upload_id: descriptor.upload_id().to_string(),
            bytes_uploaded: uploaded,
            requests,
            parts: Vec::new(),
            duration,
        })
    }

    /// Cancel the resumable session
    async fn abort_upload(
        &self,
        _file: &Path,
        descriptor: &UploadDescriptor,
    ) -> Result<(), UploadError> {
        let result = self.delete_session(descriptor).await;
        metrics::record_abort(Provider::Google, result.is_ok());
        result
    }
}

impl GoogleUploader {
    async fn delete_session(&self, descriptor: &UploadDescriptor) -> Result<(), UploadError> {
        let url = session_url(descriptor)?;
        let response = self
            .http
            .delete(url)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(UploadError::transport("cancel session"))?;

        let status = response.status();
        metrics::record_request(Provider::Google, "cancel_session", status.as_u16());

        // A session that is already gone needs no further cleanup.
        if status.is_success()
            || status.as_u16() == CLIENT_CLOSED_REQUEST
            || status == StatusCode::NOT_FOUND
            || status == StatusCode::GONE
        {
            return Ok(());
        }

        Err(UploadError::UnexpectedStatus {
            provider: Provider::Google,
            operation: "cancel session",
            status: status.as_u16(),
            expected: "499",
        })
    }
}

/// The single session URL of a resumable upload
fn session_url(descriptor: &UploadDescriptor) -> Result<&str, UploadError> {
    match descriptor.target_urls() {
        [url] => Ok(url.as_str()),
        urls => Err(UploadError::InvalidDescriptor(format!(
            "a resumable upload needs exactly one session URL, got {}",
            urls.len()
        ))),
    }
}

/// Next byte to send after a 308, from `Range: bytes=0-N`
///
/// A 308 without `Range` means the server has persisted nothing yet.
fn resume_offset(headers: &HeaderMap) -> Result<u64, UploadError> {
    let Some(value) = headers.get(RANGE) else {
        return Ok(0);
    };

    let invalid = || {
        UploadError::protocol(
            Provider::Google,
            format!("malformed Range header in 308 response: {:?}", value),
        )
    };

    let range = value.to_str().map_err(|_| invalid())?;
    let last_byte = range
        .trim()
        .strip_prefix("bytes=")
        .and_then(|r| r.split_once('-'))
        .and_then(|(_, end)| end.trim().parse::<u64>().ok())
        .ok_or_else(invalid)?;

    last_byte.checked_add(1).ok_or_else(invalid)
}
