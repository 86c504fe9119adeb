//! Azure block blob upload through SAS URLs
//!
//! Every target URL carries `comp=block` and its own `blockid`. Blocks are
//! staged with one `PUT` each (`201 Created`), then committed by `PUT`ting a
//! `<BlockList>` to the commit URL derived from the first block URL.
//!
//! Aborting commits an empty block list: Azure garbage-collects staged blocks
//! that are not referenced by a commit, so no delete call is needed.

use super::{
    expected_parts, file_name_of, notify_failure, Provider, ProviderUploader,
    StreamingRequestBody, UploadDescriptor, UploadError, UploadReport, UploaderOptions,
};
use crate::control_plane::{ControlPlane, FinishUpload};
use crate::metrics;
use crate::progress::ProgressTracker;
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const BLOCK_ID_PARAM: &str = "blockid=";
const STAGE_BLOCK: &str = "comp=block";
const COMMIT_BLOCK_LIST: &str = "comp=blocklist";

/// Azure block blob uploader
pub struct AzureUploader {
    http: reqwest::Client,
    control_plane: Arc<dyn ControlPlane>,
    options: UploaderOptions,
}

impl AzureUploader {
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

    /// Stage every block, then commit them in upload order
    async fn transfer(
        &self,
        file: &Path,
        descriptor: &UploadDescriptor,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<(u64, u32), UploadError> {
        let reader = self.options.chunk_reader();
        let file_size = reader.file_size(file).await?;
        let urls = descriptor.target_urls();
        let expected = expected_parts(&reader, file_size);

        if urls.len() as u64 != expected {
            return Err(UploadError::InvalidDescriptor(format!(
                "{} block URLs issued for a file that needs {} blocks of at most {} bytes",
                urls.len(),
                expected,
                reader.chunk_size()
            )));
        }

        // Validate the whole descriptor before sending anything.
        let commit_url = commit_url(descriptor)?;
        let block_ids = urls
            .iter()
            .map(|url| block_id(url))
            .collect::<Result<Vec<_>, _>>()?;

        let mut uploaded = 0;
        for (index, url) in urls.iter().enumerate() {
            let chunk = reader.read_chunk(file, index as u64).await?;
            uploaded += chunk.len();
            self.stage_block(url, index, chunk.bytes, tracker).await?;
        }

        self.put_block_list(&commit_url, &block_ids, "commit block list")
            .await?;

        Ok((uploaded, urls.len() as u32 + 1))
    }

    #[tracing::instrument(
        name = "upload.azure.block",
        skip(self, url, body, tracker),
        fields(upload.bytes = body.len(), http.status_code = tracing::field::Empty),
        err
    )]
    async fn stage_block(
        &self,
        url: &str,
        index: usize,
        body: bytes::Bytes,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<(), UploadError> {
        let body = StreamingRequestBody::new(body, self.options.stream_window, tracker.clone());

        let response = self
            .http
            .put(url)
            .header(CONTENT_LENGTH, body.content_length())
            .body(body.into_body())
            .send()
            .await
            .map_err(UploadError::transport("put block"))?;

        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());
        metrics::record_request(Provider::Azure, "put_block", status.as_u16());

        if status != StatusCode::CREATED {
            return Err(UploadError::UnexpectedStatus {
                provider: Provider::Azure,
                operation: "put block",
                status: status.as_u16(),
                expected: "201",
            });
        }
        Ok(())
    }

    async fn put_block_list(
        &self,
        commit_url: &str,
        block_ids: &[String],
        operation: &'static str,
    ) -> Result<(), UploadError> {
        let body = block_list_xml(block_ids)?;

        let response = self
            .http
            .put(commit_url)
            .header(CONTENT_TYPE, "application/xml")
            .header(CONTENT_LENGTH, body.len())
            .body(body)
            .send()
            .await
            .map_err(UploadError::transport(operation))?;

        let status = response.status();
        metrics::record_request(Provider::Azure, "put_block_list", status.as_u16());

        if status != StatusCode::CREATED {
            return Err(UploadError::UnexpectedStatus {
                provider: Provider::Azure,
                operation,
                status: status.as_u16(),
                expected: "201",
            });
        }

        tracing::debug!(blocks = block_ids.len(), operation = operation, "Block list accepted");
        Ok(())
    }

    /// Abort the blob, then tell the control plane; both failures are kept
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
            "Azure upload failed, discarding staged blocks"
        );
        metrics::record_upload_failure(Provider::Azure);

        let mut cleanup = Vec::new();
        if let Err(e) = self.abort_upload(file, descriptor).await {
            tracing::warn!(error = %e, "Failed to discard staged blocks");
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
impl ProviderUploader for AzureUploader {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    #[tracing::instrument(
        name = "upload.azure",
        skip(self, file, descriptor, tracker),
        fields(
            upload.id = %descriptor.upload_id(),
            upload.blocks = descriptor.target_urls().len(),
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

        let (uploaded, requests) = match self.transfer(file, descriptor, &tracker).await {
            Ok(result) => result,
            Err(e) => return Err(self.fail(file, descriptor, &file_name, e).await),
        };

        // The blob is committed; a control plane failure here cannot be
        // rolled back on the storage side, so it is reported directly.
        let request = self.options.finish_request(FinishUpload::completed(
            descriptor.upload_id(),
            file_name,
            Vec::new(),
        ));
        self.control_plane.finish(&request).await?;

        let duration = started.elapsed();
        metrics::record_upload_success(Provider::Azure, uploaded, duration.as_secs_f64());
        tracing::info!(
            blocks = descriptor.target_urls().len(),
            bytes = uploaded,
            duration_ms = duration.as_millis(),
            "Azure block blob upload completed"
        );

        Ok(UploadReport {
            provider: Provider::Azure,
            upload_id: descriptor.upload_id().to_string(),
            bytes_uploaded: uploaded,
            requests,
            parts: Vec::new(),
            duration,
        })
    }

    /// Commit an empty block list so staged blocks are discarded
    async fn abort_upload(
        &self,
        _file: &Path,
        descriptor: &UploadDescriptor,
    ) -> Result<(), UploadError> {
        let result = match commit_url(descriptor) {
            Ok(url) => self.put_block_list(&url, &[], "abort block list").await,
            Err(e) => Err(e),
        };
        metrics::record_abort(Provider::Azure, result.is_ok());
        result
    }
}

/// Commit URL: the first block URL without its `blockid` and with
/// `comp=blocklist` instead of `comp=block`
///
/// The query is rewritten textually so the SAS signature keeps its exact
/// encoding.
pub fn commit_url(descriptor: &UploadDescriptor) -> Result<String, UploadError> {
    let first = descriptor
        .target_urls()
        .first()
        .ok_or_else(|| UploadError::InvalidDescriptor("no block URLs were issued".into()))?;

    let (base, query) = first.split_once('?').ok_or_else(|| {
        UploadError::InvalidDescriptor(format!("block URL has no query string: {}", first))
    })?;

    let mut staged = false;
    let params: Vec<&str> = query
        .split('&')
        .filter(|param| !param.starts_with(BLOCK_ID_PARAM))
        .map(|param| {
            if param == STAGE_BLOCK {
                staged = true;
                COMMIT_BLOCK_LIST
            } else {
                param
            }
        })
        .collect();

    if !staged {
        return Err(UploadError::InvalidDescriptor(format!(
            "block URL is missing '{}': {}",
            STAGE_BLOCK, first
        )));
    }

    Ok(format!("{}?{}", base, params.join("&")))
}

/// Decoded `blockid` query value of a block URL
pub fn block_id(url: &str) -> Result<String, UploadError> {
    let query = url.split_once('?').map(|(_, query)| query).unwrap_or_default();
    let raw = query
        .split('&')
        .find_map(|param| param.strip_prefix(BLOCK_ID_PARAM))
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            UploadError::InvalidDescriptor(format!("block URL has no blockid: {}", url))
        })?;

    percent_decode_str(raw)
        .decode_utf8()
        .map(|id| id.into_owned())
        .map_err(|e| UploadError::InvalidDescriptor(format!("blockid is not UTF-8: {}", e)))
}

/// `<?xml ...?><BlockList><Uncommitted>id</Uncommitted>...</BlockList>`
pub fn block_list_xml(block_ids: &[String]) -> Result<String, UploadError> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("BlockList")))
        .map_err(xml_error)?;
    for id in block_ids {
        writer
            .write_event(Event::Start(BytesStart::new("Uncommitted")))
            .map_err(xml_error)?;
        writer
            .write_event(Event::Text(BytesText::new(id)))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesEnd::new("Uncommitted")))
            .map_err(xml_error)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("BlockList")))
        .map_err(xml_error)?;

    String::from_utf8(writer.into_inner()).map_err(xml_error)
}

fn xml_error(e: impl std::fmt::Display) -> UploadError {
    UploadError::protocol(Provider::Azure, format!("cannot encode block list: {}", e))
}
