//! Shared helpers for uploader integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use presign_uploadr::config::HttpConfig;
use presign_uploadr::control_plane::{ControlPlane, ControlPlaneError, FinishUpload};
use presign_uploadr::progress::ProgressTracker;
use presign_uploadr::upload::{build_http_client, UploaderOptions};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Control plane that records every finish call
#[derive(Default)]
pub struct RecordingControlPlane {
    calls: Mutex<Vec<FinishUpload>>,
    fail: bool,
}

impl RecordingControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every finish call is recorded, then rejected with HTTP 503
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn calls(&self) -> Vec<FinishUpload> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn finish(&self, request: &FinishUpload) -> Result<(), ControlPlaneError> {
        self.calls.lock().push(request.clone());
        if self.fail {
            return Err(ControlPlaneError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Temp file of `size` bytes with a position-dependent pattern
pub fn test_file(size: usize) -> (NamedTempFile, Vec<u8>) {
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&content).unwrap();
    file.flush().unwrap();
    (file, content)
}

pub fn http_client() -> reqwest::Client {
    build_http_client(&HttpConfig::default()).unwrap()
}

pub fn options(chunk_size: u64) -> UploaderOptions {
    UploaderOptions {
        chunk_size,
        stream_window: 64,
        output_dir: None,
    }
}

pub fn tracker(total: u64) -> Arc<ProgressTracker> {
    Arc::new(ProgressTracker::new(total, false))
}
