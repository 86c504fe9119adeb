//! Presign Uploadr Library
//!
//! Chunked uploads of large local files to object storage through pre-signed
//! URLs issued by a control plane. No storage credentials are ever held
//! locally.
//!
//! # Features
//!
//! - **S3 multipart**: one `PUT` per part URL, `ETag`s reported to the control plane
//! - **Azure block blob**: staged blocks committed with a block list
//! - **Google resumable**: `Content-Range` windows on one session URL
//! - **Bounded memory**: one chunk in memory, streamed in small windows
//! - **Clean failure**: every failed upload is aborted exactly once
//!
//! # Example
//!
//! ```no_run
//! use presign_uploadr::config::HttpConfig;
//! use presign_uploadr::control_plane::NoopControlPlane;
//! use presign_uploadr::progress::ProgressTracker;
//! use presign_uploadr::upload::{
//!     build_http_client, Provider, ProviderUploader, UploadDescriptor, Uploader,
//!     UploaderOptions,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let descriptor = UploadDescriptor::from_json(&std::fs::read_to_string("descriptor.json")?)?;
//!     let file = Path::new("reads.fastq.gz");
//!     let tracker = Arc::new(ProgressTracker::new(std::fs::metadata(file)?.len(), true));
//!
//!     let uploader = Uploader::for_provider(
//!         Provider::S3,
//!         build_http_client(&HttpConfig::default())?,
//!         Arc::new(NoopControlPlane),
//!         UploaderOptions::default(),
//!     );
//!     let report = uploader.upload_file(file, &descriptor, tracker).await?;
//!     println!("uploaded {} bytes", report.bytes_uploaded);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control_plane;
pub mod logging;
pub mod metrics;
pub mod progress;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use progress::ProgressTracker;
pub use upload::{Provider, ProviderUploader, UploadDescriptor, UploadError, Uploader};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
