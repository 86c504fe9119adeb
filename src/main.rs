//! Presign Uploadr - chunked uploads through pre-signed URLs
//!
//! Uploads one local file using a descriptor issued by the control plane.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use presign_uploadr::config::ConfigLoader;
use presign_uploadr::control_plane::{ControlPlane, HttpControlPlane, NoopControlPlane};
use presign_uploadr::upload::{build_http_client, UploaderOptions};
use presign_uploadr::{
    logging, metrics, Config, ProgressTracker, Provider, ProviderUploader, UploadDescriptor,
    Uploader,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Presign Uploadr - upload large files to S3, Azure or Google through pre-signed URLs
#[derive(Parser, Debug)]
#[command(name = "presign-uploadr")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "presign-uploadr.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file
    Upload {
        #[command(flatten)]
        target: Target,

        /// Nested output directory reported to the control plane
        #[arg(long)]
        output_dir: Option<String>,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Abort an incomplete upload
    Abort {
        #[command(flatten)]
        target: Target,

        /// Nested output directory the upload was started with
        #[arg(long)]
        output_dir: Option<String>,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Storage provider that issued the URLs
    #[arg(short, long, value_enum)]
    provider: Provider,

    /// Descriptor JSON returned by the control plane
    #[arg(short, long)]
    descriptor: PathBuf,

    /// File to upload
    file: PathBuf,
}

impl Target {
    /// The control plane identifies the upload by file name, so the path
    /// must end in one before any request is made
    fn validate(&self) -> anyhow::Result<()> {
        if self.file.file_name().is_none() {
            anyhow::bail!("{:?} has no file name", self.file);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    logging::init_subscriber(&config.logging, cli.log_level.as_deref())?;

    info!("Starting Presign Uploadr v{}", presign_uploadr::VERSION);

    let result = match cli.command {
        Command::Upload {
            target,
            output_dir,
            no_progress,
        } => upload(&config, target, output_dir, no_progress).await,
        Command::Abort { target, output_dir } => abort(&config, target, output_dir).await,
    };

    if config.metrics.enabled {
        if let Some(path) = &config.metrics.textfile {
            if let Err(e) = metrics::write_textfile(Path::new(path)) {
                tracing::warn!(path = %path, error = %e, "Failed to write metrics textfile");
            }
        }
    }

    result
}

async fn upload(
    config: &Config,
    target: Target,
    output_dir: Option<String>,
    no_progress: bool,
) -> anyhow::Result<()> {
    target.validate()?;
    let descriptor = read_descriptor(&target.descriptor)?;
    let file_size = tokio::fs::metadata(&target.file)
        .await
        .with_context(|| format!("Failed to stat {:?}", target.file))?
        .len();

    let show_progress = config.upload.show_progress && !no_progress;
    let tracker = Arc::new(ProgressTracker::new(file_size, show_progress));
    let options = UploaderOptions::from_config(&config.upload).with_output_dir(output_dir);
    let uploader = build_uploader(config, target.provider, options)?;

    info!(
        provider = %target.provider,
        upload_id = %descriptor.upload_id(),
        file = %target.file.display(),
        bytes = file_size,
        "Uploading file"
    );

    let report = uploader
        .upload_file(&target.file, &descriptor, tracker)
        .await?;

    println!(
        "Uploaded {} bytes to {} in {} requests ({:.1}s)",
        report.bytes_uploaded,
        report.provider,
        report.requests,
        report.duration.as_secs_f64()
    );
    Ok(())
}

async fn abort(config: &Config, target: Target, output_dir: Option<String>) -> anyhow::Result<()> {
    target.validate()?;
    let descriptor = read_descriptor(&target.descriptor)?;
    let options = UploaderOptions::from_config(&config.upload).with_output_dir(output_dir);
    let uploader = build_uploader(config, target.provider, options)?;

    uploader.abort_upload(&target.file, &descriptor).await?;
    info!(upload_id = %descriptor.upload_id(), "Upload aborted");
    Ok(())
}

fn read_descriptor(path: &Path) -> anyhow::Result<UploadDescriptor> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read descriptor {:?}", path))?;
    Ok(UploadDescriptor::from_json(&json)?)
}

fn build_uploader(
    config: &Config,
    provider: Provider,
    options: UploaderOptions,
) -> anyhow::Result<Uploader> {
    let control_plane: Arc<dyn ControlPlane> = match &config.control_plane {
        Some(control_plane) => Arc::new(HttpControlPlane::from_config(control_plane)?),
        None => {
            tracing::warn!("No control plane configured, finish calls will only be logged");
            Arc::new(NoopControlPlane)
        }
    };
    let http = build_http_client(&config.http)?;
    Ok(Uploader::for_provider(provider, http, control_plane, options))
}
