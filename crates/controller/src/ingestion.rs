//! Container image ingestion: gzip archive in, registry reference out

use crate::archive::{self, ArchiveImage};
use crate::docker::ContainerDaemon;
use crate::registry_client::{CredentialSource, RegistryClient};
use crate::storage::ImageStore;
use axum::body::Body;
use flate2::read::GzDecoder;
use futures::StreamExt;
use ops_common::image_ref::repository_name;
use ops_common::{Error, ImageReference, Result};
use std::fs::File;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// The only accepted upload content type
pub const GZIP_CONTENT_TYPE: &str = "application/gzip";

/// Default limit on the compressed upload (4 GiB)
pub const DEFAULT_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Loads an uploaded image, pushes it under a fresh tag and records it
pub struct IngestionPipeline {
    daemon: Arc<dyn ContainerDaemon>,
    registry: Arc<dyn RegistryClient>,
    images: Arc<dyn ImageStore>,
    credentials: CredentialSource,
    registry_prefix: String,
    scratch_dir: Option<PathBuf>,
    upload_limit: u64,
}

impl IngestionPipeline {
    pub fn new(
        daemon: Arc<dyn ContainerDaemon>,
        registry: Arc<dyn RegistryClient>,
        images: Arc<dyn ImageStore>,
        credentials: CredentialSource,
        registry_prefix: impl Into<String>,
    ) -> Self {
        Self {
            daemon,
            registry,
            images,
            credentials,
            registry_prefix: registry_prefix.into(),
            scratch_dir: None,
            upload_limit: DEFAULT_UPLOAD_LIMIT,
        }
    }

    /// Directory for uploads and archives; the system temp dir otherwise
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Largest compressed upload accepted, in bytes
    pub fn with_upload_limit(mut self, limit: u64) -> Self {
        self.upload_limit = limit;
        self
    }

    pub fn registry_prefix(&self) -> &str {
        &self.registry_prefix
    }

    /// Ingest one compressed `docker save` archive for `owner`
    pub async fn ingest(
        &self,
        owner: &str,
        content_type: Option<&str>,
        body: Body,
    ) -> Result<ImageReference> {
        if !is_gzip(content_type) {
            return Err(Error::UnsupportedMediaType {
                expected: GZIP_CONTENT_TYPE,
            });
        }

        // Fully received, decompressed and identified before the daemon sees a byte
        let upload = self.receive(body).await?;
        let archive = self.decompress(upload).await?;
        let image = self.inspect(archive.path()).await?;

        let name = image.name.as_deref().ok_or_else(|| {
            Error::InvalidArchive("image archive does not carry a repository name".to_string())
        })?;
        let reference = ImageReference::for_push(&self.registry_prefix, repository_name(name))?;
        let target = reference.to_string();

        self.daemon
            .load(archive.path())
            .await
            .map_err(|e| Error::infrastructure("Docker image load failed", format!("{:#}", e)))?;
        drop(archive);

        info!("Loaded image {} ({})", name, image.id);

        // The name may already point at another upload's image; only the id is ours
        if let Err(e) = self.daemon.tag(&image.id, &target).await {
            self.remove_best_effort(&image.id).await;
            return Err(Error::infrastructure("Docker image tag failed", format!("{:#}", e)));
        }

        let pushed = self.publish(&reference).await;
        self.remove_best_effort(&image.id).await;
        pushed?;

        self.images
            .record_image(&target, owner)
            .await
            .map_err(|e| Error::PushedButNotRecorded {
                fqin: target.clone(),
                reason: format!("{:#}", e),
            })?;

        info!("Successfully pushed image to registry: {}", target);
        Ok(reference)
    }

    /// Stream the request body to disk, enforcing the upload limit
    async fn receive(&self, body: Body) -> Result<NamedTempFile> {
        let upload = scratch_file(self.scratch_dir.as_deref(), "upload-", ".tar.gz")?;
        let file = upload
            .reopen()
            .map_err(|e| Error::infrastructure("Failed to open scratch file", e))?;
        let mut out = tokio::fs::File::from_std(file);

        let mut stream = body.into_data_stream();
        let mut received: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::InvalidRequest(format!("Failed to read upload: {}", e)))?;
            received += chunk.len() as u64;
            if received > self.upload_limit {
                return Err(Error::PayloadTooLarge {
                    limit: self.upload_limit,
                });
            }
            out.write_all(&chunk)
                .await
                .map_err(|e| Error::infrastructure("Failed to write upload", e))?;
        }
        out.flush()
            .await
            .map_err(|e| Error::infrastructure("Failed to write upload", e))?;

        debug!("Received {} byte upload", received);
        Ok(upload)
    }

    async fn decompress(&self, upload: NamedTempFile) -> Result<NamedTempFile> {
        let scratch_dir = self.scratch_dir.clone();

        tokio::task::spawn_blocking(move || {
            let mut file = scratch_file(scratch_dir.as_deref(), "image-", ".tar")?;

            let input = File::open(upload.path())
                .map_err(|e| Error::infrastructure("Failed to open upload", e))?;
            let mut decoder = GzDecoder::new(input);
            copy_decoded(&mut decoder, file.as_file_mut())?;
            file.as_file_mut()
                .flush()
                .map_err(|e| Error::infrastructure("Failed to write archive", e))?;

            Ok(file)
        })
        .await
        .map_err(|e| Error::infrastructure("Decompression task failed", e))?
    }

    async fn inspect(&self, archive: &Path) -> Result<ArchiveImage> {
        let path = archive.to_path_buf();

        tokio::task::spawn_blocking(move || archive::inspect(&path))
            .await
            .map_err(|e| Error::infrastructure("Archive inspection task failed", e))?
            .map_err(|e| Error::InvalidArchive(format!("{:#}", e)))
    }

    async fn publish(&self, reference: &ImageReference) -> Result<()> {
        let credentials = self
            .credentials
            .load()
            .await
            .map_err(|e| Error::infrastructure("Failed to read registry credentials", format!("{:#}", e)))?;

        let saved = scratch_file(self.scratch_dir.as_deref(), "push-", ".tar")?;

        self.daemon
            .save(&reference.to_string(), saved.path())
            .await
            .map_err(|e| {
                Error::infrastructure("Failed to read image from local Docker daemon", format!("{:#}", e))
            })?;

        self.registry
            .push(reference, saved.path(), &credentials)
            .await
            .map_err(|e| Error::infrastructure("Image push failed", format!("{:#}", e)))
    }

    async fn remove_best_effort(&self, reference: &str) {
        if let Err(e) = self.daemon.remove(reference).await {
            warn!("Failed to remove image {} from local Docker daemon: {:#}", reference, e);
        }
    }
}

fn scratch_file(dir: Option<&Path>, prefix: &str, suffix: &str) -> Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix).suffix(suffix);
    match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(|e| Error::infrastructure("Failed to create scratch file", e))
}

fn is_gzip(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|value| value.split(';').next())
        .map(|essence| essence.trim().eq_ignore_ascii_case(GZIP_CONTENT_TYPE))
        .unwrap_or(false)
}

/// Copy decoded bytes, telling corrupt input apart from local write failures
fn copy_decoded(decoder: &mut impl io::Read, out: &mut impl Write) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0usize;
    loop {
        let n = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::InvalidArchive(format!("invalid gzip data: {}", e)));
            }
        };
        out.write_all(&buf[..n])
            .map_err(|e| Error::infrastructure("Failed to write archive", e))?;
        total += n;
    }

    if total == 0 {
        return Err(Error::InvalidArchive("archive is empty".to_string()));
    }
    Ok(())
}
