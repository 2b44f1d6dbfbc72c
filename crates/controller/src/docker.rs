//! Local container daemon access through the docker CLI

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait ContainerDaemon: Send + Sync {
    /// Load an uncompressed `docker save` archive
    async fn load(&self, archive: &Path) -> Result<()>;

    /// Add `target` as a tag of `source` (an id or reference)
    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    async fn remove(&self, reference: &str) -> Result<()>;

    /// Write the image back out as an uncompressed archive
    async fn save(&self, reference: &str, dest: &Path) -> Result<()>;
}

/// [`ContainerDaemon`] driving the `docker` executable
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("docker {}", args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("docker {} failed: {}", args[0], stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerDaemon for DockerCli {
    async fn load(&self, archive: &Path) -> Result<()> {
        let archive = archive.to_string_lossy();
        self.run(&["load", "-q", "-i", &*archive])
            .await
            .context("Failed to load image")?;
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run(&["tag", source, target])
            .await
            .context("Failed to tag image")?;
        Ok(())
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        self.run(&["rmi", "-f", reference])
            .await
            .context("Failed to remove image")?;
        Ok(())
    }

    async fn save(&self, reference: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run(&["save", "-o", &*dest, reference])
            .await
            .context("Failed to save image")?;
        Ok(())
    }
}
