//! Reading `docker save` archives without a daemon
//!
//! The id an image loads as is the digest of its config blob, so it can be
//! known before `docker load` runs. Acting on that id alone keeps concurrent
//! uploads that share a repository tag from touching each other's images.

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

pub const MANIFEST_PATH: &str = "manifest.json";

/// One image entry of an archive's `manifest.json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SaveManifestEntry {
    pub config: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    pub layers: Vec<String>,
}

/// The image an archive will load as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveImage {
    /// Content identifier (`sha256:...`)
    pub id: String,
    /// First repository tag, absent for archives saved by id
    pub name: Option<String>,
}

/// First manifest entry of an uncompressed archive
pub fn read_manifest(archive: &Path) -> Result<SaveManifestEntry> {
    let mut contents = None;
    for_entry(archive, MANIFEST_PATH, |entry| {
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        contents = Some(buf);
        Ok(())
    })?;

    let contents = contents.context("Image archive has no manifest.json")?;
    let entries: Vec<SaveManifestEntry> =
        serde_json::from_slice(&contents).context("Failed to parse manifest.json")?;
    entries
        .into_iter()
        .next()
        .context("Image archive manifest is empty")
}

/// Identify the image inside an uncompressed archive
pub fn inspect(archive: &Path) -> Result<ArchiveImage> {
    let manifest = read_manifest(archive)?;

    let mut digest = None;
    for_entry(archive, &manifest.config, |entry| {
        let mut hasher = Sha256::new();
        io::copy(entry, &mut hasher)?;
        digest = Some(hex::encode(hasher.finalize()));
        Ok(())
    })?;
    let digest = digest
        .with_context(|| format!("Image archive is missing its config {}", manifest.config))?;

    Ok(ArchiveImage {
        id: format!("sha256:{}", digest),
        name: manifest
            .repo_tags
            .and_then(|tags| tags.into_iter().find(|tag| !tag.trim().is_empty())),
    })
}

/// Run `visit` on the first entry stored at `path`
fn for_entry(
    archive: &Path,
    path: &str,
    mut visit: impl FnMut(&mut dyn Read) -> io::Result<()>,
) -> Result<()> {
    let wanted = normalize(path);
    let file = File::open(archive)
        .with_context(|| format!("Failed to open image archive {}", archive.display()))?;
    let mut tar = tar::Archive::new(file);

    for entry in tar.entries().context("Failed to read image archive")? {
        let mut entry = entry.context("Failed to read image archive")?;
        let name = entry.path().context("Invalid entry path")?.to_string_lossy().into_owned();
        if normalize(&name) == wanted {
            visit(&mut entry).with_context(|| format!("Failed to read {}", path))?;
            return Ok(());
        }
    }
    Ok(())
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./")
}
