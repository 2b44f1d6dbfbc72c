//! Pushing `docker save` archives to a remote registry over the distribution API

use crate::secrets::SecretStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use ops_common::ImageReference;
use reqwest::header::{CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// Username paired with a service-account key as the password
pub const KEY_USERNAME: &str = "_json_key";

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Basic credentials for the registry
#[derive(Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

impl RegistryCredentials {
    pub fn service_account_key(key_json: impl Into<String>) -> Self {
        Self {
            username: KEY_USERNAME.to_string(),
            password: key_json.into(),
        }
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where the service-account key comes from
#[derive(Clone)]
pub enum CredentialSource {
    KeyFile(PathBuf),
    Secret {
        store: Arc<dyn SecretStore>,
        path: String,
    },
}

impl CredentialSource {
    pub async fn load(&self) -> Result<RegistryCredentials> {
        let key = match self {
            CredentialSource::KeyFile(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read registry key file {}", path.display()))?,
            CredentialSource::Secret { store, path } => store
                .get(path)
                .await
                .context("Failed to read registry key secret")?,
        };

        Ok(RegistryCredentials::service_account_key(key.trim()))
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Push the image in an uncompressed `docker save` archive as `reference`
    async fn push(
        &self,
        reference: &ImageReference,
        archive: &Path,
        credentials: &RegistryCredentials,
    ) -> Result<()>;
}

/// [`RegistryClient`] speaking the registry HTTP API directly
pub struct OciRegistryClient {
    client: reqwest::Client,
}

impl Default for OciRegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OciRegistryClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Hit `/v2/` and answer whatever challenge the registry sends
    async fn authenticate(
        &self,
        base: &Url,
        repository: &str,
        credentials: &RegistryCredentials,
    ) -> Result<Authorization> {
        let response = self
            .client
            .get(base.join("/v2/")?)
            .send()
            .await
            .context("Failed to reach registry")?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(Authorization::Anonymous);
        }

        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        match parse_challenge(header) {
            Some(Challenge::Bearer { realm, service }) => {
                let scope = format!("repository:{}:push,pull", repository);
                let token = self.fetch_token(&realm, service.as_deref(), &scope, credentials).await?;
                Ok(Authorization::Bearer(token))
            }
            Some(Challenge::Basic) => Ok(Authorization::Basic(credentials.clone())),
            None => anyhow::bail!("Unsupported registry challenge: {}", header),
        }
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: &RegistryCredentials,
    ) -> Result<String> {
        let mut query = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }

        let response = self
            .client
            .get(realm)
            .query(&query)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .context("Failed to request registry token")?;

        if !response.status().is_success() {
            anyhow::bail!("Registry token request failed: {}", response.status());
        }

        let body: TokenResponse = response
            .json()
            .await
            .context("Failed to parse registry token response")?;

        body.token
            .or(body.access_token)
            .context("Registry token response carried no token")
    }

    async fn upload_blob(
        &self,
        base: &Url,
        repository: &str,
        auth: &Authorization,
        blob: &PreparedBlob,
    ) -> Result<()> {
        let blob_url = base.join(&format!("/v2/{}/blobs/{}", repository, blob.digest))?;
        let existing = auth.apply(self.client.head(blob_url)).send().await?;
        if existing.status().is_success() {
            debug!("Blob {} already present", blob.digest);
            return Ok(());
        }

        let start = auth
            .apply(
                self.client
                    .post(base.join(&format!("/v2/{}/blobs/uploads/", repository))?),
            )
            .send()
            .await
            .context("Failed to start blob upload")?;
        if start.status() != StatusCode::ACCEPTED {
            anyhow::bail!("Blob upload was not accepted: {}", start.status());
        }

        let location = start
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .context("Blob upload response has no Location")?;
        let upload_url = upload_location(base, location, &blob.digest)?;

        let bytes = tokio::fs::read(&blob.path)
            .await
            .with_context(|| format!("Failed to read blob {}", blob.path.display()))?;

        let finished = auth
            .apply(self.client.put(upload_url))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .context("Failed to upload blob")?;
        if finished.status() != StatusCode::CREATED {
            anyhow::bail!("Blob upload for {} failed: {}", blob.digest, finished.status());
        }

        debug!("Uploaded blob {} ({} bytes)", blob.digest, blob.size);
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn push(
        &self,
        reference: &ImageReference,
        archive: &Path,
        credentials: &RegistryCredentials,
    ) -> Result<()> {
        let archive = archive.to_path_buf();
        let image = tokio::task::spawn_blocking(move || prepare_image(&archive))
            .await
            .context("Image preparation task failed")??;

        let base = Url::parse(&format!("https://{}", reference.host()))
            .context("Invalid registry host")?;
        let repository = reference.repository();
        let auth = self.authenticate(&base, repository, credentials).await?;

        for blob in image.layers.iter().chain(std::iter::once(&image.config)) {
            self.upload_blob(&base, repository, &auth, blob).await?;
        }

        let manifest = image.manifest();
        let response = auth
            .apply(
                self.client
                    .put(base.join(&format!("/v2/{}/manifests/{}", repository, reference.tag()))?),
            )
            .header(CONTENT_TYPE, MANIFEST_MEDIA_TYPE)
            .body(serde_json::to_vec(&manifest)?)
            .send()
            .await
            .context("Failed to upload manifest")?;

        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Manifest upload failed: {} {}", status, body);
        }

        info!("Pushed {} ({} layers)", reference, image.layers.len());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Authorization {
    Anonymous,
    Basic(RegistryCredentials),
    Bearer(String),
}

impl Authorization {
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Authorization::Anonymous => request,
            Authorization::Basic(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            Authorization::Bearer(token) => request.bearer_auth(token),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
    },
    Basic,
}

/// Parse a `WWW-Authenticate` header; quoted values may contain commas
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    for (key, value) in challenge_params(params) {
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            _ => {}
        }
    }

    Some(Challenge::Bearer {
        realm: realm?,
        service,
    })
}

fn challenge_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = params.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();

        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.split_once('"') {
                Some((value, remaining)) => (value.to_string(), remaining),
                None => (quoted.to_string(), ""),
            },
            None => match after.split_once(',') {
                Some((value, remaining)) => (value.trim().to_string(), remaining),
                None => (after.trim().to_string(), ""),
            },
        };

        pairs.push((key, value));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    pairs
}

/// Resolve an upload `Location` against the registry and add the digest
fn upload_location(base: &Url, location: &str, digest: &str) -> Result<Url> {
    let mut url = base
        .join(location)
        .with_context(|| format!("Invalid upload location: {}", location))?;
    url.query_pairs_mut().append_pair("digest", digest);
    Ok(url)
}

/// A blob on local disk, ready for upload
#[derive(Debug, Clone)]
struct PreparedBlob {
    path: PathBuf,
    digest: String,
    size: u64,
}

/// Config and compressed layers unpacked from an archive
struct PreparedImage {
    // Keeps the blobs on disk until the push is done
    _workspace: TempDir,
    config: PreparedBlob,
    layers: Vec<PreparedBlob>,
}

impl PreparedImage {
    fn manifest(&self) -> serde_json::Value {
        let layers: Vec<serde_json::Value> = self
            .layers
            .iter()
            .map(|layer| {
                json!({
                    "mediaType": LAYER_MEDIA_TYPE,
                    "size": layer.size,
                    "digest": layer.digest,
                })
            })
            .collect();

        json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "size": self.config.size,
                "digest": self.config.digest,
            },
            "layers": layers,
        })
    }
}

/// Unpack a `docker save` archive and gzip its layers
fn prepare_image(archive: &Path) -> Result<PreparedImage> {
    let workspace = tempfile::Builder::new()
        .prefix("image-push-")
        .tempdir()
        .context("Failed to create push workspace")?;
    let unpacked = workspace.path().join("archive");

    let file = File::open(archive)
        .with_context(|| format!("Failed to open image archive {}", archive.display()))?;
    tar::Archive::new(file)
        .unpack(&unpacked)
        .context("Failed to unpack image archive")?;

    let entry = crate::archive::read_manifest(archive)?;

    let config_path = unpacked.join(&entry.config);
    let config = PreparedBlob {
        digest: digest_file(&config_path)?,
        size: std::fs::metadata(&config_path)?.len(),
        path: config_path,
    };

    let mut layers = Vec::with_capacity(entry.layers.len());
    for (index, layer) in entry.layers.iter().enumerate() {
        let source = unpacked.join(layer);
        let path = workspace.path().join(format!("layer-{}.tar.gz", index));
        compress_layer(&source, &path)?;
        layers.push(PreparedBlob {
            digest: digest_file(&path)?,
            size: std::fs::metadata(&path)?.len(),
            path,
        });
    }

    Ok(PreparedImage {
        _workspace: workspace,
        config,
        layers,
    })
}

/// Gzip `source` into `dest`, copying it unchanged when it is already gzip
fn compress_layer(source: &Path, dest: &Path) -> Result<()> {
    let mut input = File::open(source)
        .with_context(|| format!("Failed to open layer {}", source.display()))?;

    let mut magic = [0u8; 2];
    let already_gzip = input.read(&mut magic)? == 2 && magic == [0x1f, 0x8b];
    drop(input);

    if already_gzip {
        std::fs::copy(source, dest).context("Failed to copy layer")?;
        return Ok(());
    }

    let mut input = File::open(source)?;
    let mut encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    io::copy(&mut input, &mut encoder).context("Failed to compress layer")?;
    encoder.finish().context("Failed to finish layer")?;
    Ok(())
}

fn digest_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open blob {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
