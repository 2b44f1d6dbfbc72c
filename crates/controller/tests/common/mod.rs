//! In-memory collaborators shared by the integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use ops_common::{ImageReference, StackIdentity};
use ops_controller::{
    auth::{Authenticator, UserClaims},
    docker::ContainerDaemon,
    handlers::ClientConfigSecrets,
    ingestion::IngestionPipeline,
    janitor::{BlobStore, ObjectPage, StateJanitor},
    listing::ListingQuery,
    models::{Deployment, DeploymentChanges, NewDeployment},
    provisioner::{ProvisioningEngine, ServiceSpec, UpSummary, SERVICE_URL_OUTPUT},
    registry_client::{CredentialSource, RegistryClient, RegistryCredentials},
    secrets::SecretStore,
    storage::{DeploymentPage, DeploymentStore, ImageStore},
    AppState, Orchestrator,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-test-secret";
pub const REGISTRY_PREFIX: &str = "us-central1-docker.pkg.dev/acme-prod/apps";
pub const REGISTRY_KEY_SECRET: &str = "projects/acme-prod/secrets/registry-key/versions/latest";

/// A signed token for `email`, valid for an hour
pub fn token(email: &str) -> String {
    let claims = UserClaims {
        sub: Some(Uuid::new_v4().to_string()),
        email: Some(email.to_string()),
        role: Some("authenticated".to_string()),
        user_metadata: None,
        exp: (Utc::now().timestamp() + 3600) as u64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap()
}

pub fn bearer(email: &str) -> String {
    format!("Bearer {}", token(email))
}

/// Reference for an image that is already recorded
pub fn image(name: &str) -> String {
    format!("{}/{}:1a2b3c4d", REGISTRY_PREFIX, name)
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    deployments: Mutex<Vec<Deployment>>,
    images: Mutex<Vec<(String, String)>>,
    pub fail_insert: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_record_image: AtomicBool,
    pub fail_ping: AtomicBool,
    pub writes: AtomicUsize,
}

impl MemoryStore {
    pub fn deployments(&self) -> Vec<Deployment> {
        self.deployments.lock().unwrap().clone()
    }

    pub fn images(&self) -> Vec<(String, String)> {
        self.images.lock().unwrap().clone()
    }

    /// Record an image as if it had been pushed
    pub fn seed_image(&self, fqin: &str, owner: &str) {
        self.images
            .lock()
            .unwrap()
            .push((fqin.to_string(), owner.to_string()));
    }

    /// Insert a deployment row directly
    pub fn seed_deployment(&self, owner: &str, name: &str, url: &str, image: &str) -> Deployment {
        let now = Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: url.to_string(),
            container_image: image.to_string(),
            user_email: owner.to_string(),
            min_instances: 0,
            max_instances: 1,
            created_at: now,
            updated_at: now,
        };
        self.deployments.lock().unwrap().push(deployment.clone());
        deployment
    }

    fn failing(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            anyhow::bail!("simulated {} failure", what);
        }
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn find(&self, name: &str, owner: &str) -> Result<Option<Deployment>> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.name == name && d.user_email == owner)
            .cloned())
    }

    async fn insert(&self, new: &NewDeployment) -> Result<Deployment> {
        Self::failing(&self.fail_insert, "insert")?;

        let mut deployments = self.deployments.lock().unwrap();
        if deployments
            .iter()
            .any(|d| d.name == new.name && d.user_email == new.user_email)
        {
            anyhow::bail!("duplicate key value violates unique constraint");
        }

        let now = Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            url: new.url.clone(),
            container_image: new.container_image.clone(),
            user_email: new.user_email.clone(),
            min_instances: new.scaling.min_instances,
            max_instances: new.scaling.max_instances,
            created_at: now,
            updated_at: now,
        };
        deployments.push(deployment.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(deployment)
    }

    async fn update(&self, id: Uuid, changes: &DeploymentChanges) -> Result<Deployment> {
        Self::failing(&self.fail_update, "update")?;

        let mut deployments = self.deployments.lock().unwrap();
        let deployment = deployments
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| anyhow::anyhow!("no deployment {}", id))?;

        deployment.container_image = changes.container_image.clone();
        deployment.min_instances = changes.scaling.min_instances;
        deployment.max_instances = changes.scaling.max_instances;
        if let Some(url) = &changes.url {
            deployment.url = url.clone();
        }
        deployment.updated_at = Utc::now();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(deployment.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Self::failing(&self.fail_delete, "delete")?;

        let mut deployments = self.deployments.lock().unwrap();
        let before = deployments.len();
        deployments.retain(|d| d.id != id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(deployments.len() < before)
    }

    async fn list(&self, query: &ListingQuery) -> Result<DeploymentPage> {
        let term = query.search_term();
        let mut matching: Vec<Deployment> = self
            .deployments
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.user_email == query.owner())
            .filter(|d| match &term {
                Some(term) => [&d.name, &d.url, &d.container_image]
                    .iter()
                    .any(|field| field.to_lowercase().contains(term.as_str())),
                None => true,
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        let pagination = query.pagination();
        let total = matching.len() as i64;
        let deployments = matching
            .into_iter()
            .skip(pagination.offset() as usize)
            .take(pagination.limit() as usize)
            .collect();

        Ok(DeploymentPage { deployments, total })
    }

    async fn ping(&self) -> Result<()> {
        Self::failing(&self.fail_ping, "ping")
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn record_image(&self, fqin: &str, owner: &str) -> Result<()> {
        Self::failing(&self.fail_record_image, "record image")?;
        self.seed_image(fqin, owner);
        Ok(())
    }

    async fn image_exists(&self, fqin: &str) -> Result<bool> {
        Ok(self.images.lock().unwrap().iter().any(|(f, _)| f == fqin))
    }
}

// ---------------------------------------------------------------------------
// IaC engine
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    pub fail_up: AtomicBool,
    pub fail_refresh: AtomicBool,
    pub fail_destroy: AtomicBool,
    pub fail_remove_stack: AtomicBool,
    pub zero_changes: AtomicBool,
    pub omit_url: AtomicBool,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn service_url(name: &str) -> String {
        format!("https://{}-abc123-uc.a.run.app", name)
    }

    fn record(&self, verb: &str, stack: &StackIdentity) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", verb, stack.stack_name()));
    }
}

#[async_trait]
impl ProvisioningEngine for FakeEngine {
    async fn up(&self, stack: &StackIdentity, spec: &ServiceSpec) -> Result<UpSummary> {
        self.record("up", stack);
        if self.fail_up.load(Ordering::SeqCst) {
            anyhow::bail!("pulumi up failed: quota exceeded");
        }

        let mut summary = UpSummary::default();
        if !self.zero_changes.load(Ordering::SeqCst) {
            summary.resource_changes = BTreeMap::from([("create".to_string(), 2)]);
        }
        if !self.omit_url.load(Ordering::SeqCst) {
            summary.outputs = HashMap::from([(
                SERVICE_URL_OUTPUT.to_string(),
                serde_json::Value::String(Self::service_url(&spec.service_name)),
            )]);
        }
        Ok(summary)
    }

    async fn refresh(&self, stack: &StackIdentity) -> Result<()> {
        self.record("refresh", stack);
        if self.fail_refresh.load(Ordering::SeqCst) {
            anyhow::bail!("refresh failed");
        }
        Ok(())
    }

    async fn destroy(&self, stack: &StackIdentity) -> Result<()> {
        self.record("destroy", stack);
        if self.fail_destroy.load(Ordering::SeqCst) {
            anyhow::bail!("destroy failed: resource in use");
        }
        Ok(())
    }

    async fn remove_stack(&self, stack: &StackIdentity) -> Result<()> {
        self.record("remove", stack);
        if self.fail_remove_stack.load(Ordering::SeqCst) {
            anyhow::bail!("stack still has resources");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// State bucket
// ---------------------------------------------------------------------------

/// Listing pages hold two names, so sweeps always follow page tokens
#[derive(Default)]
pub struct FakeBlobStore {
    objects: Mutex<BTreeSet<String>>,
    deleted: Mutex<Vec<String>>,
    pub fail_list: AtomicBool,
    /// Deleting any of these fails
    pub undeletable: Mutex<BTreeSet<String>>,
}

impl FakeBlobStore {
    pub fn with_objects(names: &[&str]) -> Self {
        let store = Self::default();
        store
            .objects
            .lock()
            .unwrap()
            .extend(names.iter().map(|n| n.to_string()));
        store
    }

    pub fn objects(&self) -> Vec<String> {
        self.objects.lock().unwrap().iter().cloned().collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn list_page(&self, prefix: &str, page_token: Option<&str>) -> Result<ObjectPage> {
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("listing denied");
        }

        let start: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let names: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();

        let end = (start + 2).min(names.len());
        Ok(ObjectPage {
            names: names[start..end].to_vec(),
            next_page_token: (end < names.len()).then(|| end.to_string()),
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.undeletable.lock().unwrap().contains(name) {
            anyhow::bail!("permission denied");
        }
        if !self.objects.lock().unwrap().remove(name) {
            anyhow::bail!("{} does not exist", name);
        }
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Container daemon, registry and secrets
// ---------------------------------------------------------------------------

/// Daemon with a shared tag table, as `docker` keeps one per host
#[derive(Default)]
pub struct FakeDaemon {
    calls: Mutex<Vec<String>>,
    /// reference -> image id
    tags: Mutex<HashMap<String, String>>,
    /// Applied right after each load, like a concurrent load of the same name
    pub retag_on_load: Mutex<Option<(String, String)>>,
    pub fail_load: AtomicBool,
    pub fail_tag: AtomicBool,
    pub fail_remove: AtomicBool,
}

impl FakeDaemon {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tags(&self) -> HashMap<String, String> {
        self.tags.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerDaemon for FakeDaemon {
    async fn load(&self, archive: &Path) -> Result<()> {
        self.record("load".to_string());
        if self.fail_load.load(Ordering::SeqCst) {
            anyhow::bail!("open /var/lib/docker/tmp: no space left on device");
        }

        let image = ops_controller::archive::inspect(archive)?;
        let mut tags = self.tags.lock().unwrap();
        if let Some(name) = image.name {
            tags.insert(name, image.id.clone());
        }
        tags.insert(image.id.clone(), image.id);
        if let Some((name, id)) = self.retag_on_load.lock().unwrap().clone() {
            tags.insert(name, id);
        }
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.record(format!("tag {} {}", source, target));
        if self.fail_tag.load(Ordering::SeqCst) {
            anyhow::bail!("Error response from daemon: invalid reference format");
        }

        let mut tags = self.tags.lock().unwrap();
        let id = tags
            .get(source)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No such image: {}", source))?;
        tags.insert(target.to_string(), id);
        Ok(())
    }

    /// `rmi -f`: an id drops every name pointing at it
    async fn remove(&self, reference: &str) -> Result<()> {
        self.record(format!("remove {}", reference));
        if self.fail_remove.load(Ordering::SeqCst) {
            anyhow::bail!("image is in use");
        }

        let mut tags = self.tags.lock().unwrap();
        match tags.remove(reference) {
            Some(id) if id == reference => tags.retain(|_, target| *target != id),
            Some(_) => {}
            None => anyhow::bail!("No such image: {}", reference),
        }
        Ok(())
    }

    async fn save(&self, reference: &str, dest: &Path) -> Result<()> {
        self.record(format!("save {}", reference));
        if !self.tags.lock().unwrap().contains_key(reference) {
            anyhow::bail!("No such image: {}", reference);
        }
        std::fs::write(dest, b"saved image")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    pushes: Mutex<Vec<(String, String)>>,
    pub fail_push: AtomicBool,
}

impl FakeRegistry {
    /// (reference, username) per push
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn push(
        &self,
        reference: &ImageReference,
        archive: &Path,
        credentials: &RegistryCredentials,
    ) -> Result<()> {
        assert_eq!(std::fs::read(archive)?, b"saved image");
        if self.fail_push.load(Ordering::SeqCst) {
            anyhow::bail!("denied: permission artifactregistry.repositories.uploadArtifacts");
        }
        self.pushes
            .lock()
            .unwrap()
            .push((reference.to_string(), credentials.username.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSecrets {
    values: Mutex<HashMap<String, String>>,
}

impl FakeSecrets {
    pub fn with(values: &[(&str, &str)]) -> Self {
        let secrets = Self::default();
        secrets.values.lock().unwrap().extend(
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        secrets
    }
}

#[async_trait]
impl SecretStore for FakeSecrets {
    async fn get(&self, path: &str) -> Result<String> {
        self.values
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("secret {} not found", path))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Every fake wired together
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub engine: Arc<FakeEngine>,
    pub blobs: Arc<FakeBlobStore>,
    pub daemon: Arc<FakeDaemon>,
    pub registry: Arc<FakeRegistry>,
    pub secrets: Arc<FakeSecrets>,
    pub client_config: bool,
    pub upload_limit: u64,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_blobs(FakeBlobStore::default())
    }

    pub fn with_blobs(blobs: FakeBlobStore) -> Self {
        Self {
            store: Arc::new(MemoryStore::default()),
            engine: Arc::new(FakeEngine::default()),
            blobs: Arc::new(blobs),
            daemon: Arc::new(FakeDaemon::default()),
            registry: Arc::new(FakeRegistry::default()),
            secrets: Arc::new(FakeSecrets::with(&[
                (REGISTRY_KEY_SECRET, "{\"type\": \"service_account\"}"),
                ("projects/acme-prod/secrets/supabase-url/versions/latest", "https://acme.supabase.co"),
                ("projects/acme-prod/secrets/supabase-anon-key/versions/latest", "anon-key"),
            ])),
            client_config: true,
            upload_limit: 1024 * 1024,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.store.clone(),
            self.engine.clone(),
            StateJanitor::new(self.blobs.clone()),
            "us-central1",
            "acme-prod",
        )
    }

    pub fn pipeline(&self) -> IngestionPipeline {
        IngestionPipeline::new(
            self.daemon.clone(),
            self.registry.clone(),
            self.store.clone(),
            CredentialSource::Secret {
                store: self.secrets.clone(),
                path: REGISTRY_KEY_SECRET.to_string(),
            },
            REGISTRY_PREFIX,
        )
        .with_upload_limit(self.upload_limit)
    }

    pub fn state(&self) -> AppState {
        let client_config = self.client_config.then(|| ClientConfigSecrets {
            store: self.secrets.clone(),
            url_path: "projects/acme-prod/secrets/supabase-url/versions/latest".to_string(),
            anon_key_path: "projects/acme-prod/secrets/supabase-anon-key/versions/latest".to_string(),
        });

        AppState {
            orchestrator: self.orchestrator(),
            ingestion: self.pipeline(),
            deployments: self.store.clone(),
            authenticator: Authenticator::new(JWT_SECRET),
            client_config,
        }
    }

    pub fn router(&self) -> axum::Router {
        ops_controller::create_router(self.state())
    }
}

/// Gzip `data` the way a client would before uploading
pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Config blob of the image every test archive carries
pub const IMAGE_CONFIG: &[u8] =
    br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;

/// Id the daemon gives an image with `config`
pub fn image_id(config: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{}", hex::encode(Sha256::digest(config)))
}

/// An uncompressed `docker save` archive in the content-addressed layout
pub fn save_archive(repo_tag: Option<&str>, config: &[u8]) -> Vec<u8> {
    let config_path = format!("blobs/sha256/{}", image_id(config).trim_start_matches("sha256:"));
    let manifest = serde_json::json!([{
        "Config": config_path,
        "RepoTags": repo_tag.map(|tag| vec![tag]),
        "Layers": ["blobs/sha256/layer"],
    }])
    .to_string();

    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in [
        (config_path.as_str(), config),
        ("blobs/sha256/layer", b"layer contents".as_slice()),
        ("manifest.json", manifest.as_bytes()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// A compressed upload of the test image named `repo_tag`
pub fn upload(repo_tag: &str) -> Vec<u8> {
    gzip(&save_archive(Some(repo_tag), IMAGE_CONFIG))
}
