//! Configuration management for the deployment controller
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::ingestion::DEFAULT_UPLOAD_LIMIT;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum connections held by the pool
    pub database_max_connections: u32,

    /// Project that owns provisioned services
    pub gcp_project_id: String,

    /// Location of every provisioned service
    pub gcp_region: String,

    /// Bucket backing the IaC engine state
    pub state_bucket: String,

    /// IaC engine executable
    pub pulumi_binary: String,

    /// Provider plugin version installed before each engine run
    pub pulumi_gcp_plugin_version: String,

    /// Passphrase for engine-side secrets encryption
    pub pulumi_passphrase: String,

    /// Parent directory for per-operation engine workspaces
    pub pulumi_work_dir: Option<PathBuf>,

    /// Container daemon client executable
    pub docker_binary: String,

    /// Registry host and repository path that prefixes every pushed image
    pub registry_prefix: String,

    /// Service-account key file used to authenticate pushes
    pub registry_key_file: PathBuf,

    /// Secret path for the service-account key; overrides the key file
    pub registry_key_secret: Option<String>,

    /// HMAC secret used to validate bearer tokens
    pub jwt_secret: String,

    /// Secret path for the client-facing auth URL
    pub supabase_url_secret: Option<String>,

    /// Secret path for the client-facing anonymous key
    pub supabase_anon_key_secret: Option<String>,

    /// Request body limit for image uploads
    pub max_upload_bytes: u64,

    /// Where uploads are spooled and decompressed; the system temp dir otherwise
    pub upload_scratch_dir: Option<PathBuf>,

    /// Emit JSON logs
    pub json_logs: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("{} must be set", key))
        };
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let config = Config {
            api_host: var("API_HOST", "0.0.0.0"),

            api_port: var("API_PORT", "8080")
                .parse()
                .context("Invalid API_PORT")?,

            database_url: required("DATABASE_URL")?,

            database_max_connections: var("DATABASE_MAX_CONNECTIONS", "10")
                .parse()
                .context("Invalid DATABASE_MAX_CONNECTIONS")?,

            gcp_project_id: required("GCP_PROJECT_ID")?,
            gcp_region: var("GCP_REGION", "us-central1"),
            state_bucket: required("PULUMI_STATE_BUCKET")?,

            pulumi_binary: var("PULUMI_BINARY", "pulumi"),
            pulumi_gcp_plugin_version: var("PULUMI_GCP_PLUGIN_VERSION", "v9.3.0"),
            pulumi_passphrase: var("PULUMI_CONFIG_PASSPHRASE", ""),
            pulumi_work_dir: optional("PULUMI_WORK_DIR").map(PathBuf::from),

            docker_binary: var("DOCKER_BINARY", "docker"),

            registry_prefix: required("AR_REPO_URL")?,
            registry_key_file: var("REGISTRY_KEY_FILE", "./sakey.json").into(),
            registry_key_secret: optional("REGISTRY_KEY_SECRET"),

            jwt_secret: required("SUPABASE_JWT_SECRET")?,
            supabase_url_secret: optional("SUPABASE_URL_SECRET"),
            supabase_anon_key_secret: optional("SUPABASE_ANON_KEY_SECRET"),

            max_upload_bytes: match optional("MAX_UPLOAD_BYTES") {
                Some(value) => value.parse().context("Invalid MAX_UPLOAD_BYTES")?,
                None => DEFAULT_UPLOAD_LIMIT,
            },
            upload_scratch_dir: optional("UPLOAD_SCRATCH_DIR").map(PathBuf::from),

            json_logs: var("APP_ENV", "development") == "production",
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("DATABASE_MAX_CONNECTIONS must be greater than 0");
        }

        if self.max_upload_bytes == 0 {
            anyhow::bail!("MAX_UPLOAD_BYTES must be greater than 0");
        }

        if self.registry_prefix.starts_with("http://") || self.registry_prefix.starts_with("https://") {
            anyhow::bail!("AR_REPO_URL must be a registry path without a scheme");
        }

        if !self.registry_prefix.trim_end_matches('/').contains('/') {
            anyhow::bail!("AR_REPO_URL must include a repository path after the registry host");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// IaC engine backend URL for the state bucket
    pub fn state_backend_url(&self) -> String {
        format!("gs://{}", self.state_bucket)
    }

    /// Both client config secrets, when configured
    pub fn client_config_secrets(&self) -> Option<(String, String)> {
        match (&self.supabase_url_secret, &self.supabase_anon_key_secret) {
            (Some(url), Some(key)) => Some((url.clone(), key.clone())),
            _ => None,
        }
    }
}
