//! Deployment Controller
//!
//! REST API server for deployments and container image ingestion

use anyhow::{Context, Result};
use ops_controller::{
    auth::Authenticator,
    create_router,
    docker::DockerCli,
    gcp::GcpTokenSource,
    gcs::GcsBlobStore,
    handlers::ClientConfigSecrets,
    ingestion::IngestionPipeline,
    janitor::StateJanitor,
    provisioner::{PulumiCli, PulumiSettings},
    registry_client::{CredentialSource, OciRegistryClient},
    secrets::{SecretManager, SecretStore},
    AppState, Config, Orchestrator, PgStorage,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ops_controller=debug,tower_http=debug".into()),
        )
        .with(config.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Deployment Controller");
    info!("Project: {} ({})", config.gcp_project_id, config.gcp_region);
    info!("State backend: {}", config.state_backend_url());
    info!("Registry: {}", config.registry_prefix);

    // Initialize storage
    let storage = Arc::new(
        PgStorage::connect(&config.database_url, config.database_max_connections)
            .await
            .context("Failed to initialize storage")?,
    );
    storage.migrate().await?;

    // Google Cloud clients
    let http = reqwest::Client::new();
    let tokens = Arc::new(GcpTokenSource::new(http.clone()));
    let secrets: Arc<dyn SecretStore> = Arc::new(SecretManager::new(http.clone(), tokens.clone()));
    let state_store = Arc::new(GcsBlobStore::new(http, tokens, &config.state_bucket)?);

    let engine = Arc::new(PulumiCli::new(PulumiSettings {
        binary: config.pulumi_binary.clone(),
        backend_url: config.state_backend_url(),
        gcp_project: config.gcp_project_id.clone(),
        plugin_version: config.pulumi_gcp_plugin_version.clone(),
        passphrase: config.pulumi_passphrase.clone(),
        work_dir: config.pulumi_work_dir.clone(),
    }));

    let orchestrator = Orchestrator::new(
        storage.clone(),
        storage.clone(),
        engine,
        StateJanitor::new(state_store),
        &config.gcp_region,
        &config.gcp_project_id,
    );

    let credentials = match &config.registry_key_secret {
        Some(path) => CredentialSource::Secret {
            store: secrets.clone(),
            path: path.clone(),
        },
        None => CredentialSource::KeyFile(config.registry_key_file.clone()),
    };

    let mut ingestion = IngestionPipeline::new(
        Arc::new(DockerCli::new(&config.docker_binary)),
        Arc::new(OciRegistryClient::new()),
        storage.clone(),
        credentials,
        &config.registry_prefix,
    )
    .with_upload_limit(config.max_upload_bytes);
    if let Some(dir) = &config.upload_scratch_dir {
        ingestion = ingestion.with_scratch_dir(dir);
    }

    let client_config = config
        .client_config_secrets()
        .map(|(url_path, anon_key_path)| ClientConfigSecrets {
            store: secrets.clone(),
            url_path,
            anon_key_path,
        });

    // Create application state
    let state = AppState {
        orchestrator,
        ingestion,
        deployments: storage,
        authenticator: Authenticator::new(&config.jwt_secret),
        client_config,
    };

    // Create router
    let app = create_router(state);

    // Start server
    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Deployment Controller listening on http://{}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
