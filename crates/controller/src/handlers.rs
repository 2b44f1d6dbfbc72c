//! API handlers for the deployment controller

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ops_common::ErrorClass;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    auth::{AuthUser, Authenticator},
    ingestion::IngestionPipeline,
    listing::{ListingQuery, Pagination},
    models::{
        ClientConfigResponse, DeploymentDetails, DeploymentRequest, DeploymentResponse,
        DeploymentSpec, ListParams, MessageResponse, PaginatedDeployments, PushImageResponse,
    },
    orchestrator::Orchestrator,
    secrets::SecretStore,
    storage::DeploymentStore,
};

/// Secret paths for the client-facing auth configuration
#[derive(Clone)]
pub struct ClientConfigSecrets {
    pub store: Arc<dyn SecretStore>,
    pub url_path: String,
    pub anon_key_path: String,
}

/// Shared application state
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub ingestion: IngestionPipeline,
    pub deployments: Arc<dyn DeploymentStore>,
    pub authenticator: Authenticator,
    pub client_config: Option<ClientConfigSecrets>,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl From<ops_common::Error> for ApiError {
    fn from(err: ops_common::Error) -> Self {
        use ops_common::Error;

        let status = match &err {
            Error::InvalidRequest(_) | Error::InvalidArchive(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match err.class() {
            ErrorClass::PartialFailure => error!("Partial failure: {}", err),
            ErrorClass::Infrastructure => error!("{}", err),
            ErrorClass::Client => warn!("{}", err),
        }

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: format!("Invalid request: {}", rejection.body_text()),
        }
    }
}

/// Health check
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.deployments.ping().await {
        Ok(()) => Json(serde_json::json!({
            "http_server": "healthy",
            "database": "healthy"
        }))
        .into_response(),
        Err(e) => {
            error!("Failed to query postgres version: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "failed to query postgres version",
                    "detail": format!("{:#}", e)
                })),
            )
                .into_response()
        }
    }
}

/// Client-facing auth configuration
pub async fn client_config_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClientConfigResponse>, ApiError> {
    let Some(secrets) = &state.client_config else {
        return Err(ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "Client configuration is not available".to_string(),
        });
    };

    let (supabase_url, supabase_anon_public_key) = tokio::try_join!(
        secrets.store.get(&secrets.url_path),
        secrets.store.get(&secrets.anon_key_path),
    )?;

    Ok(Json(ClientConfigResponse {
        supabase_url,
        supabase_anon_public_key,
    }))
}

/// Create a deployment, or update the caller's deployment of the same name
#[tracing::instrument(skip_all, fields(owner = %user.email))]
pub async fn create_deployment_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    payload: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let Json(request) = payload?;
    let spec = DeploymentSpec::from_request(request)?;

    info!("Deploying {} from {}", spec.name, spec.container_image);

    let outcome = state.orchestrator.create_or_update(&user.email, spec).await?;

    Ok(Json(DeploymentResponse {
        service_url: outcome.address.as_response().to_string(),
    }))
}

/// List the caller's deployments
#[tracing::instrument(skip_all, fields(owner = %user.email))]
pub async fn list_deployments_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<PaginatedDeployments>, ApiError> {
    let pagination = Pagination::from_raw(params.page.as_deref(), params.limit.as_deref());
    let query = ListingQuery::new(user.email.as_str(), params.search.as_deref(), pagination);

    let page = state.deployments.list(&query).await.map_err(|e| {
        error!("Error listing deployments: {:#}", e);
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Failed to query deployments".to_string(),
        }
    })?;

    info!(
        "Retrieved {} deployments (page {} of {})",
        page.deployments.len(),
        pagination.page(),
        pagination.total_pages(page.total)
    );

    Ok(Json(PaginatedDeployments {
        deployments: page.deployments,
        count: page.total,
        page: pagination.page(),
        limit: pagination.limit(),
        total_pages: pagination.total_pages(page.total),
    }))
}

/// Get one of the caller's deployments
#[tracing::instrument(skip_all, fields(owner = %user.email))]
pub async fn get_deployment_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<DeploymentDetails>, ApiError> {
    let deployment = state.orchestrator.get(&user.email, &name).await?;
    Ok(Json(DeploymentDetails { deployment }))
}

/// Tear down one of the caller's deployments
#[tracing::instrument(skip_all, fields(owner = %user.email))]
pub async fn delete_deployment_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("Deleting deployment {}", name);

    let report = state.orchestrator.delete(&user.email, &name).await?;
    if !report.cleanup.errors.is_empty() {
        warn!(
            "State cleanup for {} left {} errors",
            report.stack,
            report.cleanup.errors.len()
        );
    }

    Ok(Json(MessageResponse {
        message: report.message(),
    }))
}

/// Ingest a gzip-compressed `docker save` archive
#[tracing::instrument(skip_all, fields(owner = %user.email))]
pub async fn push_image_handler(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<PushImageResponse>, ApiError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok());

    info!("Receiving image archive");

    let reference = state.ingestion.ingest(&user.email, content_type, body).await?;

    Ok(Json(PushImageResponse {
        fqin: reference.to_string(),
    }))
}
