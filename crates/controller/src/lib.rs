//! Deployment Controller
//!
//! REST API that provisions one Cloud Run service per user deployment through
//! the Pulumi engine, keeps a PostgreSQL record of what is live, and ingests
//! container images into the registry those deployments pull from.

pub mod archive;
pub mod auth;
pub mod config;
pub mod docker;
pub mod gcp;
pub mod gcs;
pub mod handlers;
pub mod ingestion;
pub mod janitor;
pub mod listing;
pub mod models;
pub mod orchestrator;
pub mod provisioner;
pub mod registry_client;
pub mod secrets;
pub mod storage;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use handlers::{ApiError, AppState};
pub use orchestrator::Orchestrator;
pub use storage::PgStorage;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    let api = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/auth/client-config", get(handlers::client_config_handler))
        .route(
            "/deployments",
            get(handlers::list_deployments_handler)
                .post(handlers::create_deployment_handler)
                .put(handlers::create_deployment_handler),
        )
        .route(
            "/deployments/{name}",
            get(handlers::get_deployment_handler).delete(handlers::delete_deployment_handler),
        )
        .route("/container-images", post(handlers::push_image_handler));

    Router::new()
        .nest("/api/v1", api)
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
