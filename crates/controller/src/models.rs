//! Data models for the deployment controller

use chrono::{DateTime, Utc};
use ops_common::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest service name the compute platform accepts
pub const MAX_NAME_LEN: usize = 49;

/// Marker returned in place of an address the engine did not report
pub const URL_NOT_AVAILABLE: &str = "URL not available";

/// A deployment row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Deployment {
    /// Generated identifier
    pub id: Uuid,

    /// User-chosen name, unique per owner
    pub name: String,

    /// Public address assigned by the platform (empty until known)
    pub url: String,

    /// Fully-qualified image reference
    pub container_image: String,

    /// Owner identity
    pub user_email: String,

    pub min_instances: i32,
    pub max_instances: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Instance-count bounds applied to both the service and its revision template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScalingBounds {
    pub min_instances: i32,
    pub max_instances: i32,
}

impl Default for ScalingBounds {
    fn default() -> Self {
        Self {
            min_instances: 0,
            max_instances: 1,
        }
    }
}

impl ScalingBounds {
    /// Apply defaults to caller-supplied bounds.
    ///
    /// An omitted or zero `max_instances` becomes 1. An omitted
    /// `min_instances` becomes 0.
    pub fn from_request(min_instances: Option<i32>, max_instances: Option<i32>) -> Result<Self> {
        let defaults = Self::default();
        let min_instances = min_instances.unwrap_or(defaults.min_instances);
        let max_instances = match max_instances {
            None | Some(0) => defaults.max_instances,
            Some(max) => max,
        };

        if min_instances < 0 {
            return Err(Error::InvalidRequest(
                "min_instances must not be negative".to_string(),
            ));
        }
        if max_instances < 1 {
            return Err(Error::InvalidRequest(
                "max_instances must be at least 1".to_string(),
            ));
        }
        if max_instances < min_instances {
            return Err(Error::InvalidRequest(format!(
                "max_instances ({}) must be greater than or equal to min_instances ({})",
                max_instances, min_instances
            )));
        }

        Ok(Self {
            min_instances,
            max_instances,
        })
    }
}

/// A validated create-or-update request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSpec {
    pub name: String,
    pub container_image: String,
    pub scaling: ScalingBounds,
}

impl DeploymentSpec {
    pub fn from_request(request: DeploymentRequest) -> Result<Self> {
        validate_name(&request.name)?;

        let container_image = request.container_image.trim().to_string();
        if container_image.is_empty() {
            return Err(Error::InvalidRequest(
                "container_image is required".to_string(),
            ));
        }

        Ok(Self {
            name: request.name,
            container_image,
            scaling: ScalingBounds::from_request(request.min_instances, request.max_instances)?,
        })
    }
}

/// Check that a deployment name is a valid DNS label for the platform
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Err(Error::InvalidRequest(format!("name {}", reason)));

    if name.is_empty() {
        return invalid("is required");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid(&format!("must be at most {} characters", MAX_NAME_LEN));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return invalid("must start with a lowercase letter");
    }
    if name.ends_with('-') {
        return invalid("must not end with '-'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return invalid("may only contain lowercase letters, digits and '-'");
    }

    Ok(())
}

/// Fields written when a deployment is first recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeployment {
    pub name: String,
    pub url: String,
    pub container_image: String,
    pub user_email: String,
    pub scaling: ScalingBounds,
}

/// Fields rewritten when an existing deployment is provisioned again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentChanges {
    pub container_image: String,
    pub scaling: ScalingBounds,
    /// Replaces the stored address only when the engine reported one
    pub url: Option<String>,
}

/// Public address of a provisioned service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAddress {
    Available(String),
    /// The service was provisioned but the engine did not report its address
    Unavailable,
}

impl ServiceAddress {
    /// Value returned to callers
    pub fn as_response(&self) -> &str {
        match self {
            ServiceAddress::Available(url) => url,
            ServiceAddress::Unavailable => URL_NOT_AVAILABLE,
        }
    }

    /// Value stored in the deployment row
    pub fn stored_value(&self) -> &str {
        match self {
            ServiceAddress::Available(url) => url,
            ServiceAddress::Unavailable => "",
        }
    }

    pub fn known(&self) -> Option<String> {
        match self {
            ServiceAddress::Available(url) => Some(url.clone()),
            ServiceAddress::Unavailable => None,
        }
    }
}

/// Body of `POST`/`PUT /deployments`
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentRequest {
    pub name: String,
    pub container_image: String,
    #[serde(default)]
    pub min_instances: Option<i32>,
    #[serde(default)]
    pub max_instances: Option<i32>,
}

/// Response from create-or-update
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub service_url: String,
}

/// Query string of `GET /deployments`
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub search: Option<String>,
}

/// Paginated listing envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct PaginatedDeployments {
    pub deployments: Vec<Deployment>,
    pub count: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

/// Response with a single deployment
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentDetails {
    pub deployment: Deployment,
}

/// Plain message response
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Response from image ingestion
#[derive(Debug, Serialize, Deserialize)]
pub struct PushImageResponse {
    pub fqin: String,
}

/// Client-facing auth configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientConfigResponse {
    pub supabase_url: String,
    pub supabase_anon_public_key: String,
}
