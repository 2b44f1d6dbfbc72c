//! Secret Manager access

use crate::gcp::GcpTokenSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;

const SECRET_MANAGER_API: &str = "https://secretmanager.googleapis.com/v1";

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Value of a secret version, e.g. `projects/p/secrets/s/versions/latest`
    async fn get(&self, path: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    payload: Payload,
}

#[derive(Debug, Deserialize)]
struct Payload {
    data: String,
}

pub struct SecretManager {
    client: reqwest::Client,
    tokens: Arc<GcpTokenSource>,
}

impl SecretManager {
    pub fn new(client: reqwest::Client, tokens: Arc<GcpTokenSource>) -> Self {
        Self { client, tokens }
    }
}

#[async_trait]
impl SecretStore for SecretManager {
    async fn get(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}:access", SECRET_MANAGER_API, path.trim_matches('/'));

        let response = self
            .client
            .get(&url)
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .with_context(|| format!("Failed to access secret {}", path))?;

        if !response.status().is_success() {
            anyhow::bail!("Accessing secret {} failed: {}", path, response.status());
        }

        let body: AccessResponse = response
            .json()
            .await
            .context("Failed to parse secret response")?;

        decode_payload(&body.payload.data)
    }
}

fn decode_payload(data: &str) -> Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .context("Secret payload is not base64")?;
    String::from_utf8(bytes).context("Secret payload is not UTF-8")
}
