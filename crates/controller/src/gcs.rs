//! Cloud Storage JSON API client for the engine state bucket

use crate::gcp::GcpTokenSource;
use crate::janitor::{BlobStore, ObjectPage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1/";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
}

/// [`BlobStore`] over one bucket
pub struct GcsBlobStore {
    client: reqwest::Client,
    tokens: Arc<GcpTokenSource>,
    bucket: String,
    api: Url,
}

impl GcsBlobStore {
    pub fn new(client: reqwest::Client, tokens: Arc<GcpTokenSource>, bucket: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client,
            tokens,
            bucket: bucket.into(),
            api: Url::parse(STORAGE_API)?,
        })
    }

    /// `.../b/{bucket}/o[/{object}]` with every segment percent-encoded
    fn objects_url(&self, object: Option<&str>) -> Result<Url> {
        let mut url = self.api.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("Storage API URL cannot be a base"))?;
            segments.pop_if_empty().extend(["b", self.bucket.as_str(), "o"]);
            if let Some(object) = object {
                segments.push(object);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn list_page(&self, prefix: &str, page_token: Option<&str>) -> Result<ObjectPage> {
        let mut url = self.objects_url(None)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("fields", "items(name),nextPageToken");
            if !prefix.is_empty() {
                query.append_pair("prefix", prefix);
            }
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .context("Failed to list state objects")?;

        if !response.status().is_success() {
            anyhow::bail!("Listing bucket {} failed: {}", self.bucket, response.status());
        }

        let page: ListResponse = response
            .json()
            .await
            .context("Failed to parse object listing")?;

        Ok(ObjectPage {
            names: page.items.into_iter().map(|item| item.name).collect(),
            next_page_token: page.next_page_token,
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.objects_url(Some(name))?)
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .with_context(|| format!("Failed to delete {}", name))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => anyhow::bail!("{} does not exist", name),
            status => anyhow::bail!("Deleting {} failed: {}", name, status),
        }
    }
}
