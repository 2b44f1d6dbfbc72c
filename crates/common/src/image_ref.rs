//! Fully-qualified image references (FQINs) for pushed container images.

use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of the random tag given to every pushed image
pub const TAG_LEN: usize = 8;

/// `{host}/{repository}:{tag}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    host: String,
    repository: String,
    tag: String,
}

impl ImageReference {
    /// Compose the push target for `image_name` under `registry_prefix`
    /// (registry host plus repository path) with a fresh random tag.
    pub fn for_push(registry_prefix: &str, image_name: &str) -> Result<Self> {
        Self::with_tag(registry_prefix, image_name, &random_tag())
    }

    pub fn with_tag(registry_prefix: &str, image_name: &str, tag: &str) -> Result<Self> {
        let prefix = registry_prefix.trim_end_matches('/');
        let image_name = image_name.trim_matches('/');
        if image_name.is_empty() {
            return Err(Error::InvalidRequest("image name is empty".to_string()));
        }
        Self::parse(&format!("{}/{}:{}", prefix, image_name, tag))
    }

    /// Parse `host/path...:tag`. A host and an explicit tag are required.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = || Error::InvalidRequest(format!("invalid image reference: {}", reference));

        let (host, rest) = reference.split_once('/').ok_or_else(invalid)?;
        let (repository, tag) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || repository.is_empty() || tag.is_empty() || tag.contains('/') {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Repository path below the host, as used by the distribution API
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.repository, self.tag)
    }
}

/// Random lowercase-hex tag, unique per push
pub fn random_tag() -> String {
    let mut tag = Uuid::new_v4().simple().to_string();
    tag.truncate(TAG_LEN);
    tag
}

/// Repository name of a locally loaded image: drops the tag or digest and any
/// leading registry host, so `docker.io/library/nginx:1.25` becomes
/// `library/nginx`.
pub fn repository_name(loaded: &str) -> &str {
    let without_digest = loaded.split('@').next().unwrap_or(loaded);
    let without_tag = match without_digest.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => name,
        _ => without_digest,
    };

    match without_tag.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            rest
        }
        _ => without_tag,
    }
}
