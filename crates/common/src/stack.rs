//! Deterministic naming for the infrastructure stack behind a deployment.
//!
//! The stack name doubles as the idempotency key for the IaC engine, so it
//! must be stable for a given (owner, deployment name) pair and must not
//! collide across owners who pick the same deployment name.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of hex characters of the owner digest embedded in stack names
pub const OWNER_DIGEST_LEN: usize = 8;

/// Stack and project names for one deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StackIdentity {
    stack_name: String,
    project_name: String,
}

impl StackIdentity {
    /// Resolve the stack identity for `deployment_name` owned by `owner`.
    ///
    /// `stack-{name}-{first 8 hex chars of sha256(owner)}` and `project-{name}`.
    pub fn resolve(owner: &str, deployment_name: &str) -> Self {
        Self {
            stack_name: format!("stack-{}-{}", deployment_name, owner_digest(owner)),
            project_name: format!("project-{}", deployment_name),
        }
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    /// Project name, also the path segment under which engine state is stored
    pub fn project_name(&self) -> &str {
        &self.project_name
    }
}

impl fmt::Display for StackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_name, self.stack_name)
    }
}

/// Short, non-reversible digest of an owner identity
pub fn owner_digest(owner: &str) -> String {
    let digest = Sha256::digest(owner.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(OWNER_DIGEST_LEN);
    encoded
}
