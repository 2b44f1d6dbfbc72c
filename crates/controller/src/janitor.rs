//! Best-effort removal of IaC engine state objects after a teardown

use anyhow::Result;
use async_trait::async_trait;
use ops_common::StackIdentity;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One page of object names from a listing
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub names: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Remote object store holding engine state
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list_page(&self, prefix: &str, page_token: Option<&str>) -> Result<ObjectPage>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub errors: Vec<String>,
}

/// Deletes the state objects a destroyed stack leaves behind
#[derive(Clone)]
pub struct StateJanitor {
    store: Arc<dyn BlobStore>,
}

impl StateJanitor {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Single reconciliation pass. Never fails; problems end up in the report.
    pub async fn sweep(&self, stack: &StackIdentity) -> CleanupReport {
        let mut report = CleanupReport::default();

        let mut selected: Vec<String> = self
            .enumerate(&mut report)
            .await
            .into_iter()
            .filter(|name| belongs_to_stack(name, stack))
            .collect();
        selected.sort();

        let mut deleted = BTreeSet::new();
        // Deepest paths first so directory markers go after their children
        for name in selected.iter().rev() {
            match self.store.delete(name).await {
                Ok(()) => {
                    debug!("Deleted state object {}", name);
                    report.removed += 1;
                    deleted.insert(name.as_str());
                }
                Err(e) => {
                    warn!("Failed to delete state object {}: {:#}", name, e);
                    report.errors.push(format!("{}: {:#}", name, e));
                }
            }
        }

        for marker in directory_markers(stack.project_name()) {
            if deleted.contains(marker.as_str()) {
                continue;
            }
            match self.store.delete(&marker).await {
                Ok(()) => {
                    debug!("Deleted directory marker {}", marker);
                    report.removed += 1;
                }
                Err(e) => debug!("Directory marker {} not deleted: {:#}", marker, e),
            }
        }

        if report.removed > 0 {
            info!("Removed {} state objects for {}", report.removed, stack);
        } else {
            info!("No state objects found for {}", stack);
        }

        report
    }

    /// Every object name in the store; stops at the first failing page and
    /// keeps what was already listed
    async fn enumerate(&self, report: &mut CleanupReport) -> Vec<String> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            match self.store.list_page("", page_token.as_deref()).await {
                Ok(page) => {
                    names.extend(page.names.into_iter().filter(|name| !name.is_empty()));
                    match page.next_page_token {
                        Some(token) => page_token = Some(token),
                        None => break,
                    }
                }
                Err(e) => {
                    warn!("Error listing state objects: {:#}", e);
                    report.errors.push(format!("list: {:#}", e));
                    break;
                }
            }
        }

        names
    }
}

/// The two canonical marker paths for a project's stack directory
pub fn directory_markers(project_name: &str) -> [String; 2] {
    [
        format!(".pulumi/stacks/{}/", project_name),
        format!(".pulumi/stacks/{}", project_name),
    ]
}

/// Whether a state object belongs to the stack.
///
/// The object must sit under the project's directory. Objects that name a
/// stack must name this one, so a sweep never touches another owner's stack
/// in a project of the same name, nor a project whose name merely extends
/// this one (`project-api` vs `project-api-v2`).
pub fn belongs_to_stack(name: &str, stack: &StackIdentity) -> bool {
    let segments: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();

    if !segments.iter().any(|s| *s == stack.project_name()) {
        return false;
    }

    let names_a_stack = segments.iter().any(|s| s.starts_with("stack-"));
    if !names_a_stack {
        return true;
    }

    let stack_name = stack.stack_name();
    segments.iter().any(|s| {
        *s == stack_name
            || s.strip_prefix(stack_name)
                .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'))
    })
}
