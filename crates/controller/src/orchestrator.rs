//! Deployment lifecycle: provisioning, bookkeeping and teardown
//!
//! The record store says whether a deployment exists for its owner; the
//! engine's stack says whether compute is running. Every operation here
//! either leaves both in agreement or returns a partial-failure error naming
//! the side that succeeded.

use crate::janitor::{CleanupReport, StateJanitor};
use crate::models::{
    Deployment, DeploymentChanges, DeploymentSpec, NewDeployment, ServiceAddress,
};
use crate::provisioner::{ProvisioningEngine, ServiceSpec};
use crate::storage::{DeploymentStore, ImageStore};
use ops_common::{Error, Result, StackIdentity};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a create-or-update
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub deployment: Deployment,
    pub address: ServiceAddress,
    /// False when an existing deployment was updated
    pub created: bool,
}

/// Progress of a single delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStage {
    /// Record located for the owner
    Found,
    /// Refresh (best-effort) then destroy; failure keeps the record
    Destroying,
    /// Resources gone; stack entry removed best-effort
    Destroyed,
    /// Failure here is a partial failure: compute is gone, the row is stale
    RecordDeleting,
    RecordDeleted,
    /// Janitor pass; never fails
    StateCleaning,
    Done,
}

/// Result of a completed delete
#[derive(Debug, Clone)]
pub struct DeleteReport {
    pub name: String,
    pub stack: StackIdentity,
    pub cleanup: CleanupReport,
}

impl DeleteReport {
    pub fn message(&self) -> String {
        format!("Deployment '{}' deleted successfully", self.name)
    }
}

/// Composes the record store, the IaC engine and the state janitor
#[derive(Clone)]
pub struct Orchestrator {
    deployments: Arc<dyn DeploymentStore>,
    images: Arc<dyn ImageStore>,
    engine: Arc<dyn ProvisioningEngine>,
    janitor: StateJanitor,
    location: String,
    project_id: String,
}

impl Orchestrator {
    pub fn new(
        deployments: Arc<dyn DeploymentStore>,
        images: Arc<dyn ImageStore>,
        engine: Arc<dyn ProvisioningEngine>,
        janitor: StateJanitor,
        location: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            deployments,
            images,
            engine,
            janitor,
            location: location.into(),
            project_id: project_id.into(),
        }
    }

    /// Provision (or re-provision) a deployment and record the result.
    ///
    /// Nothing is written unless the engine succeeded with at least one
    /// reported resource change.
    pub async fn create_or_update(&self, owner: &str, spec: DeploymentSpec) -> Result<DeployOutcome> {
        let existing = self
            .deployments
            .find(&spec.name, owner)
            .await
            .map_err(|e| Error::Storage(format!("Failed to check existing deployments: {:#}", e)))?;

        let image_known = self
            .images
            .image_exists(&spec.container_image)
            .await
            .map_err(|e| Error::Storage(format!("Failed to check container image: {:#}", e)))?;
        if !image_known {
            return Err(Error::InvalidRequest(format!(
                "container image {} has not been pushed",
                spec.container_image
            )));
        }

        let stack = StackIdentity::resolve(owner, &spec.name);
        let service = ServiceSpec {
            service_name: spec.name.clone(),
            image: spec.container_image.clone(),
            scaling: spec.scaling,
            location: self.location.clone(),
            project_id: self.project_id.clone(),
        };

        info!(
            stack = %stack,
            update = existing.is_some(),
            "Provisioning deployment {}",
            spec.name
        );

        let summary = self
            .engine
            .up(&stack, &service)
            .await
            .map_err(|e| Error::Infrastructure(format!("{:#}", e)))?;

        if summary.total_changes() == 0 {
            warn!(stack = %stack, "No resource operations performed");
            return Err(Error::Infrastructure(
                "Deployment completed but no resources were changed".to_string(),
            ));
        }

        let address = match summary.service_url() {
            Some(url) => ServiceAddress::Available(url),
            None => {
                warn!(stack = %stack, "Service URL missing from stack outputs");
                ServiceAddress::Unavailable
            }
        };

        let recorded = match &existing {
            Some(current) => {
                let changes = DeploymentChanges {
                    container_image: spec.container_image.clone(),
                    scaling: spec.scaling,
                    url: address.known(),
                };
                self.deployments.update(current.id, &changes).await
            }
            None => {
                let new = NewDeployment {
                    name: spec.name.clone(),
                    url: address.stored_value().to_string(),
                    container_image: spec.container_image.clone(),
                    user_email: owner.to_string(),
                    scaling: spec.scaling,
                };
                self.deployments.insert(&new).await
            }
        };

        let deployment = recorded.map_err(|e| {
            warn!(stack = %stack, "Provisioned but failed to record deployment: {:#}", e);
            Error::ProvisionedButNotRecorded {
                name: spec.name.clone(),
                reason: format!("{:#}", e),
            }
        })?;

        info!(id = %deployment.id, "Deployment {} is live at {}", deployment.name, address.as_response());

        Ok(DeployOutcome {
            deployment,
            address,
            created: existing.is_none(),
        })
    }

    /// Fetch an owner's deployment
    pub async fn get(&self, owner: &str, name: &str) -> Result<Deployment> {
        self.find_owned(owner, name).await
    }

    /// Tear a deployment down and forget it
    pub async fn delete(&self, owner: &str, name: &str) -> Result<DeleteReport> {
        let deployment = self.find_owned(owner, name).await?;
        let mut operation = DeleteOperation {
            stack: StackIdentity::resolve(owner, name),
            deployment,
            stage: DeleteStage::Found,
            cleanup: CleanupReport::default(),
        };

        while operation.stage != DeleteStage::Done {
            self.advance(&mut operation).await?;
        }

        Ok(DeleteReport {
            name: operation.deployment.name,
            stack: operation.stack,
            cleanup: operation.cleanup,
        })
    }

    async fn advance(&self, op: &mut DeleteOperation) -> Result<()> {
        debug!(stack = %op.stack, stage = ?op.stage, "Delete step");

        op.stage = match op.stage {
            DeleteStage::Found => DeleteStage::Destroying,

            DeleteStage::Destroying => {
                if let Err(e) = self.engine.refresh(&op.stack).await {
                    warn!(stack = %op.stack, "Failed to refresh stack: {:#}", e);
                }

                self.engine.destroy(&op.stack).await.map_err(|e| {
                    Error::Infrastructure(format!("Failed to destroy Cloud Run resources: {:#}", e))
                })?;

                info!(stack = %op.stack, "Successfully destroyed stack");
                DeleteStage::Destroyed
            }

            DeleteStage::Destroyed => {
                if let Err(e) = self.engine.remove_stack(&op.stack).await {
                    warn!(stack = %op.stack, "Failed to remove stack: {:#}", e);
                }
                DeleteStage::RecordDeleting
            }

            DeleteStage::RecordDeleting => {
                let removed = self.deployments.delete(op.deployment.id).await.map_err(|e| {
                    Error::DestroyedButNotRemoved {
                        name: op.deployment.name.clone(),
                        reason: format!("{:#}", e),
                    }
                })?;

                if !removed {
                    warn!(id = %op.deployment.id, "Deployment record was already gone");
                }
                DeleteStage::RecordDeleted
            }

            DeleteStage::RecordDeleted => DeleteStage::StateCleaning,

            DeleteStage::StateCleaning => {
                op.cleanup = self.janitor.sweep(&op.stack).await;
                DeleteStage::Done
            }

            DeleteStage::Done => DeleteStage::Done,
        };

        Ok(())
    }

    async fn find_owned(&self, owner: &str, name: &str) -> Result<Deployment> {
        self.deployments
            .find(name, owner)
            .await
            .map_err(|e| Error::Storage(format!("Failed to look up deployment: {:#}", e)))?
            .ok_or_else(|| Error::NotFound(format!("Deployment '{}'", name)))
    }
}

struct DeleteOperation {
    stack: StackIdentity,
    deployment: Deployment,
    stage: DeleteStage,
    cleanup: CleanupReport,
}
