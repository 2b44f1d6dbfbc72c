//! Infrastructure provisioning through the Pulumi CLI
//!
//! Each operation runs in its own temporary workspace holding a generated
//! YAML program, against the shared state backend.

use crate::models::ScalingBounds;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ops_common::StackIdentity;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

/// Stack output carrying the public address of the service
pub const SERVICE_URL_OUTPUT: &str = "serviceUrl";

const PROVIDER: &str = "gcp";
const IAM_BINDING_RESOURCE: &str = "public-access";
const INVOKER_ROLE: &str = "roles/run.invoker";
const PUBLIC_MEMBER: &str = "allUsers";

/// Desired shape of one compute service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub service_name: String,
    pub image: String,
    pub scaling: ScalingBounds,
    pub location: String,
    pub project_id: String,
}

/// Result of a successful create-or-update
#[derive(Debug, Clone, Default)]
pub struct UpSummary {
    pub outputs: HashMap<String, Value>,
    /// Operation kind ("create", "update", "same", ...) to resource count
    pub resource_changes: BTreeMap<String, u64>,
}

impl UpSummary {
    /// Sum over every operation kind, "same" included
    pub fn total_changes(&self) -> u64 {
        self.resource_changes.values().sum()
    }

    pub fn service_url(&self) -> Option<String> {
        self.outputs
            .get(SERVICE_URL_OUTPUT)
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }
}

/// IaC engine operations used by the orchestrator
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Create the stack if needed, refresh it, then converge it on `spec`
    async fn up(&self, stack: &StackIdentity, spec: &ServiceSpec) -> Result<UpSummary>;

    /// Reconcile recorded state with live resources; the stack must exist
    async fn refresh(&self, stack: &StackIdentity) -> Result<()>;

    /// Tear down every resource in the stack; the stack must exist
    async fn destroy(&self, stack: &StackIdentity) -> Result<()>;

    /// Remove the engine's bookkeeping entry for the stack
    async fn remove_stack(&self, stack: &StackIdentity) -> Result<()>;
}

/// Settings for [`PulumiCli`]
#[derive(Debug, Clone)]
pub struct PulumiSettings {
    pub binary: String,
    pub backend_url: String,
    pub gcp_project: String,
    pub plugin_version: String,
    pub passphrase: String,
    pub work_dir: Option<PathBuf>,
}

/// [`ProvisioningEngine`] driving the `pulumi` executable
pub struct PulumiCli {
    settings: PulumiSettings,
}

impl PulumiCli {
    pub fn new(settings: PulumiSettings) -> Self {
        Self { settings }
    }

    /// Write the program into a fresh workspace, select the stack and prepare
    /// provider plugin and config
    async fn prepare(
        &self,
        stack: &StackIdentity,
        spec: Option<&ServiceSpec>,
    ) -> Result<TempDir> {
        let workspace = match &self.settings.work_dir {
            Some(dir) => tempfile::Builder::new().prefix("pulumi-").tempdir_in(dir),
            None => tempfile::Builder::new().prefix("pulumi-").tempdir(),
        }
        .context("Failed to create engine workspace")?;

        let program = render_program(stack.project_name(), spec);
        let program = serde_json::to_vec_pretty(&program).context("Failed to render program")?;
        tokio::fs::write(workspace.path().join("Pulumi.yaml"), program)
            .await
            .context("Failed to write Pulumi.yaml")?;

        let mut select = vec!["stack", "select", stack.stack_name()];
        if spec.is_some() {
            select.push("--create");
        }
        self.run(workspace.path(), &select)
            .await
            .context("Failed to create or select stack")?;

        self.run(
            workspace.path(),
            &["plugin", "install", "resource", PROVIDER, self.settings.plugin_version.as_str()],
        )
        .await
        .context("Failed to install GCP plugin")?;

        self.run(
            workspace.path(),
            &[
                "config",
                "set",
                "gcp:project",
                self.settings.gcp_project.as_str(),
                "--stack",
                stack.stack_name(),
            ],
        )
        .await
        .context("Failed to set stack config")?;

        Ok(workspace)
    }

    async fn run(&self, workspace: &Path, args: &[&str]) -> Result<String> {
        debug!("pulumi {}", args.join(" "));

        let output = Command::new(&self.settings.binary)
            .args(args)
            .arg("--non-interactive")
            .current_dir(workspace)
            .env("PULUMI_BACKEND_URL", &self.settings.backend_url)
            .env("PULUMI_CONFIG_PASSPHRASE", &self.settings.passphrase)
            .env("PULUMI_SKIP_UPDATE_CHECK", "true")
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.settings.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("pulumi {} failed: {}", args.join(" "), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProvisioningEngine for PulumiCli {
    async fn up(&self, stack: &StackIdentity, spec: &ServiceSpec) -> Result<UpSummary> {
        let workspace = self.prepare(stack, Some(spec)).await?;
        let dir = workspace.path();
        let name = stack.stack_name();

        self.run(dir, &["refresh", "--yes", "--stack", name])
            .await
            .context("Failed to refresh stack")?;

        self.run(dir, &["up", "--yes", "--skip-preview", "--stack", name])
            .await
            .context("Failed to update stack")?;

        let history = self
            .run(dir, &["stack", "history", "--json", "--page-size", "1", "--stack", name])
            .await
            .context("Failed to read stack history")?;
        let resource_changes = parse_resource_changes(&history)?;

        let outputs = self
            .run(dir, &["stack", "output", "--json", "--stack", name])
            .await
            .context("Failed to read stack outputs")?;
        let outputs = parse_outputs(&outputs)?;

        info!("Stack {} updated: {:?}", stack, resource_changes);

        Ok(UpSummary {
            outputs,
            resource_changes,
        })
    }

    async fn refresh(&self, stack: &StackIdentity) -> Result<()> {
        let workspace = self.prepare(stack, None).await?;
        self.run(workspace.path(), &["refresh", "--yes", "--stack", stack.stack_name()])
            .await
            .context("Failed to refresh stack")?;
        Ok(())
    }

    async fn destroy(&self, stack: &StackIdentity) -> Result<()> {
        let workspace = self.prepare(stack, None).await?;
        self.run(workspace.path(), &["destroy", "--yes", "--stack", stack.stack_name()])
            .await
            .context("Failed to destroy stack")?;

        info!("Stack {} destroyed", stack);
        Ok(())
    }

    async fn remove_stack(&self, stack: &StackIdentity) -> Result<()> {
        let workspace = self.prepare(stack, None).await?;
        self.run(workspace.path(), &["stack", "rm", stack.stack_name(), "--yes"])
            .await
            .context("Failed to remove stack")?;
        Ok(())
    }
}

/// Build the YAML program (as JSON, which YAML accepts).
///
/// Without a service only the project header is emitted; refresh, destroy and
/// stack removal never evaluate the program.
pub fn render_program(project_name: &str, spec: Option<&ServiceSpec>) -> Value {
    let Some(spec) = spec else {
        return json!({ "name": project_name, "runtime": "yaml" });
    };

    let scaling = json!({
        "minInstanceCount": spec.scaling.min_instances,
        "maxInstanceCount": spec.scaling.max_instances,
    });
    let service = &spec.service_name;

    json!({
        "name": project_name,
        "runtime": "yaml",
        "resources": {
            service: {
                "type": "gcp:cloudrunv2:Service",
                "properties": {
                    "name": service,
                    "location": spec.location,
                    "project": spec.project_id,
                    "deletionProtection": false,
                    "scaling": scaling,
                    "template": {
                        "scaling": scaling,
                        "containers": [{ "image": spec.image }],
                    },
                },
            },
            IAM_BINDING_RESOURCE: {
                "type": "gcp:cloudrunv2:ServiceIamBinding",
                "properties": {
                    "project": spec.project_id,
                    "location": spec.location,
                    "name": format!("${{{}.name}}", service),
                    "role": INVOKER_ROLE,
                    "members": [PUBLIC_MEMBER],
                },
            },
        },
        "outputs": {
            SERVICE_URL_OUTPUT: format!("${{{}.uri}}", service),
        },
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    #[serde(default)]
    resource_changes: Option<BTreeMap<String, u64>>,
}

/// Change counts of the most recent update in `pulumi stack history --json`
fn parse_resource_changes(history: &str) -> Result<BTreeMap<String, u64>> {
    let entries: Vec<HistoryEntry> =
        serde_json::from_str(history).context("Failed to parse stack history")?;

    Ok(entries
        .into_iter()
        .next()
        .and_then(|entry| entry.resource_changes)
        .unwrap_or_default())
}

fn parse_outputs(outputs: &str) -> Result<HashMap<String, Value>> {
    if outputs.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(outputs).context("Failed to parse stack outputs")
}
