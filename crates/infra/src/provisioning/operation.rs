//! Provisioning operation lifecycle.
//!
//! ```text
//! Uninitialized -> WorkspaceReady -> Applied | Destroyed | FailedRolledBack -> CleanedUp
//! ```
//!
//! `initialize` prepares an isolated workspace without touching the cloud.
//! `apply` and `destroy` run the provider program on the blocking pool. A
//! failed apply always attempts a destroy before returning its own error.
//! `cleanup_workspace` removes the workspace; if the operation is dropped
//! instead (runner timeout), the in-flight program call is cancelled, its
//! process is killed and the workspace removes itself once that call returns.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use openlabs_core::UserId;
use openlabs_ranges::{BlueprintRange, DeployedRange, RangeLayout, Region, stack_name};

use super::ProvisioningError;
use super::bootstrap::bootstrap_provider;
use super::outputs::{RangeMeta, parse_outputs};
use super::program::{DestroyRun, InfraProgram, OpResult, ProgramError, run_blocking};
use super::provider::ProviderRegistry;
use super::secrets::ProviderSecrets;
use super::workspace::{DeploymentId, Workspace};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationState {
    Uninitialized,
    WorkspaceReady,
    Applied,
    Destroyed,
    FailedRolledBack,
    CleanedUp,
}

/// Outcome of a teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyResult {
    pub succeeded: bool,
    pub already_absent: bool,
    pub summary: String,
}

#[derive(Debug)]
enum Target {
    Deploy,
    Destroy { snapshot: JsonValue },
}

/// Shared provisioning dependencies.
#[derive(Debug, Clone)]
pub struct Provisioner {
    registry: Arc<ProviderRegistry>,
    workspace_root: PathBuf,
}

impl Provisioner {
    pub fn new(registry: Arc<ProviderRegistry>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            workspace_root: workspace_root.into(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Deploy `blueprint` and return the fully populated range.
    pub async fn deploy(
        &self,
        blueprint: BlueprintRange,
        region: Region,
        owner: UserId,
        secrets: ProviderSecrets,
    ) -> Result<DeployedRange, ProvisioningError> {
        let mut op = ProvisioningOperation::for_deploy(self, blueprint, region, owner, secrets)?;
        let result = match op.initialize().await {
            Ok(()) => op.apply().await,
            Err(e) => Err(e),
        };
        op.cleanup_workspace().await;
        result
    }

    /// Tear down a deployed range from its recorded state snapshot.
    pub async fn destroy(
        &self,
        range: &DeployedRange,
        secrets: ProviderSecrets,
    ) -> Result<DestroyResult, ProvisioningError> {
        let mut op = ProvisioningOperation::for_destroy(self, range, secrets)?;
        let result = match op.initialize().await {
            Ok(()) => op.destroy().await,
            Err(e) => Err(e),
        };
        op.cleanup_workspace().await;
        result
    }
}

pub struct ProvisioningOperation {
    registry: Arc<ProviderRegistry>,
    workspace_root: PathBuf,
    blueprint: BlueprintRange,
    layout: RangeLayout,
    region: Region,
    owner: UserId,
    secrets: ProviderSecrets,
    deployment_id: DeploymentId,
    target: Target,
    state: OperationState,
    workspace: Option<Arc<Workspace>>,
    program: Option<Arc<dyn InfraProgram>>,
}

impl ProvisioningOperation {
    pub fn for_deploy(
        provisioner: &Provisioner,
        blueprint: BlueprintRange,
        region: Region,
        owner: UserId,
        secrets: ProviderSecrets,
    ) -> Result<Self, ProvisioningError> {
        blueprint.validate()?;
        Self::new(provisioner, blueprint, region, owner, secrets, Target::Deploy)
    }

    pub fn for_destroy(
        provisioner: &Provisioner,
        range: &DeployedRange,
        secrets: ProviderSecrets,
    ) -> Result<Self, ProvisioningError> {
        Self::new(
            provisioner,
            range.to_blueprint(),
            range.region,
            range.owner,
            secrets,
            Target::Destroy {
                snapshot: range.state_snapshot.clone(),
            },
        )
    }

    fn new(
        provisioner: &Provisioner,
        blueprint: BlueprintRange,
        region: Region,
        owner: UserId,
        secrets: ProviderSecrets,
        target: Target,
    ) -> Result<Self, ProvisioningError> {
        let deployment_id = DeploymentId::generate();
        let stack = stack_name(&blueprint.name, deployment_id.as_str())?;
        let layout = RangeLayout::plan(&blueprint, &stack)?;
        Ok(Self {
            registry: provisioner.registry.clone(),
            workspace_root: provisioner.workspace_root.clone(),
            blueprint,
            layout,
            region,
            owner,
            secrets,
            deployment_id,
            target,
            state: OperationState::Uninitialized,
            workspace: None,
            program: None,
        })
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn deployment_id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    pub fn stack_name(&self) -> &str {
        &self.layout.stack_name
    }

    pub fn workspace_path(&self) -> Option<PathBuf> {
        self.workspace.as_ref().map(|ws| ws.path().to_path_buf())
    }

    /// Select the plugin, create the workspace and configure the program.
    pub async fn initialize(&mut self) -> Result<(), ProvisioningError> {
        if self.state != OperationState::Uninitialized {
            return Err(self.invalid_state("initialize"));
        }

        let provider = self.blueprint.provider;
        let plugin = self
            .registry
            .lookup(provider)
            .ok_or(ProvisioningError::UnsupportedProvider(provider))?;
        if !plugin.has_required_secrets(&self.secrets) {
            return Err(ProvisioningError::MissingSecrets(provider));
        }
        bootstrap_provider(plugin.clone()).await?;

        let workspace = Workspace::create(&self.workspace_root, &self.deployment_id, &self.blueprint.name)
            .await
            .map_err(|e| ProvisioningError::Workspace(e.to_string()))?;
        self.workspace = Some(workspace.clone());

        let program = plugin.build_program(&self.blueprint, &self.layout, self.region)?;
        let values = plugin.config_values(&self.secrets, self.region)?;
        {
            let (program, workspace) = (program.clone(), workspace.clone());
            run_blocking(move |cancel| program.configure(workspace.path(), &values, cancel)).await?;
        }

        if let Target::Destroy { snapshot } = &self.target {
            let (program, workspace, snapshot) = (program.clone(), workspace.clone(), snapshot.clone());
            run_blocking(move |_| program.import_state(workspace.path(), &snapshot)).await?;
        }

        self.program = Some(program);
        self.state = OperationState::WorkspaceReady;
        debug!(
            deployment_id = %self.deployment_id,
            stack = %self.layout.stack_name,
            provider = %provider,
            "provisioning workspace ready"
        );
        Ok(())
    }

    /// Create the range. On any failure after the program started, destroys
    /// whatever exists and returns the original error.
    pub async fn apply(&mut self) -> Result<DeployedRange, ProvisioningError> {
        if !matches!(self.target, Target::Deploy) {
            return Err(self.invalid_state("apply"));
        }
        let (workspace, program) = self.ready("apply")?;
        info!(
            deployment_id = %self.deployment_id,
            stack = %self.layout.stack_name,
            hosts = self.blueprint.host_count(),
            "applying range"
        );

        match self.run_apply(workspace.clone(), program.clone()).await {
            Ok(range) => {
                self.state = OperationState::Applied;
                info!(deployment_id = %self.deployment_id, range_id = %range.id, "range applied");
                Ok(range)
            }
            Err(apply_err) => {
                self.rollback(workspace, program, &apply_err).await;
                self.state = OperationState::FailedRolledBack;
                Err(apply_err)
            }
        }
    }

    async fn run_apply(
        &self,
        workspace: Arc<Workspace>,
        program: Arc<dyn InfraProgram>,
    ) -> Result<DeployedRange, ProvisioningError> {
        let up = {
            let (program, workspace) = (program.clone(), workspace.clone());
            run_blocking(move |cancel| program.up(workspace.path(), cancel)).await?
        };
        if up.result != OpResult::Succeeded {
            return Err(ProvisioningError::ApplyFailed(up.summary));
        }

        let snapshot = run_blocking(move |cancel| program.export_state(workspace.path(), cancel)).await?;
        parse_outputs(
            &self.blueprint,
            &self.layout,
            &up.outputs,
            RangeMeta {
                owner: self.owner,
                region: self.region,
                created_at: Utc::now(),
                state_snapshot: snapshot,
            },
        )
    }

    async fn rollback(
        &self,
        workspace: Arc<Workspace>,
        program: Arc<dyn InfraProgram>,
        cause: &ProvisioningError,
    ) {
        warn!(
            deployment_id = %self.deployment_id,
            stack = %self.layout.stack_name,
            error = %cause,
            "apply failed; destroying partial infrastructure"
        );
        match run_destroy(workspace, program).await {
            Ok(run) if run.result == OpResult::Succeeded => {
                info!(deployment_id = %self.deployment_id, "rollback destroy succeeded");
            }
            Ok(run) => error!(
                deployment_id = %self.deployment_id,
                stack = %self.layout.stack_name,
                summary = %run.summary,
                "rollback destroy failed; cloud resources may be orphaned"
            ),
            Err(e) => error!(
                deployment_id = %self.deployment_id,
                stack = %self.layout.stack_name,
                error = %e,
                "rollback destroy errored; cloud resources may be orphaned"
            ),
        }
    }

    /// Tear down everything the workspace's program knows about.
    pub async fn destroy(&mut self) -> Result<DestroyResult, ProvisioningError> {
        let (workspace, program) = match self.state {
            OperationState::WorkspaceReady | OperationState::Applied => self.handles("destroy")?,
            _ => return Err(self.invalid_state("destroy")),
        };
        info!(deployment_id = %self.deployment_id, stack = %self.layout.stack_name, "destroying range");

        let run = run_destroy(workspace, program).await?;
        let succeeded = run.result == OpResult::Succeeded;
        if succeeded {
            self.state = OperationState::Destroyed;
        } else {
            warn!(deployment_id = %self.deployment_id, summary = %run.summary, "destroy did not succeed");
        }
        Ok(DestroyResult {
            succeeded,
            already_absent: run.already_absent,
            summary: run.summary,
        })
    }

    /// Remove the workspace. Never fails; problems are logged.
    pub async fn cleanup_workspace(&mut self) {
        self.program = None;
        if let Some(workspace) = self.workspace.take() {
            let path = workspace.path().to_path_buf();
            match tokio::task::spawn_blocking(move || workspace.remove()).await {
                Ok(Ok(())) => debug!(path = %path.display(), "workspace removed"),
                Ok(Err(e)) => warn!(path = %path.display(), error = %e, "failed to remove workspace"),
                Err(e) => warn!(path = %path.display(), error = %e, "workspace cleanup aborted"),
            }
        }
        self.state = OperationState::CleanedUp;
    }

    fn ready(&self, operation: &'static str) -> Result<(Arc<Workspace>, Arc<dyn InfraProgram>), ProvisioningError> {
        if self.state != OperationState::WorkspaceReady {
            return Err(self.invalid_state(operation));
        }
        self.handles(operation)
    }

    fn handles(&self, operation: &'static str) -> Result<(Arc<Workspace>, Arc<dyn InfraProgram>), ProvisioningError> {
        match (&self.workspace, &self.program) {
            (Some(workspace), Some(program)) => Ok((workspace.clone(), program.clone())),
            _ => Err(self.invalid_state(operation)),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> ProvisioningError {
        ProvisioningError::InvalidState {
            operation,
            state: self.state,
        }
    }
}

async fn run_destroy(
    workspace: Arc<Workspace>,
    program: Arc<dyn InfraProgram>,
) -> Result<DestroyRun, ProgramError> {
    run_blocking(move |cancel| program.destroy(workspace.path(), cancel)).await
}

impl Drop for ProvisioningOperation {
    fn drop(&mut self) {
        if self.state == OperationState::WorkspaceReady && self.workspace.is_some() {
            error!(
                deployment_id = %self.deployment_id,
                stack = %self.layout.stack_name,
                "provisioning operation dropped before cleanup; running program calls are killed and cloud resources may be orphaned"
            );
        }
    }
}
