use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{error, info};

use openlabs_auth::Requester;
use openlabs_core::BlueprintId;
use openlabs_ranges::Region;

use crate::jobs::{Task, TaskContext, TaskError};
use crate::provisioning::MasterKey;

use super::{DEPLOY_RANGE, RangeTaskDeps, parse_args};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRangeArgs {
    pub blueprint_id: BlueprintId,
    pub region: Region,
    /// Name of the deployed range (defaults to the blueprint's).
    pub name: Option<String>,
    pub description: Option<String>,
    pub requester: Requester,
    pub master_key: MasterKey,
}

/// Deploy a blueprint and persist the resulting range.
///
/// The range record is written last; if that write fails the new
/// infrastructure is destroyed again so no untracked range is left running.
pub struct DeployRangeTask {
    deps: RangeTaskDeps,
}

impl DeployRangeTask {
    pub fn new(deps: RangeTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for DeployRangeTask {
    fn name(&self) -> &'static str {
        DEPLOY_RANGE
    }

    async fn run(&self, ctx: &mut TaskContext, args: JsonValue) -> Result<JsonValue, TaskError> {
        let args: DeployRangeArgs = parse_args(args)?;
        let owner = args.requester.user_id;

        let mut blueprint = self
            .deps
            .blueprints
            .get_blueprint(args.blueprint_id, &args.requester)
            .await
            .map_err(anyhow::Error::from)?
            .ok_or_else(|| anyhow!("blueprint {} not found", args.blueprint_id))?;
        if let Some(name) = args.name {
            blueprint.name = name;
        }
        if let Some(description) = args.description {
            blueprint.description = description;
        }

        let secrets = self
            .deps
            .credentials
            .get_decrypted_secrets(owner, &args.master_key)
            .await
            .map_err(anyhow::Error::from)?
            .ok_or_else(|| anyhow!("no cloud credentials stored for user {owner}"))?;

        info!(
            task_id = %ctx.task_id,
            attempt = ctx.attempt,
            blueprint_id = %blueprint.id,
            provider = %blueprint.provider,
            region = %args.region,
            "deploying range"
        );
        let range = self
            .deps
            .provisioner
            .deploy(blueprint, args.region, owner, secrets.clone())
            .await
            .map_err(anyhow::Error::from)?;

        if let Err(store_err) = self.deps.ranges.create(&range).await {
            error!(
                task_id = %ctx.task_id,
                range_id = %range.id,
                error = %store_err,
                "failed to persist deployed range; destroying it"
            );
            match self.deps.provisioner.destroy(&range, secrets).await {
                Ok(result) if result.succeeded => {}
                Ok(result) => error!(
                    range_id = %range.id,
                    summary = %result.summary,
                    "destroy of unpersisted range failed; cloud resources may be orphaned"
                ),
                Err(e) => error!(
                    range_id = %range.id,
                    error = %e,
                    "destroy of unpersisted range errored; cloud resources may be orphaned"
                ),
            }
            return Err(anyhow!("failed to save deployed range: {store_err}").into());
        }

        info!(task_id = %ctx.task_id, range_id = %range.id, "range deployed");
        Ok(json!({ "range_id": range.id, "name": range.name }))
    }
}
