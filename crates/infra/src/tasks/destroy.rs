use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use openlabs_auth::Requester;
use openlabs_core::RangeId;

use crate::jobs::{Task, TaskContext, TaskError};
use crate::provisioning::MasterKey;
use crate::stores::StoreError;

use super::{DESTROY_RANGE, RangeTaskDeps, parse_args};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRangeArgs {
    pub range_id: RangeId,
    pub requester: Requester,
    pub master_key: MasterKey,
}

/// Tear down a deployed range and delete its record.
///
/// A range that is already gone counts as destroyed, so a redelivered destroy
/// completes instead of failing.
pub struct DestroyRangeTask {
    deps: RangeTaskDeps,
}

impl DestroyRangeTask {
    pub fn new(deps: RangeTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Task for DestroyRangeTask {
    fn name(&self) -> &'static str {
        DESTROY_RANGE
    }

    async fn run(&self, ctx: &mut TaskContext, args: JsonValue) -> Result<JsonValue, TaskError> {
        let args: DestroyRangeArgs = parse_args(args)?;

        let Some(range) = self
            .deps
            .ranges
            .get(args.range_id, &args.requester)
            .await
            .map_err(anyhow::Error::from)?
        else {
            warn!(task_id = %ctx.task_id, range_id = %args.range_id, "range already gone");
            return Ok(json!({
                "range_id": args.range_id,
                "destroyed": true,
                "already_absent": true,
            }));
        };

        let foreign = range.owner != args.requester.user_id;
        let secrets = match self
            .deps
            .credentials
            .get_decrypted_secrets(range.owner, &args.master_key)
            .await
        {
            Ok(Some(secrets)) => secrets,
            Ok(None) | Err(StoreError::Decryption(_)) if foreign => {
                return Err(anyhow!(
                    "credentials of range owner {} cannot be unlocked with the master key of requester {}",
                    range.owner,
                    args.requester.user_id
                )
                .into());
            }
            Ok(None) => return Err(anyhow!("no cloud credentials stored for user {}", range.owner).into()),
            Err(e) => return Err(anyhow::Error::from(e).into()),
        };

        info!(task_id = %ctx.task_id, range_id = %range.id, attempt = ctx.attempt, "destroying range");
        let result = self
            .deps
            .provisioner
            .destroy(&range, secrets)
            .await
            .map_err(anyhow::Error::from)?;
        if !result.succeeded {
            return Err(anyhow!("destroy of range {} failed: {}", range.id, result.summary).into());
        }

        self.deps
            .ranges
            .delete(range.id)
            .await
            .map_err(anyhow::Error::from)?;
        info!(task_id = %ctx.task_id, range_id = %range.id, "range destroyed");
        Ok(json!({
            "range_id": range.id,
            "destroyed": true,
            "already_absent": result.already_absent,
        }))
    }
}
