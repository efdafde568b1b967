//! Task bodies run by the worker.

pub mod deploy;
pub mod destroy;
pub mod maintenance;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::jobs::{JobRunner, TaskError};
use crate::provisioning::Provisioner;
use crate::stores::{BlueprintStore, CredentialStore, RangeStore};

pub use deploy::{DeployRangeArgs, DeployRangeTask};
pub use destroy::{DestroyRangeArgs, DestroyRangeTask};
pub use maintenance::{PurgeJobsTask, ReportStaleJobsTask, scheduled_task_id, system_owner};

pub const DEPLOY_RANGE: &str = "deploy_range";
pub const DESTROY_RANGE: &str = "destroy_range";
pub const PURGE_JOBS: &str = "purge_jobs";
pub const REPORT_STALE_JOBS: &str = "report_stale_jobs";

/// Collaborators shared by the range tasks.
#[derive(Clone)]
pub struct RangeTaskDeps {
    pub blueprints: Arc<dyn BlueprintStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub ranges: Arc<dyn RangeStore>,
    pub provisioner: Provisioner,
}

/// Register the deploy and destroy tasks.
pub fn register_range_tasks(runner: &mut JobRunner, deps: RangeTaskDeps) {
    runner.register(Arc::new(DeployRangeTask::new(deps.clone())));
    runner.register(Arc::new(DestroyRangeTask::new(deps)));
}

pub(crate) fn parse_args<T: DeserializeOwned>(args: JsonValue) -> Result<T, TaskError> {
    serde_json::from_value(args).map_err(|e| TaskError::InvalidArgs(e.to_string()))
}
