//! Submission gateway: the synchronous request path in front of the queue.
//!
//! Preconditions (target exists and is visible, provider supported,
//! credentials present) are checked before anything is enqueued, so a rejected
//! request never creates a job. The initial ledger row is written best-effort
//! before the task is handed to the queue, so a worker that picks the task up
//! immediately already finds it; the outcome of that write is reported in
//! [`Submission::detail`]. Once the queue has accepted the task the request is
//! accepted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};

use openlabs_auth::Requester;
use openlabs_core::{BlueprintId, DomainError, RangeId, UserId};
use openlabs_ranges::{Provider, Region, normalize_name};

use crate::jobs::{Job, JobLedger, JobLookup, JobStatus, LedgerError, NewJob, ReportedStatus, TaskId};
use crate::provisioning::{MasterKey, ProviderRegistry};
use crate::queue::{QueueError, TaskQueue, TaskRequest};
use crate::stores::{BlueprintStore, CredentialStore, RangeStore, StoreError};
use crate::tasks::{
    DEPLOY_RANGE, DESTROY_RANGE, DeployRangeArgs, DestroyRangeArgs, scheduled_task_id,
    system_owner,
};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("missing cloud credentials for {0}")]
    MissingCredentials(Provider),

    #[error("no provisioning plugin for provider {0}")]
    UnsupportedProvider(Provider),

    /// An admin acting on another user's range: the owner's credentials are
    /// sealed with the owner's master key, not the requester's.
    #[error("credentials of owner {owner} cannot be unlocked with the requester's master key")]
    ForeignCredentials { owner: UserId },

    /// Missing, or owned by someone else.
    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to enqueue task: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whether the initial ledger row was written. Either way the task is queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ledger", content = "error", rename_all = "snake_case")]
pub enum LedgerWrite {
    Recorded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub task_id: TaskId,
    pub detail: LedgerWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub blueprint_id: BlueprintId,
    pub region: Region,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct SubmissionGateway {
    queue: Arc<dyn TaskQueue>,
    ledger: Arc<dyn JobLedger>,
    blueprints: Arc<dyn BlueprintStore>,
    credentials: Arc<dyn CredentialStore>,
    ranges: Arc<dyn RangeStore>,
    registry: Arc<ProviderRegistry>,
}

impl SubmissionGateway {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        ledger: Arc<dyn JobLedger>,
        blueprints: Arc<dyn BlueprintStore>,
        credentials: Arc<dyn CredentialStore>,
        ranges: Arc<dyn RangeStore>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            queue,
            ledger,
            blueprints,
            credentials,
            ranges,
            registry,
        }
    }

    /// Queue a deployment of one of the requester's blueprints.
    #[instrument(skip(self, request, master_key), fields(user_id = %requester.user_id, blueprint_id = %request.blueprint_id))]
    pub async fn submit_deploy(
        &self,
        requester: &Requester,
        request: DeployRequest,
        master_key: MasterKey,
    ) -> Result<Submission, SubmitError> {
        if let Some(name) = &request.name {
            if normalize_name(name).is_empty() {
                return Err(DomainError::validation(format!(
                    "range name {name:?} has no usable characters"
                ))
                .into());
            }
        }

        let blueprint = self
            .blueprints
            .get_blueprint(request.blueprint_id, requester)
            .await?
            .ok_or_else(|| SubmitError::NotFound(format!("blueprint {}", request.blueprint_id)))?;
        blueprint.validate()?;

        self.check_credentials(requester.user_id, requester.user_id, blueprint.provider, &master_key)
            .await?;

        let args = DeployRangeArgs {
            blueprint_id: request.blueprint_id,
            region: request.region,
            name: request.name,
            description: request.description,
            requester: *requester,
            master_key,
        };
        self.submit(requester.user_id, DEPLOY_RANGE, to_args(&args)?)
            .await
    }

    /// Queue the teardown of a deployed range.
    #[instrument(skip(self, master_key), fields(user_id = %requester.user_id, range_id = %range_id))]
    pub async fn submit_destroy(
        &self,
        requester: &Requester,
        range_id: RangeId,
        master_key: MasterKey,
    ) -> Result<Submission, SubmitError> {
        let range = self
            .ranges
            .get(range_id, requester)
            .await?
            .ok_or_else(|| SubmitError::NotFound(format!("range {range_id}")))?;

        self.check_credentials(requester.user_id, range.owner, range.provider, &master_key)
            .await?;

        let args = DestroyRangeArgs {
            range_id,
            requester: *requester,
            master_key,
        };
        self.submit(requester.user_id, DESTROY_RANGE, to_args(&args)?)
            .await
    }

    /// Queue a periodic system task under the id of the current interval slot.
    ///
    /// Returns `None` when another worker already queued this slot.
    pub async fn submit_scheduled(
        &self,
        task_name: &str,
        now: DateTime<Utc>,
        interval: chrono::Duration,
    ) -> Result<Option<Submission>, SubmitError> {
        let task_id = scheduled_task_id(task_name, now, interval);
        self.enqueue(task_id, system_owner(), task_name, JsonValue::Null)
            .await
    }

    /// One job, or `None` when it does not exist or is not the requester's.
    pub async fn job(
        &self,
        lookup: &JobLookup,
        requester: &Requester,
    ) -> Result<Option<Job>, LedgerError> {
        self.ledger.get(lookup, requester).await
    }

    pub async fn jobs(
        &self,
        requester: &Requester,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, LedgerError> {
        self.ledger.list(requester, status).await
    }

    /// Status view for polling; `NotFound` also covers other users' jobs.
    pub async fn status(
        &self,
        lookup: &JobLookup,
        requester: &Requester,
    ) -> Result<ReportedStatus, LedgerError> {
        let job = self.ledger.get(lookup, requester).await?;
        Ok(ReportedStatus::from(job.as_ref()))
    }

    async fn check_credentials(
        &self,
        requester: UserId,
        user: UserId,
        provider: Provider,
        master_key: &MasterKey,
    ) -> Result<(), SubmitError> {
        let plugin = self
            .registry
            .lookup(provider)
            .ok_or(SubmitError::UnsupportedProvider(provider))?;

        let foreign = requester != user;
        let secrets = match self.credentials.get_decrypted_secrets(user, master_key).await {
            Ok(secrets) => secrets,
            Err(StoreError::Decryption(reason)) => {
                warn!(user_id = %user, requester_id = %requester, %reason, "could not decrypt stored credentials");
                if foreign {
                    return Err(SubmitError::ForeignCredentials { owner: user });
                }
                None
            }
            Err(e) => return Err(e.into()),
        };
        match secrets {
            Some(secrets) if plugin.has_required_secrets(&secrets) => Ok(()),
            None if foreign => Err(SubmitError::ForeignCredentials { owner: user }),
            _ => Err(SubmitError::MissingCredentials(provider)),
        }
    }

    async fn submit(
        &self,
        owner: UserId,
        task_name: &str,
        args: JsonValue,
    ) -> Result<Submission, SubmitError> {
        let task_id = TaskId::generate();
        let submission = self.enqueue(task_id.clone(), owner, task_name, args).await?;
        // A freshly generated id cannot already be queued.
        Ok(submission.unwrap_or(Submission {
            task_id,
            detail: LedgerWrite::Recorded,
        }))
    }

    async fn enqueue(
        &self,
        task_id: TaskId,
        owner: UserId,
        task_name: &str,
        args: JsonValue,
    ) -> Result<Option<Submission>, SubmitError> {
        let detail = match self
            .ledger
            .enqueue(NewJob {
                task_id: task_id.clone(),
                task_name: task_name.to_string(),
                owner,
                enqueue_time: Utc::now(),
            })
            .await
        {
            Ok(_) => LedgerWrite::Recorded,
            Err(e) => {
                warn!(task_id = %task_id, task_name, error = %e, "ledger write failed; queueing untracked");
                LedgerWrite::Failed(e.to_string())
            }
        };

        let request = TaskRequest {
            task_id: task_id.clone(),
            task_name: task_name.to_string(),
            args,
            owner,
        };
        let queued = self.queue.enqueue(request).await.map_err(|e| {
            if detail == LedgerWrite::Recorded {
                warn!(task_id = %task_id, task_name, error = %e, "queue rejected task; ledger row stays QUEUED");
            }
            SubmitError::Queue(e)
        })?;
        if queued.is_none() {
            info!(task_id = %task_id, task_name, "task already queued");
            return Ok(None);
        }
        info!(task_id = %task_id, task_name, ledger = ?detail, "task submitted");
        Ok(Some(Submission { task_id, detail }))
    }
}

fn to_args<T: Serialize>(args: &T) -> Result<JsonValue, SubmitError> {
    serde_json::to_value(args).map_err(|e| SubmitError::Queue(QueueError::Serialization(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobLedger;
    use crate::provisioning::outputs::tests::blueprint;
    use crate::provisioning::{AwsPlugin, AwsSecrets, CliSettings, ProviderSecrets, Secret};
    use crate::queue::InMemoryTaskQueue;
    use crate::stores::{InMemoryBlueprintStore, InMemoryCredentialStore, InMemoryRangeStore};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        gateway: SubmissionGateway,
        queue: Arc<InMemoryTaskQueue>,
        ledger: Arc<InMemoryJobLedger>,
        blueprints: Arc<InMemoryBlueprintStore>,
        credentials: Arc<InMemoryCredentialStore>,
        ranges: Arc<InMemoryRangeStore>,
    }

    fn fixture_with_ledger(ledger: Arc<dyn JobLedger>) -> (SubmissionGateway, Arc<InMemoryTaskQueue>) {
        let queue = Arc::new(InMemoryTaskQueue::default());
        let registry = ProviderRegistry::new().with(Arc::new(AwsPlugin::new(CliSettings {
            binary: PathBuf::from("tofu"),
            modules_dir: PathBuf::from("/nonexistent"),
            plugin_cache_dir: None,
        })));
        let gateway = SubmissionGateway::new(
            queue.clone(),
            ledger,
            Arc::new(InMemoryBlueprintStore::new()),
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(InMemoryRangeStore::new()),
            Arc::new(registry),
        );
        (gateway, queue)
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(InMemoryTaskQueue::default());
        let ledger = Arc::new(InMemoryJobLedger::new());
        let blueprints = Arc::new(InMemoryBlueprintStore::new());
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let ranges = Arc::new(InMemoryRangeStore::new());
        let registry = ProviderRegistry::new().with(Arc::new(AwsPlugin::new(CliSettings {
            binary: PathBuf::from("tofu"),
            modules_dir: PathBuf::from("/nonexistent"),
            plugin_cache_dir: None,
        })));
        let gateway = SubmissionGateway::new(
            queue.clone(),
            ledger.clone(),
            blueprints.clone(),
            credentials.clone(),
            ranges.clone(),
            Arc::new(registry),
        );
        Fixture {
            gateway,
            queue,
            ledger,
            blueprints,
            credentials,
            ranges,
        }
    }

    fn aws_secrets() -> ProviderSecrets {
        ProviderSecrets {
            aws: Some(AwsSecrets {
                access_key: Secret::new("AKIAEXAMPLE"),
                secret_key: Secret::new("wJalrXUtnFEMI"),
            }),
            azure: None,
        }
    }

    fn request(blueprint_id: BlueprintId) -> DeployRequest {
        DeployRequest {
            blueprint_id,
            region: Region::UsEast1,
            name: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn deploy_is_queued_and_recorded() {
        let fx = fixture();
        let bp = blueprint();
        let owner = bp.owner;
        fx.blueprints.insert(bp.clone()).await;
        fx.credentials
            .insert(owner, MasterKey::new("k"), aws_secrets())
            .await;

        let requester = Requester::user(owner);
        let submission = fx
            .gateway
            .submit_deploy(&requester, request(bp.id), MasterKey::new("k"))
            .await
            .unwrap();
        assert_eq!(submission.detail, LedgerWrite::Recorded);

        let delivery = fx.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.task_id, submission.task_id);
        assert_eq!(delivery.task_name, DEPLOY_RANGE);

        let status = fx
            .gateway
            .status(&JobLookup::TaskId(submission.task_id.clone()), &requester)
            .await
            .unwrap();
        assert_eq!(status, ReportedStatus::Queued);

        let stranger = Requester::user(UserId::new());
        let hidden = fx
            .gateway
            .status(&JobLookup::TaskId(submission.task_id), &stranger)
            .await
            .unwrap();
        assert_eq!(hidden, ReportedStatus::NotFound);
    }

    /// Reports whether the ledger row existed at the moment the task was queued.
    struct LedgerCheckingQueue {
        inner: InMemoryTaskQueue,
        ledger: Arc<InMemoryJobLedger>,
        row_seen: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl TaskQueue for LedgerCheckingQueue {
        async fn enqueue(&self, request: TaskRequest) -> Result<Option<TaskId>, QueueError> {
            let found = self
                .ledger
                .find(&JobLookup::TaskId(request.task_id.clone()))
                .await
                .unwrap()
                .is_some();
            self.row_seen.lock().unwrap().push(found);
            self.inner.enqueue(request).await
        }
        async fn dequeue(&self, wait: Duration) -> Result<Option<crate::queue::Delivery>, QueueError> {
            self.inner.dequeue(wait).await
        }
        async fn store_result(&self, task_id: &TaskId, result: &crate::queue::TaskResult) -> Result<(), QueueError> {
            self.inner.store_result(task_id, result).await
        }
        async fn get_result(&self, task_id: &TaskId) -> Result<Option<crate::queue::TaskResult>, QueueError> {
            self.inner.get_result(task_id).await
        }
        async fn ack(&self, task_id: &TaskId) -> Result<(), QueueError> {
            self.inner.ack(task_id).await
        }
        async fn recover_expired(&self) -> Result<usize, QueueError> {
            self.inner.recover_expired().await
        }
    }

    #[tokio::test]
    async fn ledger_row_exists_before_task_is_queued() {
        let ledger = Arc::new(InMemoryJobLedger::new());
        let queue = Arc::new(LedgerCheckingQueue {
            inner: InMemoryTaskQueue::default(),
            ledger: ledger.clone(),
            row_seen: Default::default(),
        });
        let gateway = SubmissionGateway::new(
            queue.clone(),
            ledger.clone(),
            Arc::new(InMemoryBlueprintStore::new()),
            Arc::new(InMemoryCredentialStore::new()),
            Arc::new(InMemoryRangeStore::new()),
            Arc::new(ProviderRegistry::new()),
        );

        let submission = gateway
            .submit_scheduled("purge_jobs", Utc::now(), chrono::Duration::hours(1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(submission.detail, LedgerWrite::Recorded);
        assert_eq!(*queue.row_seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn admin_destroy_of_foreign_range_names_the_credential_problem() {
        use crate::provisioning::outputs::tests::complete_outputs;
        use crate::provisioning::{RangeMeta, parse_outputs};
        use crate::stores::RangeStore;

        let fx = fixture();
        let bp = blueprint();
        let owner = bp.owner;
        fx.credentials
            .insert(owner, MasterKey::new("owner key"), aws_secrets())
            .await;
        let layout = openlabs_ranges::RangeLayout::plan(&bp, "stack-0a1b2c3d4e").unwrap();
        let range = parse_outputs(
            &bp,
            &layout,
            &complete_outputs(&layout),
            RangeMeta {
                owner,
                region: Region::UsEast1,
                created_at: Utc::now(),
                state_snapshot: serde_json::json!({}),
            },
        )
        .unwrap();
        fx.ranges.create(&range).await.unwrap();

        let admin = Requester::admin(UserId::new());
        let err = fx
            .gateway
            .submit_destroy(&admin, range.id, MasterKey::new("admin key"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::ForeignCredentials { owner: o } if o == owner));
        assert!(fx.queue.dequeue(Duration::ZERO).await.unwrap().is_none());

        // The owner's own key still passes.
        fx.gateway
            .submit_destroy(&Requester::user(owner), range.id, MasterKey::new("owner key"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_credentials_create_no_job() {
        let fx = fixture();
        let bp = blueprint();
        fx.blueprints.insert(bp.clone()).await;

        let err = fx
            .gateway
            .submit_deploy(&Requester::user(bp.owner), request(bp.id), MasterKey::new("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::MissingCredentials(Provider::Aws)));
        assert_eq!(fx.queue.pending_len().await, 0);
        assert!(fx.ledger.query(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_master_key_reads_as_missing_credentials() {
        let fx = fixture();
        let bp = blueprint();
        fx.blueprints.insert(bp.clone()).await;
        fx.credentials
            .insert(bp.owner, MasterKey::new("right"), aws_secrets())
            .await;

        let err = fx
            .gateway
            .submit_deploy(&Requester::user(bp.owner), request(bp.id), MasterKey::new("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn unsupported_provider_is_rejected() {
        let fx = fixture();
        let mut bp = blueprint();
        bp.provider = Provider::Azure;
        fx.blueprints.insert(bp.clone()).await;

        let err = fx
            .gateway
            .submit_deploy(&Requester::user(bp.owner), request(bp.id), MasterKey::new("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::UnsupportedProvider(Provider::Azure)));
        assert_eq!(fx.queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn other_users_blueprint_is_not_found() {
        let fx = fixture();
        let bp = blueprint();
        fx.blueprints.insert(bp.clone()).await;

        let err = fx
            .gateway
            .submit_deploy(&Requester::user(UserId::new()), request(bp.id), MasterKey::new("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(_)));
    }

    #[tokio::test]
    async fn unusable_name_is_a_validation_error() {
        let fx = fixture();
        let bp = blueprint();
        fx.blueprints.insert(bp.clone()).await;

        let mut req = request(bp.id);
        req.name = Some("!!!".into());
        let err = fx
            .gateway
            .submit_deploy(&Requester::user(bp.owner), req, MasterKey::new("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
    }

    #[tokio::test]
    async fn destroy_of_unknown_range_is_not_found() {
        let fx = fixture();
        let err = fx
            .gateway
            .submit_destroy(&Requester::user(UserId::new()), RangeId::new(), MasterKey::new("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(_)));
    }

    #[tokio::test]
    async fn scheduled_tasks_dedupe_per_slot() {
        let fx = fixture();
        let now = Utc::now();
        let interval = chrono::Duration::hours(1);

        let first = fx.gateway.submit_scheduled("purge_jobs", now, interval).await.unwrap();
        let second = fx.gateway.submit_scheduled("purge_jobs", now, interval).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(fx.queue.pending_len().await, 1);
    }

    struct BrokenLedger;

    #[async_trait]
    impl JobLedger for BrokenLedger {
        async fn enqueue(&self, _job: NewJob) -> Result<Job, LedgerError> {
            Err(LedgerError::Storage("database unavailable".into()))
        }
        async fn find(&self, _lookup: &JobLookup) -> Result<Option<Job>, LedgerError> {
            Ok(None)
        }
        async fn query(
            &self,
            _owner: Option<UserId>,
            _status: Option<JobStatus>,
        ) -> Result<Vec<Job>, LedgerError> {
            Ok(Vec::new())
        }
        async fn write_transition(&self, _previous: &Job, _next: &Job) -> Result<(), LedgerError> {
            Err(LedgerError::Storage("database unavailable".into()))
        }
        async fn purge_terminal_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, LedgerError> {
            Ok(0)
        }
        async fn in_progress_started_before(
            &self,
            _started_before: DateTime<Utc>,
        ) -> Result<Vec<Job>, LedgerError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn ledger_failure_still_accepts_the_task() {
        let (gateway, queue) = fixture_with_ledger(Arc::new(BrokenLedger));
        let submission = gateway
            .submit_scheduled("purge_jobs", Utc::now(), chrono::Duration::hours(1))
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(submission.detail, LedgerWrite::Failed(_)));
        assert_eq!(queue.pending_len().await, 1);
    }
}
