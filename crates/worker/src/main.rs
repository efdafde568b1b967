use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use openlabs_infra::WorkerConfig;
use openlabs_infra::db;
use openlabs_infra::jobs::{JobLedger, JobRunner, PostgresJobLedger};
use openlabs_infra::provisioning::{AwsPlugin, AzurePlugin, ProviderRegistry, Provisioner};
use openlabs_infra::queue::{InMemoryTaskQueue, TaskQueue};
use openlabs_infra::stores::{PostgresBlueprintStore, PostgresCredentialStore, PostgresRangeStore};
use openlabs_infra::submission::SubmissionGateway;
use openlabs_infra::tasks::{
    PURGE_JOBS, PurgeJobsTask, REPORT_STALE_JOBS, RangeTaskDeps, ReportStaleJobsTask,
    register_range_tasks,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    openlabs_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    info!(
        worker = %config.worker_name,
        max_jobs = config.max_jobs,
        job_timeout_secs = config.job_timeout.as_secs(),
        max_tries = config.max_tries,
        "starting worker"
    );

    let pool = db::connect(&config.database_url, (config.max_jobs as u32).saturating_mul(2).max(4))
        .await
        .context("failed to connect to Postgres")?;
    db::ensure_schema(&pool).await.context("failed to apply schema")?;

    let queue = build_queue(&config)?;
    let ledger: Arc<dyn JobLedger> = Arc::new(PostgresJobLedger::new(pool.clone()));
    let registry = Arc::new(build_registry(&config));

    let blueprints = Arc::new(PostgresBlueprintStore::new(pool.clone()));
    let credentials = Arc::new(PostgresCredentialStore::new(pool.clone()));
    let ranges = Arc::new(PostgresRangeStore::new(pool));

    let gateway = SubmissionGateway::new(
        queue.clone(),
        ledger.clone(),
        blueprints.clone(),
        credentials.clone(),
        ranges.clone(),
        registry.clone(),
    );

    let mut runner = JobRunner::new(queue, ledger.clone(), config.runner_config());
    register_range_tasks(
        &mut runner,
        RangeTaskDeps {
            blueprints,
            credentials,
            ranges,
            provisioner: Provisioner::new(registry, config.workspace_root.clone()),
        },
    );
    runner.register(Arc::new(PurgeJobsTask::new(ledger.clone(), config.retention)));
    runner.register(Arc::new(ReportStaleJobsTask::new(ledger, config.stale_after)));
    let handle = runner.spawn();

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = tokio::spawn(schedule_maintenance(
        gateway,
        config.maintenance_interval,
        stop_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested; draining in-flight jobs");

    let _ = stop_tx.send(true);
    if let Err(e) = scheduler.await {
        error!(error = %e, "maintenance scheduler panicked");
    }
    let stats = handle.stats();
    handle.shutdown().await;
    info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        timed_out = stats.jobs_timed_out,
        "worker stopped"
    );
    Ok(())
}

#[cfg(feature = "redis")]
fn build_queue(config: &WorkerConfig) -> anyhow::Result<Arc<dyn TaskQueue>> {
    use openlabs_infra::queue::RedisTaskQueue;

    let Some(url) = &config.redis_url else {
        return Ok(in_memory_queue(config));
    };
    // The lease outlives the job timeout so only crashed deliveries are recovered.
    let lease = config.job_timeout + Duration::from_secs(60);
    let queue = RedisTaskQueue::new(url, lease, config.result_ttl)
        .context("failed to create Redis task queue")?;
    info!("using Redis task queue");
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redis"))]
fn build_queue(config: &WorkerConfig) -> anyhow::Result<Arc<dyn TaskQueue>> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but the worker was built without the redis feature");
    }
    Ok(in_memory_queue(config))
}

fn in_memory_queue(config: &WorkerConfig) -> Arc<dyn TaskQueue> {
    warn!("using the in-process task queue; tasks are lost on restart");
    Arc::new(InMemoryTaskQueue::new(config.result_ttl))
}

fn build_registry(config: &WorkerConfig) -> ProviderRegistry {
    let Some(settings) = config.cli_settings() else {
        warn!("no IaC module directory configured; no provider plugins registered");
        return ProviderRegistry::new();
    };
    ProviderRegistry::new()
        .with(Arc::new(AwsPlugin::new(settings.clone())))
        .with(Arc::new(AzurePlugin::new(settings)))
}

/// Enqueue the housekeeping tasks once per interval slot until stopped.
async fn schedule_maintenance(
    gateway: SubmissionGateway,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let slot = match chrono::Duration::from_std(interval) {
        Ok(slot) => slot,
        Err(e) => {
            error!(error = %e, "maintenance interval out of range; scheduler disabled");
            return;
        }
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for task_name in [PURGE_JOBS, REPORT_STALE_JOBS] {
                    match gateway.submit_scheduled(task_name, Utc::now(), slot).await {
                        Ok(Some(submission)) => info!(task_id = %submission.task_id, "maintenance task queued"),
                        Ok(None) => {}
                        Err(e) => warn!(task_name, error = %e, "failed to queue maintenance task"),
                    }
                }
            }
            _ = stop.changed() => break,
        }
    }
}
