//! # Worker
//!
//! Wires the dispatcher, worker pools, pipeline and heartbeat into one claim
//! loop. A candidate is only claimed after a slot in its integration's pool
//! has been reserved, so every lease this worker takes starts executing.
//! The terminal status is written conditioned on this worker still holding
//! the lease; a reclaimed instance is left to whoever owns it now.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, StoreError};
use crate::heartbeat::Heartbeat;
use crate::ingestion::IngestionResultReader;
use crate::jobs::{JobInstanceId, JobStatus};
use crate::models::job_definition::Model as JobDefinitionModel;
use crate::models::job_instance::Model as JobInstanceModel;
use crate::pipeline::{ExecutionContext, PipelineRunner, ProcessorRegistry, RunReport};
use crate::reaper::Reaper;
use crate::repositories::{JobDefinitionRepository, JobInstancePatch, JobInstanceRepository};
use crate::scheduler::Scheduler;
use crate::worker_pool::WorkerPools;

/// Everything one job execution needs, shared by all spawned executions.
#[derive(Clone)]
struct ExecutionDeps {
    instances: JobInstanceRepository,
    heartbeat: Heartbeat,
    registry: Arc<ProcessorRegistry>,
    runner: PipelineRunner,
    worker_id: String,
}

pub struct Worker {
    config: Arc<AppConfig>,
    definitions: JobDefinitionRepository,
    instances: JobInstanceRepository,
    dispatcher: Dispatcher,
    pools: WorkerPools,
    deps: ExecutionDeps,
}

impl Worker {
    pub fn new(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        registry: ProcessorRegistry,
        reader: Arc<dyn IngestionResultReader>,
    ) -> Self {
        let definitions = JobDefinitionRepository::new(db.clone());
        let instances = JobInstanceRepository::new(db);
        let worker_id = config.worker_id.clone();

        Self {
            dispatcher: Dispatcher::new(
                instances.clone(),
                worker_id.clone(),
                config.dispatcher.clone(),
            ),
            pools: WorkerPools::new(config.clone()),
            deps: ExecutionDeps {
                instances: instances.clone(),
                heartbeat: Heartbeat::new(instances.clone(), worker_id.clone(), &config.heartbeat),
                registry: Arc::new(registry),
                runner: PipelineRunner::new(
                    instances.clone(),
                    definitions.clone(),
                    reader,
                    config.pipeline.clone(),
                ),
                worker_id,
            },
            definitions,
            instances,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.deps.worker_id
    }

    /// Runs the claim loop together with the scheduler and reaper until
    /// `shutdown` fires, then waits for in-flight executions to finish.
    #[instrument(skip_all, fields(worker_id = %self.deps.worker_id))]
    pub async fn run(self, shutdown: CancellationToken) {
        let scheduler = Arc::new(Scheduler::new(
            self.definitions.clone(),
            self.instances.clone(),
            self.config.scheduler.clone(),
        ));
        let reaper = Arc::new(Reaper::new(
            self.definitions.clone(),
            self.instances.clone(),
            self.config.reaper.clone(),
        ));
        let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
        let reaper_task = tokio::spawn(reaper.run(shutdown.clone()));

        info!("Starting job worker");
        let poll_interval = Duration::from_millis(self.config.dispatcher.poll_interval_ms.max(1));
        let max_backoff = Duration::from_millis(
            self.config
                .dispatcher
                .idle_backoff_max_ms
                .max(self.config.dispatcher.poll_interval_ms),
        );
        let mut delay = poll_interval;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job worker shutdown requested");
                    break;
                }
                _ = sleep(delay) => {
                    delay = match self.poll_once().await {
                        Ok(0) => (delay * 2).min(max_backoff),
                        Ok(started) => {
                            debug!(started, "Started job executions");
                            poll_interval
                        }
                        Err(err) => {
                            error!(error = ?err, "Claim loop iteration failed");
                            (delay * 2).min(max_backoff)
                        }
                    };
                }
            }
        }

        self.pools.wait_idle().await;
        for (name, task) in [("scheduler", scheduler_task), ("reaper", reaper_task)] {
            if let Err(err) = task.await {
                warn!(task = name, error = ?err, "Background task ended abnormally");
            }
        }
        info!("Job worker stopped");
    }

    /// Claims and starts as many due instances as the pools admit. Returns the
    /// number of executions started.
    pub async fn poll_once(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut definitions: HashMap<Uuid, Option<JobDefinitionModel>> = HashMap::new();
        let mut started = 0;

        for candidate in self.dispatcher.candidates(now).await? {
            let definition = match definitions.get(&candidate.job_definition_id) {
                Some(cached) => cached.clone(),
                None => {
                    let loaded = self.definitions.get(candidate.job_definition_id).await?;
                    definitions.insert(candidate.job_definition_id, loaded.clone());
                    loaded
                }
            };
            let Some(definition) = definition else {
                continue;
            };
            // Only lease work this process has a processor for.
            if !definition.is_active || self.deps.registry.resolve(&definition).is_err() {
                continue;
            }

            let pool = self.pools.pool_for(&definition.integration_type);
            let Some(slot) = pool.try_reserve() else {
                debug!(pool = %pool.name(), "Worker pool saturated; leaving candidate");
                continue;
            };

            let id = candidate.id();
            if !self.dispatcher.try_claim(id, now).await? {
                continue;
            }
            let Some(leased) = self.instances.get(id).await? else {
                continue;
            };

            let deps = self.deps.clone();
            slot.spawn(async move {
                deps.execute(leased, definition).await;
            });
            started += 1;
        }
        Ok(started)
    }
}

impl ExecutionDeps {
    async fn execute(self, instance: JobInstanceModel, definition: JobDefinitionModel) {
        let id = instance.id();
        let span = info_span!("job", job_instance_id = %id, worker_id = %self.worker_id);
        let lease = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = {
            let _entered = span.enter();
            self.heartbeat
                .clone()
                .spawn(id, lease.clone(), stop_heartbeat.clone())
        };

        let ctx = ExecutionContext::new(instance, definition, self.worker_id.clone(), lease);
        let result = self.run_pipeline(ctx).instrument(span.clone()).await;

        stop_heartbeat.cancel();
        if let Err(err) = heartbeat.await {
            warn!(job_instance_id = %id, error = ?err, "Heartbeat task ended abnormally");
        }

        self.finish(id, result).instrument(span).await;
    }

    async fn run_pipeline(&self, ctx: ExecutionContext) -> Result<RunReport, PipelineError> {
        let processor = self.registry.resolve(ctx.definition())?;
        processor.execute(&self.runner, ctx).await
    }

    async fn finish(&self, id: JobInstanceId, result: Result<RunReport, PipelineError>) {
        let status = match &result {
            Ok(report) if report.succeeded() => JobStatus::Success,
            Ok(_) => JobStatus::Failure,
            Err(PipelineError::LeaseLost(_)) => {
                warn!(job_instance_id = %id, "Lease lost during execution; abandoning");
                return;
            }
            Err(err) => {
                error!(job_instance_id = %id, error = %err, "Job execution failed");
                JobStatus::Failure
            }
        };

        let patch = JobInstancePatch::default()
            .status(status)
            .status_condition(JobStatus::Running)
            .worker_id_condition(self.worker_id.clone());
        match self.instances.update(id, patch).await {
            Ok(true) => info!(job_instance_id = %id, status = %status, "Job instance finished"),
            Ok(false) => warn!(
                job_instance_id = %id,
                "Lease lost before the final status could be written"
            ),
            Err(err) => error!(
                job_instance_id = %id,
                error = ?err,
                "Failed to write final job status; the reaper will reclaim the instance"
            ),
        }
    }
}
