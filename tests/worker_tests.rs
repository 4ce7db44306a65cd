#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use etl_orchestrator::config::{AppConfig, WorkerPoolConfig};
use etl_orchestrator::ingestion::InMemoryIngestionReader;
use etl_orchestrator::jobs::{JobInstanceId, JobStatus, JobType};
use etl_orchestrator::models::job_instance::Model as JobInstanceModel;
use etl_orchestrator::pipeline::{
    EntityOutcome, EtlProcessor, ExecutionContext, ProcessorRegistry, Stage,
};
use etl_orchestrator::repositories::{JobInstanceRepository, NewJobDefinition};
use etl_orchestrator::worker::Worker;
use serde_json::{Value, json};
use test_utils::{create_instance, new_definition, setup_repositories};
use tokio_util::sync::CancellationToken;

struct CountingStage;

#[async_trait]
impl Stage<u64> for CountingStage {
    fn data_type_name(&self) -> &str {
        "issues"
    }

    async fn process(
        &self,
        _ctx: &ExecutionContext,
        state: &mut u64,
        _ingestion_job_id: &str,
        _entity: Value,
    ) -> EntityOutcome {
        *state += 1;
        EntityOutcome::Processed
    }
}

/// Holds every execution in `create_state` until `release` fires.
struct GatedProcessor {
    release: CancellationToken,
}

#[async_trait]
impl EtlProcessor for GatedProcessor {
    type State = u64;

    async fn create_state(&self, _ctx: &ExecutionContext) -> anyhow::Result<u64> {
        self.release.cancelled().await;
        Ok(0)
    }

    fn stages(&self) -> Vec<Box<dyn Stage<u64>>> {
        vec![Box::new(CountingStage)]
    }
}

fn worker_config() -> Arc<AppConfig> {
    Arc::new(AppConfig {
        worker_id: "worker-test".to_string(),
        default_worker_pool: WorkerPoolConfig {
            max_concurrency: 1,
            queue_depth: 0,
        },
        ..AppConfig::default()
    })
}

async fn wait_for_status(
    instances: &JobInstanceRepository,
    id: JobInstanceId,
    status: JobStatus,
) -> Result<JobInstanceModel> {
    for _ in 0..200 {
        if let Some(instance) = instances.get(id).await? {
            if instance.status == status {
                return Ok(instance);
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    anyhow::bail!("instance {id} never reached {status}")
}

#[tokio::test]
async fn poll_once_runs_claimed_instance_to_success() -> Result<()> {
    let (db, definitions, instances) = setup_repositories().await?;
    let definition_id = definitions.insert(new_definition("tenant-a")).await?;
    let id = create_instance(&instances, definition_id).await?;

    let reader = Arc::new(InMemoryIngestionReader::new());
    reader.push_file(
        definition_id,
        "run-1",
        "issues",
        vec![json!({"key": "ETL-1"}), json!({"key": "ETL-2"})],
    );

    let release = CancellationToken::new();
    release.cancel();
    let mut registry = ProcessorRegistry::new();
    registry.register_for_job_type(
        JobType::IngestionResultProcessing,
        GatedProcessor { release },
    );

    let worker = Worker::new(worker_config(), db, registry, reader);
    assert_eq!(worker.poll_once().await?, 1);

    let finished = wait_for_status(&instances, id, JobStatus::Success).await?;
    assert_eq!(finished.worker_id.as_deref(), Some("worker-test"));
    assert_eq!(finished.attempt_count, 1);
    assert_eq!(finished.job_progress().last_processed("issues"), Some(0));

    let definition = definitions.get(definition_id).await?.expect("exists");
    assert_eq!(definition.last_iteration_ts, finished.start_time);
    Ok(())
}

#[tokio::test]
async fn saturated_pool_leaves_candidates_pending() -> Result<()> {
    let (db, definitions, instances) = setup_repositories().await?;
    let first_definition = definitions.insert(new_definition("tenant-a")).await?;
    let second_definition = definitions.insert(new_definition("tenant-b")).await?;
    let first = create_instance(&instances, first_definition).await?;
    let second = create_instance(&instances, second_definition).await?;

    let release = CancellationToken::new();
    let mut registry = ProcessorRegistry::new();
    registry.register_for_job_type(
        JobType::IngestionResultProcessing,
        GatedProcessor {
            release: release.clone(),
        },
    );

    let worker = Worker::new(
        worker_config(),
        db,
        registry,
        Arc::new(InMemoryIngestionReader::new()),
    );
    assert_eq!(worker.poll_once().await?, 1);

    let statuses = [
        instances.get(first).await?.expect("exists").status,
        instances.get(second).await?.expect("exists").status,
    ];
    assert_eq!(
        statuses.iter().filter(|s| **s == JobStatus::Running).count(),
        1
    );
    assert_eq!(
        statuses.iter().filter(|s| **s == JobStatus::Pending).count(),
        1
    );

    release.cancel();
    let started = if statuses[0] == JobStatus::Running {
        first
    } else {
        second
    };
    wait_for_status(&instances, started, JobStatus::Success).await?;
    Ok(())
}

#[tokio::test]
async fn definitions_without_processor_are_not_claimed() -> Result<()> {
    let (db, definitions, instances) = setup_repositories().await?;
    let definition_id = definitions
        .insert(NewJobDefinition {
            agg_processor_name: Some("unregistered".to_string()),
            job_type: JobType::GenericTenant,
            ..new_definition("tenant-a")
        })
        .await?;
    let id = create_instance(&instances, definition_id).await?;

    let worker = Worker::new(
        worker_config(),
        db,
        ProcessorRegistry::new(),
        Arc::new(InMemoryIngestionReader::new()),
    );
    assert_eq!(worker.poll_once().await?, 0);
    assert_eq!(
        instances.get(id).await?.expect("exists").status,
        JobStatus::Pending
    );
    Ok(())
}
