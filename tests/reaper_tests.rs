#[path = "test_utils/mod.rs"]
mod test_utils;

use anyhow::Result;
use chrono::{Duration, Utc};
use etl_orchestrator::config::{DispatcherConfig, ReaperConfig};
use etl_orchestrator::dispatcher::Dispatcher;
use etl_orchestrator::jobs::JobStatus;
use etl_orchestrator::reaper::{ReapStats, Reaper, reclaim_patch};
use etl_orchestrator::repositories::{
    DefinitionSelector, JobDefinitionPatch, JobInstancePatch, NewJobDefinition,
};
use test_utils::{create_definition, create_instance, new_definition, setup_repositories};

fn reaper_config() -> ReaperConfig {
    ReaperConfig {
        tick_interval_seconds: 30,
        heartbeat_grace_seconds: 120,
        retention_days: 0,
    }
}

#[tokio::test]
async fn abandoned_instance_is_retried_until_attempts_run_out() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = create_definition(&definitions, "tenant-a", 3).await?;
    let id = create_instance(&instances, definition_id).await?;

    let dispatcher = Dispatcher::new(instances.clone(), "worker-1", DispatcherConfig::default());
    let reaper = Reaper::new(definitions.clone(), instances.clone(), reaper_config());

    for attempt in 1..=3 {
        assert!(dispatcher.try_claim(id, Utc::now()).await?, "claim {attempt}");
        // Well past both the heartbeat grace and the timeout.
        let stats = reaper.tick(Utc::now() + Duration::hours(2)).await?;
        let stored = instances.get(id).await?.expect("exists");
        assert_eq!(stored.attempt_count, attempt);

        if attempt < 3 {
            assert_eq!(stats.reclaimed, 1);
            assert_eq!(stored.status, JobStatus::Pending);
        } else {
            assert_eq!(stats.failed_terminal, 1);
            assert_eq!(stored.status, JobStatus::Failure);
        }
    }

    // Exhausted failures are never retried.
    let stats = reaper.tick(Utc::now() + Duration::hours(3)).await?;
    assert_eq!(stats, ReapStats::default());
    assert_eq!(
        instances.get(id).await?.expect("exists").status,
        JobStatus::Failure
    );
    Ok(())
}

#[tokio::test]
async fn fresh_heartbeat_keeps_lease() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = create_definition(&definitions, "tenant-a", 3).await?;
    let id = create_instance(&instances, definition_id).await?;

    let dispatcher = Dispatcher::new(instances.clone(), "worker-1", DispatcherConfig::default());
    let reaper = Reaper::new(definitions.clone(), instances.clone(), reaper_config());
    assert!(dispatcher.try_claim(id, Utc::now()).await?);

    let stats = reaper.tick(Utc::now() + Duration::seconds(30)).await?;
    assert_eq!(stats.reclaimed, 0);

    // Grace passes without a beat.
    let stats = reaper.tick(Utc::now() + Duration::minutes(5)).await?;
    assert_eq!(stats.reclaimed, 1);
    let stored = instances.get(id).await?.expect("exists");
    assert_eq!(stored.status, JobStatus::Pending);
    // The old worker can no longer write under its lease.
    assert!(
        !instances
            .update(
                id,
                JobInstancePatch::default()
                    .status(JobStatus::Success)
                    .status_condition(JobStatus::Running)
                    .worker_id_condition("worker-1"),
            )
            .await?
    );
    Ok(())
}

#[tokio::test]
async fn failed_instances_wait_for_retry_window() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = definitions
        .insert(NewJobDefinition {
            retry_wait_time_in_minutes: 10,
            ..new_definition("tenant-a")
        })
        .await?;
    let id = create_instance(&instances, definition_id).await?;

    let dispatcher = Dispatcher::new(instances.clone(), "worker-1", DispatcherConfig::default());
    assert!(dispatcher.try_claim(id, Utc::now()).await?);
    assert!(
        instances
            .update(
                id,
                JobInstancePatch::default()
                    .status(JobStatus::Failure)
                    .status_condition(JobStatus::Running)
                    .worker_id_condition("worker-1"),
            )
            .await?
    );

    let reaper = Reaper::new(definitions.clone(), instances.clone(), reaper_config());
    assert_eq!(reaper.tick(Utc::now()).await?.retried, 0);

    let stats = reaper.tick(Utc::now() + Duration::minutes(11)).await?;
    assert_eq!(stats.retried, 1);
    let stored = instances.get(id).await?.expect("exists");
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempt_count, 1);
    Ok(())
}

#[tokio::test]
async fn inactive_definitions_are_not_retried() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = create_definition(&definitions, "tenant-a", 3).await?;
    let id = create_instance(&instances, definition_id).await?;
    instances
        .update(id, JobInstancePatch::default().status(JobStatus::Failure))
        .await?;
    definitions
        .update(
            DefinitionSelector::Id(definition_id),
            JobDefinitionPatch {
                is_active: Some(false),
                ..JobDefinitionPatch::default()
            },
        )
        .await?;

    let reaper = Reaper::new(definitions.clone(), instances.clone(), reaper_config());
    let stats = reaper.tick(Utc::now() + Duration::hours(1)).await?;
    assert_eq!(stats.retried, 0);
    assert_eq!(
        instances.get(id).await?.expect("exists").status,
        JobStatus::Failure
    );
    Ok(())
}

#[tokio::test]
async fn retention_purges_old_instances_only_when_enabled() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = create_definition(&definitions, "tenant-a", 3).await?;
    for _ in 0..3 {
        create_instance(&instances, definition_id).await?;
    }

    let disabled = Reaper::new(definitions.clone(), instances.clone(), reaper_config());
    assert_eq!(disabled.purge_expired(Utc::now() + Duration::days(30)).await?, 0);

    let enabled = Reaper::new(
        definitions.clone(),
        instances.clone(),
        ReaperConfig {
            retention_days: 7,
            ..reaper_config()
        },
    );
    assert_eq!(enabled.purge_expired(Utc::now() + Duration::days(6)).await?, 0);
    assert_eq!(enabled.purge_expired(Utc::now() + Duration::days(8)).await?, 3);
    assert!(definitions.get(definition_id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn stale_reclaim_does_not_reset_a_newer_lease() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = create_definition(&definitions, "tenant-a", 3).await?;
    let id = create_instance(&instances, definition_id).await?;

    let first = Dispatcher::new(instances.clone(), "worker-1", DispatcherConfig::default());
    assert!(first.try_claim(id, Utc::now()).await?);
    // Snapshot a second reaper would have streamed before reclaiming.
    let stale = instances.get(id).await?.expect("exists");

    let reaper = Reaper::new(definitions.clone(), instances.clone(), reaper_config());
    let stats = reaper.tick(Utc::now() + Duration::hours(2)).await?;
    assert_eq!(stats.reclaimed, 1);

    let second = Dispatcher::new(instances.clone(), "worker-2", DispatcherConfig::default());
    assert!(second.try_claim(id, Utc::now()).await?);

    assert!(!instances.update(id, reclaim_patch(&stale, false)).await?);
    assert!(!instances.update(id, reclaim_patch(&stale, true)).await?);

    let stored = instances.get(id).await?.expect("exists");
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.worker_id.as_deref(), Some("worker-2"));
    assert_eq!(stored.attempt_count, 2);
    Ok(())
}
