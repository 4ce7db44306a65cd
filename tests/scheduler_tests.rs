#[path = "test_utils/mod.rs"]
mod test_utils;

use anyhow::Result;
use chrono::{Duration, Utc};
use etl_orchestrator::config::SchedulerConfig;
use etl_orchestrator::jobs::{JobInstanceId, JobStatus};
use etl_orchestrator::repositories::{JobInstanceFilter, JobInstancePatch, NewJobDefinition};
use etl_orchestrator::scheduler::Scheduler;
use test_utils::{new_definition, setup_repositories};

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_seconds: 60,
        jitter_pct_max: 0.0,
    }
}

#[tokio::test]
async fn schedules_due_definitions_once() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = definitions.insert(new_definition("tenant-a")).await?;
    definitions
        .insert(NewJobDefinition {
            is_active: false,
            ..new_definition("tenant-b")
        })
        .await?;

    let scheduler = Scheduler::new(definitions.clone(), instances.clone(), scheduler_config());
    let now = Utc::now();

    let stats = scheduler.tick(now).await?;
    assert_eq!(stats.definitions_polled, 1);
    assert_eq!(stats.instances_created, 1);

    let first = instances
        .get(JobInstanceId::new(definition_id, 1))
        .await?
        .expect("scheduled");
    assert_eq!(first.status, JobStatus::Pending);
    assert!(!first.is_full);
    assert_eq!(
        first.scheduled_start_time.timestamp_micros(),
        now.timestamp_micros()
    );

    // Still pending: no duplicate.
    let stats = scheduler.tick(now + Duration::hours(2)).await?;
    assert_eq!(stats.instances_created, 0);
    assert_eq!(stats.skipped_active, 1);
    assert_eq!(
        instances
            .count(&JobInstanceFilter {
                job_definition_ids: Some(vec![definition_id]),
                ..JobInstanceFilter::default()
            })
            .await?,
        1
    );
    Ok(())
}

#[tokio::test]
async fn next_instance_waits_for_frequency() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = definitions.insert(new_definition("tenant-a")).await?;
    let scheduler = Scheduler::new(definitions.clone(), instances.clone(), scheduler_config());
    let now = Utc::now();

    scheduler.tick(now).await?;
    instances
        .update(
            JobInstanceId::new(definition_id, 1),
            JobInstancePatch::default().status(JobStatus::Success),
        )
        .await?;

    let stats = scheduler.tick(now + Duration::minutes(30)).await?;
    assert_eq!(stats.skipped_not_due, 1);
    assert_eq!(stats.instances_created, 0);

    let stats = scheduler.tick(now + Duration::minutes(61)).await?;
    assert_eq!(stats.instances_created, 1);
    assert!(
        instances
            .get(JobInstanceId::new(definition_id, 2))
            .await?
            .is_some()
    );
    Ok(())
}

#[tokio::test]
async fn full_cadence_marks_instances_full() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = definitions
        .insert(NewJobDefinition {
            full_frequency_in_minutes: Some(1440),
            ..new_definition("tenant-a")
        })
        .await?;
    let scheduler = Scheduler::new(definitions.clone(), instances.clone(), scheduler_config());

    scheduler.tick(Utc::now()).await?;
    let instance = instances
        .get(JobInstanceId::new(definition_id, 1))
        .await?
        .expect("scheduled");
    assert!(instance.is_full);
    Ok(())
}

#[tokio::test]
async fn jitter_delays_scheduled_start() -> Result<()> {
    let (_db, definitions, instances) = setup_repositories().await?;
    let definition_id = definitions.insert(new_definition("tenant-a")).await?;
    let scheduler = Scheduler::new(
        definitions.clone(),
        instances.clone(),
        SchedulerConfig {
            tick_interval_seconds: 60,
            jitter_pct_max: 0.5,
        },
    );
    let now = Utc::now();

    scheduler.tick(now).await?;
    let instance = instances
        .get(JobInstanceId::new(definition_id, 1))
        .await?
        .expect("scheduled");
    let delay = instance.scheduled_start_time.timestamp() - now.timestamp();
    // Hourly definition, at most half its frequency.
    assert!((0..=1800).contains(&delay), "delay {delay}");
    Ok(())
}
