//! Test utilities for database testing.
//!
//! This module provides utilities for setting up in-memory SQLite databases
//! with migrations applied, plus fixtures for job definitions and instances.

use anyhow::Result;
use chrono::{DateTime, Utc};
use etl_orchestrator::jobs::{JobInstanceId, JobType};
use etl_orchestrator::repositories::{
    JobDefinitionRepository, JobInstancePatch, JobInstanceRepository, NewJobDefinition,
    NewJobInstance,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// Foreign keys stay enforced: instances must reference an existing
/// definition, as they do in Postgres.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = ON".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Repositories sharing one test database.
#[allow(dead_code)]
pub async fn setup_repositories()
-> Result<(DatabaseConnection, JobDefinitionRepository, JobInstanceRepository)> {
    let db = setup_test_db().await?;
    let definitions = JobDefinitionRepository::new(db.clone());
    let instances = JobInstanceRepository::new(db.clone());
    Ok((db, definitions, instances))
}

/// A definition for the given tenant with default scheduling policy.
#[allow(dead_code)]
pub fn new_definition(tenant_id: &str) -> NewJobDefinition {
    NewJobDefinition::new(
        tenant_id,
        format!("{tenant_id}-jira"),
        "jira",
        JobType::IngestionResultProcessing,
    )
}

/// Inserts a definition with `attempt_max` attempts and returns its id.
#[allow(dead_code)]
pub async fn create_definition(
    definitions: &JobDefinitionRepository,
    tenant_id: &str,
    attempt_max: i32,
) -> Result<Uuid> {
    let id = definitions
        .insert(NewJobDefinition {
            attempt_max,
            ..new_definition(tenant_id)
        })
        .await?;
    Ok(id)
}

/// Inserts a PENDING instance scheduled in the past.
#[allow(dead_code)]
pub async fn create_instance(
    instances: &JobInstanceRepository,
    job_definition_id: Uuid,
) -> Result<JobInstanceId> {
    let id = instances
        .insert(NewJobInstance {
            scheduled_start_time: Some(Utc::now() - chrono::Duration::minutes(1)),
            ..NewJobInstance::for_definition(job_definition_id)
        })
        .await?;
    Ok(id)
}

/// Moves an instance to RUNNING under `worker_id` the way a claim does,
/// with `started_at` as start time and heartbeat.
#[allow(dead_code)]
pub async fn lease_instance(
    instances: &JobInstanceRepository,
    id: JobInstanceId,
    worker_id: &str,
    started_at: DateTime<Utc>,
) -> Result<bool> {
    let claimed = instances
        .update(
            id,
            JobInstancePatch::default()
                .status(etl_orchestrator::jobs::JobStatus::Running)
                .worker_id(worker_id)
                .start_time(started_at)
                .heartbeat(started_at)
                .increment_attempt_count()
                .status_condition(etl_orchestrator::jobs::JobStatus::Pending),
        )
        .await?;
    Ok(claimed)
}
