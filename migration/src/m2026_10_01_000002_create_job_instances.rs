//! Migration to create the job_instances table.
//!
//! Instances are keyed by `(job_definition_id, instance_id)` where `instance_id` is a
//! per-definition sequence assigned by the application at insert time.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobInstances::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobInstances::JobDefinitionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobInstances::InstanceId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(JobInstances::WorkerId).text().null())
                    .col(
                        ColumnDef::new(JobInstances::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(JobInstances::ScheduledStartTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobInstances::Priority)
                            .integer()
                            .not_null()
                            .default(2),
                    )
                    .col(
                        ColumnDef::new(JobInstances::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(JobInstances::TimeoutInMinutes)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobInstances::IsFull)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(JobInstances::IsReprocessing)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(JobInstances::Tags).json_binary().not_null())
                    .col(
                        ColumnDef::new(JobInstances::LastHeartbeat)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobInstances::StartTime)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobInstances::StatusChangedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(JobInstances::Payload).blob().null())
                    .col(
                        ColumnDef::new(JobInstances::PayloadGcsFilename)
                            .string_len(1000)
                            .null(),
                    )
                    .col(ColumnDef::new(JobInstances::Progress).json_binary().null())
                    .col(
                        ColumnDef::new(JobInstances::ProgressDetails)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(JobInstances::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(JobInstances::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobInstances::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(JobInstances::JobDefinitionId)
                            .col(JobInstances::InstanceId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_instances_job_definition_id")
                            .from(JobInstances::Table, JobInstances::JobDefinitionId)
                            .to(JobDefinitions::Table, JobDefinitions::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim scan: eligible pending rows ordered by priority
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_job_instances_status_scheduled_priority ON job_instances (status, scheduled_start_time, priority)".to_string(),
            ))
            .await?;

        // Retention sweep
        manager
            .create_index(
                Index::create()
                    .name("idx_job_instances_created_at")
                    .table(JobInstances::Table)
                    .col(JobInstances::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_job_instances_status_scheduled_priority")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_job_instances_created_at")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(JobInstances::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobInstances {
    Table,
    JobDefinitionId,
    InstanceId,
    WorkerId,
    Status,
    ScheduledStartTime,
    Priority,
    AttemptCount,
    TimeoutInMinutes,
    IsFull,
    IsReprocessing,
    Tags,
    LastHeartbeat,
    StartTime,
    StatusChangedAt,
    Payload,
    PayloadGcsFilename,
    Progress,
    ProgressDetails,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum JobDefinitions {
    Table,
    Id,
}
