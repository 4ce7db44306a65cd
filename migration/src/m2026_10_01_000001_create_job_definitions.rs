//! Migration to create the job_definitions table.
//!
//! One row per tenant/integration/job-type combination, carrying the scheduling
//! policy and the incremental watermark used by processors to resume work.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobDefinitions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobDefinitions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobDefinitions::TenantId).text().not_null())
                    .col(
                        ColumnDef::new(JobDefinitions::IntegrationId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::IntegrationType)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(JobDefinitions::JobType).text().not_null())
                    .col(
                        ColumnDef::new(JobDefinitions::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::DefaultPriority)
                            .integer()
                            .not_null()
                            .default(2),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::AttemptMax)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::RetryWaitTimeInMinutes)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::TimeoutInMinutes)
                            .integer()
                            .not_null()
                            .default(60),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::FrequencyInMinutes)
                            .integer()
                            .not_null()
                            .default(60),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::FullFrequencyInMinutes)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::AggProcessorName)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::IngestionTriggerId)
                            .text()
                            .null(),
                    )
                    .col(ColumnDef::new(JobDefinitions::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(JobDefinitions::LastIterationTs)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobDefinitions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_definitions_tenant_integration_type")
                    .table(JobDefinitions::Table)
                    .col(JobDefinitions::TenantId)
                    .col(JobDefinitions::IntegrationId)
                    .col(JobDefinitions::JobType)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_definitions_active")
                    .table(JobDefinitions::Table)
                    .col(JobDefinitions::IsActive)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_job_definitions_active")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_job_definitions_tenant_integration_type")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(JobDefinitions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobDefinitions {
    Table,
    Id,
    TenantId,
    IntegrationId,
    IntegrationType,
    JobType,
    IsActive,
    DefaultPriority,
    AttemptMax,
    RetryWaitTimeInMinutes,
    TimeoutInMinutes,
    FrequencyInMinutes,
    FullFrequencyInMinutes,
    AggProcessorName,
    IngestionTriggerId,
    Metadata,
    LastIterationTs,
    CreatedAt,
}
