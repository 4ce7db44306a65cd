//! JobDefinition entity model
//!
//! One row per tenant/integration/job-type combination. Holds the scheduling
//! policy copied onto every instance and the `last_iteration_ts` watermark
//! advanced after each successful run.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::jobs::{JobMetadata, JobPriority, JobType};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "job_definitions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: String,

    pub integration_id: String,

    /// Integration kind (e.g. `jira`, `github`); selects the worker pool
    pub integration_type: String,

    pub job_type: JobType,

    pub is_active: bool,

    pub default_priority: JobPriority,

    /// Maximum number of claims before an instance becomes terminally failed
    pub attempt_max: i32,

    pub retry_wait_time_in_minutes: i32,

    pub timeout_in_minutes: i32,

    pub frequency_in_minutes: i32,

    /// Cadence of full (non-incremental) runs; `None` disables full runs
    pub full_frequency_in_minutes: Option<i32>,

    pub agg_processor_name: Option<String>,

    /// Correlates to the upstream ingestion trigger feeding this job
    pub ingestion_trigger_id: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    /// Start time of the most recent successful run
    pub last_iteration_ts: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn job_metadata(&self) -> JobMetadata {
        JobMetadata::from_json(self.metadata.as_ref())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::job_instance::Entity")]
    JobInstance,
}

impl Related<super::job_instance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobInstance.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
