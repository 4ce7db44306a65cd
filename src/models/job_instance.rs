//! JobInstance entity model
//!
//! Each row is one execution attempt of a job definition, keyed by
//! `(job_definition_id, instance_id)`. Rows are mutated only through
//! conditional updates in [`crate::repositories::JobInstanceRepository`].

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::jobs::{
    JobInstanceId, JobMetadata, JobPriority, JobProgress, JobProgressDetails, JobStatus,
};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "job_instances")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_definition_id: Uuid,

    /// Per-definition sequence number starting at 1
    #[sea_orm(primary_key, auto_increment = false)]
    pub instance_id: i64,

    /// Identity of the worker currently (or last) holding the lease
    pub worker_id: Option<String>,

    pub status: JobStatus,

    pub scheduled_start_time: DateTimeWithTimeZone,

    pub priority: JobPriority,

    pub attempt_count: i32,

    pub timeout_in_minutes: i32,

    pub is_full: bool,

    pub is_reprocessing: bool,

    /// JSON array of routing tags
    #[sea_orm(column_type = "JsonBinary")]
    pub tags: JsonValue,

    pub last_heartbeat: Option<DateTimeWithTimeZone>,

    /// Set when the instance is claimed
    pub start_time: Option<DateTimeWithTimeZone>,

    /// Stamped in the same statement that changes `status`, never otherwise
    pub status_changed_at: DateTimeWithTimeZone,

    /// Inline payload; omitted by `exclude_payload` queries
    pub payload: Option<Vec<u8>>,

    pub payload_gcs_filename: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub progress: Option<JsonValue>,

    #[sea_orm(column_type = "JsonBinary")]
    pub progress_details: Option<JsonValue>,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn id(&self) -> JobInstanceId {
        JobInstanceId::new(self.job_definition_id, self.instance_id)
    }

    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_value(self.tags.clone()).unwrap_or_default()
    }

    pub fn job_metadata(&self) -> JobMetadata {
        JobMetadata::from_json(self.metadata.as_ref())
    }

    pub fn job_progress(&self) -> JobProgress {
        JobProgress::from_json(self.progress.as_ref())
    }

    pub fn job_progress_details(&self) -> JobProgressDetails {
        JobProgressDetails::from_json(self.progress_details.as_ref())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job_definition::Entity",
        from = "Column::JobDefinitionId",
        to = "super::job_definition::Column::Id"
    )]
    JobDefinition,
}

impl Related<super::job_definition::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobDefinition.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
