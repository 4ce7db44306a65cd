//! # Job Domain Types
//!
//! Enumerations and identifiers shared by the stores, the dispatcher and the
//! stage pipeline. Enum variants are persisted as lowercase text (status, job
//! type) or integers (priority) through SeaORM active enums.

use std::fmt;
use std::str::FromStr;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod metadata;
pub mod progress;

pub use metadata::JobMetadata;
pub use progress::{
    EntityFailure, EntityProgressDetail, FileProgressDetail, JobProgress, JobProgressDetails,
    StageProgressDetail,
};

/// Lifecycle state of a job instance.
///
/// `Pending -> Running -> {Success, Failure}`; `Failure -> Pending` while attempts remain.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failure")]
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Lower numeric value sorts first, so ascending order
/// yields `High`, `Medium`, `Low`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    Default,
)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPriority {
    #[sea_orm(num_value = 1)]
    High,
    #[default]
    #[sea_orm(num_value = 2)]
    Medium,
    #[sea_orm(num_value = 3)]
    Low,
}

/// Kind of work a job definition describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Consumes entities produced by an upstream ingestion run.
    #[sea_orm(string_value = "ingestion_result_processing")]
    IngestionResultProcessing,
    /// Integration-scoped work that does not read ingestion results.
    #[sea_orm(string_value = "generic_integration")]
    GenericIntegration,
    /// Tenant-scoped work spanning integrations.
    #[sea_orm(string_value = "generic_tenant")]
    GenericTenant,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::IngestionResultProcessing => "ingestion_result_processing",
            JobType::GenericIntegration => "generic_integration",
            JobType::GenericTenant => "generic_tenant",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable external reference to a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobInstanceId {
    pub job_definition_id: Uuid,
    pub instance_id: i64,
}

impl JobInstanceId {
    pub fn new(job_definition_id: Uuid, instance_id: i64) -> Self {
        Self {
            job_definition_id,
            instance_id,
        }
    }
}

impl fmt::Display for JobInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_definition_id, self.instance_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid job instance id '{0}': expected <definition-uuid>:<instance-number>")]
pub struct ParseJobInstanceIdError(String);

impl FromStr for JobInstanceId {
    type Err = ParseJobInstanceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (definition, instance) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseJobInstanceIdError(s.to_string()))?;
        let job_definition_id =
            Uuid::parse_str(definition).map_err(|_| ParseJobInstanceIdError(s.to_string()))?;
        let instance_id = instance
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ParseJobInstanceIdError(s.to_string()))?;
        Ok(Self::new(job_definition_id, instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_sorts_high_first() {
        let mut priorities = vec![
            JobPriority::Low,
            JobPriority::High,
            JobPriority::Medium,
            JobPriority::High,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                JobPriority::High,
                JobPriority::High,
                JobPriority::Medium,
                JobPriority::Low
            ]
        );
    }

    #[test]
    fn instance_id_display_parses_back() {
        let id = JobInstanceId::new(Uuid::new_v4(), 42);
        let parsed: JobInstanceId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn instance_id_rejects_zero_and_garbage() {
        let definition = Uuid::new_v4();
        assert!(format!("{definition}:0").parse::<JobInstanceId>().is_err());
        assert!("not-a-uuid:1".parse::<JobInstanceId>().is_err());
        assert!(definition.to_string().parse::<JobInstanceId>().is_err());
    }

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
        assert_eq!(JobStatus::default(), JobStatus::Pending);
    }
}
