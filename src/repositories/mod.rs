//! # Repository Layer
//!
//! Stores for job definitions and job instances. All cross-worker coordination
//! goes through the conditional updates implemented here; callers never hold
//! in-process locks around a job row.

use chrono::{DateTime, SubsecRound, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;

pub mod job_definition;
pub mod job_instance;

pub use job_definition::{
    DefinitionSelector, JobDefinitionFilter, JobDefinitionPatch, JobDefinitionRepository,
    NewJobDefinition,
};
pub use job_instance::{
    DefinitionAdvance, InstanceDeleteCriteria, InstanceOrder, JobInstanceFilter,
    JobInstancePatch, JobInstanceRepository, NewJobInstance, SortDirection,
};

/// Rows fetched per round trip by the streaming scans.
pub const STREAM_PAGE_SIZE: u64 = 25;

/// One page of a filtered listing together with the unpaged match count.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub total_count: u64,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            total_count: 0,
        }
    }
}

/// Timestamps are stored in UTC at microsecond precision so that values read
/// back compare equal to the values written.
pub fn to_db_time(dt: DateTime<Utc>) -> DateTimeWithTimeZone {
    dt.trunc_subsecs(6).fixed_offset()
}

pub fn db_now() -> DateTimeWithTimeZone {
    to_db_time(Utc::now())
}
