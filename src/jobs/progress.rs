//! Progress bookkeeping written back to a job instance while the stage
//! pipeline runs.
//!
//! `JobProgress` is the resume checkpoint (last fully processed file index per
//! stage); `JobProgressDetails` carries the per-file entity counts and the
//! bounded failure list for operators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Sentinel stored in `successful` when a result file could not be read at all.
pub const UNREADABLE_FILE: i64 = -1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobProgress(BTreeMap<String, i64>);

impl JobProgress {
    pub fn from_json(value: Option<&JsonValue>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(&self.0).unwrap_or(JsonValue::Null)
    }

    pub fn last_processed(&self, stage: &str) -> Option<i64> {
        self.0.get(stage).copied()
    }

    /// Records `file_index` as processed for `stage`. The checkpoint never moves backwards.
    pub fn record(&mut self, stage: &str, file_index: i64) {
        let entry = self.0.entry(stage.to_string()).or_insert(file_index);
        if *entry < file_index {
            *entry = file_index;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProgressDetail {
    pub total_entities: i64,
    pub successful: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub ingestion_job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_index: Option<i64>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgressDetail {
    pub entity_progress: EntityProgressDetail,
    #[serde(default)]
    pub failures: Vec<EntityFailure>,
    #[serde(default)]
    pub duration_milliseconds: u64,
}

impl FileProgressDetail {
    pub fn record_success(&mut self) {
        self.entity_progress.total_entities += 1;
        self.entity_progress.successful += 1;
    }

    /// Counts a failed entity and keeps at most `max_failures` failure entries.
    pub fn record_failure(&mut self, failure: EntityFailure, max_failures: usize) {
        self.entity_progress.total_entities += 1;
        self.entity_progress.failed += 1;
        if self.failures.len() < max_failures {
            self.failures.push(failure);
        }
    }

    pub fn mark_unreadable(&mut self, failure: EntityFailure) {
        self.entity_progress.successful = UNREADABLE_FILE;
        self.failures.push(failure);
    }

    pub fn is_unreadable(&self) -> bool {
        self.entity_progress.successful == UNREADABLE_FILE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgressDetail {
    #[serde(default)]
    pub file_progress: BTreeMap<i64, FileProgressDetail>,
}

impl StageProgressDetail {
    pub fn file_mut(&mut self, file_index: i64) -> &mut FileProgressDetail {
        self.file_progress.entry(file_index).or_default()
    }

    pub fn totals(&self) -> EntityProgressDetail {
        self.file_progress
            .values()
            .filter(|file| !file.is_unreadable())
            .fold(EntityProgressDetail::default(), |mut acc, file| {
                acc.total_entities += file.entity_progress.total_entities;
                acc.successful += file.entity_progress.successful;
                acc.failed += file.entity_progress.failed;
                acc
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobProgressDetails(BTreeMap<String, StageProgressDetail>);

impl JobProgressDetails {
    pub fn from_json(value: Option<&JsonValue>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(&self.0).unwrap_or(JsonValue::Null)
    }

    pub fn stage(&self, stage: &str) -> Option<&StageProgressDetail> {
        self.0.get(stage)
    }

    pub fn stage_mut(&mut self, stage: &str) -> &mut StageProgressDetail {
        self.0.entry(stage.to_string()).or_default()
    }

    pub fn failure_count(&self) -> usize {
        self.0
            .values()
            .flat_map(|stage| stage.file_progress.values())
            .map(|file| file.failures.len())
            .sum()
    }
}
