//! Per-execution context handed to processor and stage hooks.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::ingestion::IngestionScope;
use crate::jobs::{JobInstanceId, JobMetadata};
use crate::models::job_definition::Model as JobDefinitionModel;
use crate::models::job_instance::Model as JobInstanceModel;

/// What a processor knows about the run it is executing. Lives for one
/// execution of one instance.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    instance: JobInstanceModel,
    definition: JobDefinitionModel,
    worker_id: String,
    started_at: DateTime<Utc>,
    lease: CancellationToken,
    /// Instance metadata as read at claim time plus changes made by hooks;
    /// persisted with the final progress write.
    pub instance_metadata: JobMetadata,
    definition_metadata_patch: JobMetadata,
}

impl ExecutionContext {
    pub fn new(
        instance: JobInstanceModel,
        definition: JobDefinitionModel,
        worker_id: impl Into<String>,
        lease: CancellationToken,
    ) -> Self {
        let started_at = instance
            .start_time
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let instance_metadata = instance.job_metadata();
        Self {
            instance,
            definition,
            worker_id: worker_id.into(),
            started_at,
            lease,
            instance_metadata,
            definition_metadata_patch: JobMetadata::default(),
        }
    }

    pub fn job_instance_id(&self) -> JobInstanceId {
        self.instance.id()
    }

    pub fn instance(&self) -> &JobInstanceModel {
        &self.instance
    }

    pub fn definition(&self) -> &JobDefinitionModel {
        &self.definition
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.definition.tenant_id
    }

    pub fn integration_id(&self) -> &str {
        &self.definition.integration_id
    }

    pub fn is_full(&self) -> bool {
        self.instance.is_full
    }

    /// Start of this run; becomes the definition watermark on success.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Watermark of the last successful run, `None` for a first or full run
    /// that should ignore it.
    pub fn incremental_since(&self) -> Option<DateTime<Utc>> {
        if self.instance.is_full {
            return None;
        }
        self.definition
            .last_iteration_ts
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// True once the heartbeat observed that another party took the lease.
    pub fn lease_lost(&self) -> bool {
        self.lease.is_cancelled()
    }

    /// Stages a key to merge into the definition metadata when the run
    /// succeeds. Nothing is written for failed runs.
    pub fn set_definition_metadata(&mut self, key: impl Into<String>, value: JsonValue) {
        self.definition_metadata_patch.set(key, value);
    }

    /// Checkpoint entry carried by the definition across runs.
    pub fn set_definition_checkpoint(&mut self, key: impl Into<String>, value: JsonValue) {
        self.definition_metadata_patch
            .checkpoint
            .insert(key.into(), value);
    }

    pub fn definition_metadata_patch(&self) -> &JobMetadata {
        &self.definition_metadata_patch
    }

    pub fn ingestion_scope(&self) -> IngestionScope {
        IngestionScope {
            job_instance_id: self.instance.id(),
            tenant_id: self.definition.tenant_id.clone(),
            integration_id: self.definition.integration_id.clone(),
            integration_type: self.definition.integration_type.clone(),
            ingestion_trigger_id: self.definition.ingestion_trigger_id.clone(),
        }
    }
}
