//! # Stage Pipeline
//!
//! A processor declares an ordered list of stages, one per data type it
//! consumes. For one claimed job instance the runner executes:
//!
//! ```text
//! create_state -> pre_process -> [pre_stage -> process* -> post_stage]* -> post_process
//! ```
//!
//! `State` lives for exactly one execution and is never persisted; anything a
//! retry must see goes through instance progress, instance metadata, or the
//! definition metadata merged on success.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

pub mod context;
pub mod registry;
pub mod runner;

pub use context::ExecutionContext;
pub use registry::{DynProcessor, ProcessorRegistry};
pub use runner::{PipelineRunner, RunReport, StageFailure};

/// Result of processing one entity.
#[derive(Debug)]
pub enum EntityOutcome {
    Processed,
    /// The entity could not be handled; recorded and the stage continues.
    Failed(String),
    /// Unrecoverable error; aborts the stage.
    Fatal(anyhow::Error),
}

impl EntityOutcome {
    pub fn from_result(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => EntityOutcome::Processed,
            Err(err) => EntityOutcome::Failed(format!("{err:#}")),
        }
    }
}

/// One data-type stage over raw JSON entities.
#[async_trait]
pub trait Stage<S>: Send + Sync
where
    S: Send,
{
    /// Data type of the ingested entities this stage consumes.
    fn data_type_name(&self) -> &str;

    /// Visit only the most recent ingestion run, or every run tied to the job.
    fn only_process_latest_ingestion_job(&self) -> bool {
        true
    }

    async fn pre_stage(&self, _ctx: &mut ExecutionContext, _state: &mut S) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process(
        &self,
        ctx: &ExecutionContext,
        state: &mut S,
        ingestion_job_id: &str,
        entity: JsonValue,
    ) -> EntityOutcome;

    async fn post_stage(&self, _ctx: &mut ExecutionContext, _state: &mut S) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A stage over entities deserialized into `Self::Entity`. Wrap it in
/// [`Typed`] to register it with a processor; entities that fail to
/// deserialize are recorded as per-entity failures.
#[async_trait]
pub trait IngestionResultStage<S>: Send + Sync
where
    S: Send,
{
    type Entity: DeserializeOwned + Send;

    fn data_type_name(&self) -> &str;

    fn only_process_latest_ingestion_job(&self) -> bool {
        true
    }

    async fn pre_stage(&self, _ctx: &mut ExecutionContext, _state: &mut S) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process(
        &self,
        ctx: &ExecutionContext,
        state: &mut S,
        ingestion_job_id: &str,
        entity: Self::Entity,
    ) -> EntityOutcome;

    async fn post_stage(&self, _ctx: &mut ExecutionContext, _state: &mut S) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapts an [`IngestionResultStage`] to [`Stage`].
pub struct Typed<T, S> {
    inner: T,
    _state: PhantomData<fn(&mut S)>,
}

impl<T, S> Typed<T, S> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            _state: PhantomData,
        }
    }
}

#[async_trait]
impl<T, S> Stage<S> for Typed<T, S>
where
    T: IngestionResultStage<S>,
    S: Send,
{
    fn data_type_name(&self) -> &str {
        self.inner.data_type_name()
    }

    fn only_process_latest_ingestion_job(&self) -> bool {
        self.inner.only_process_latest_ingestion_job()
    }

    async fn pre_stage(&self, ctx: &mut ExecutionContext, state: &mut S) -> anyhow::Result<()> {
        self.inner.pre_stage(ctx, state).await
    }

    async fn process(
        &self,
        ctx: &ExecutionContext,
        state: &mut S,
        ingestion_job_id: &str,
        entity: JsonValue,
    ) -> EntityOutcome {
        match serde_json::from_value::<T::Entity>(entity) {
            Ok(entity) => self.inner.process(ctx, state, ingestion_job_id, entity).await,
            Err(err) => EntityOutcome::Failed(format!(
                "malformed {} entity: {err}",
                self.inner.data_type_name()
            )),
        }
    }

    async fn post_stage(&self, ctx: &mut ExecutionContext, state: &mut S) -> anyhow::Result<()> {
        self.inner.post_stage(ctx, state).await
    }
}

/// Top-level processor for one job type or aggregation.
#[async_trait]
pub trait EtlProcessor: Send + Sync {
    type State: Send;

    /// Builds the per-execution working state.
    async fn create_state(&self, ctx: &ExecutionContext) -> anyhow::Result<Self::State>;

    async fn pre_process(
        &self,
        _ctx: &mut ExecutionContext,
        _state: &mut Self::State,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stages in execution order.
    fn stages(&self) -> Vec<Box<dyn Stage<Self::State>>>;

    /// Runs once after the stages, whatever their outcome.
    async fn post_process(
        &self,
        _ctx: &mut ExecutionContext,
        _state: &mut Self::State,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobPriority, JobStatus, JobType};
    use crate::models::{job_definition, job_instance};
    use crate::repositories::db_now;
    use serde::Deserialize;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[derive(Deserialize)]
    struct Issue {
        key: String,
    }

    struct IssueStage;

    #[async_trait]
    impl IngestionResultStage<Vec<String>> for IssueStage {
        type Entity = Issue;

        fn data_type_name(&self) -> &str {
            "issues"
        }

        async fn process(
            &self,
            _ctx: &ExecutionContext,
            state: &mut Vec<String>,
            _ingestion_job_id: &str,
            entity: Issue,
        ) -> EntityOutcome {
            state.push(entity.key);
            EntityOutcome::Processed
        }
    }

    fn context() -> ExecutionContext {
        let now = db_now();
        let definition_id = Uuid::new_v4();
        let definition = job_definition::Model {
            id: definition_id,
            tenant_id: "t1".to_string(),
            integration_id: "i1".to_string(),
            integration_type: "jira".to_string(),
            job_type: JobType::IngestionResultProcessing,
            is_active: true,
            default_priority: JobPriority::Medium,
            attempt_max: 3,
            retry_wait_time_in_minutes: 0,
            timeout_in_minutes: 60,
            frequency_in_minutes: 60,
            full_frequency_in_minutes: None,
            agg_processor_name: None,
            ingestion_trigger_id: None,
            metadata: None,
            last_iteration_ts: None,
            created_at: now,
        };
        let instance = job_instance::Model {
            job_definition_id: definition_id,
            instance_id: 1,
            worker_id: Some("w-1".to_string()),
            status: JobStatus::Running,
            scheduled_start_time: now,
            priority: JobPriority::Medium,
            attempt_count: 1,
            timeout_in_minutes: 60,
            is_full: false,
            is_reprocessing: false,
            tags: json!([]),
            last_heartbeat: None,
            start_time: Some(now),
            status_changed_at: now,
            payload: None,
            payload_gcs_filename: None,
            progress: None,
            progress_details: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        };
        ExecutionContext::new(instance, definition, "w-1", CancellationToken::new())
    }

    #[tokio::test]
    async fn typed_stage_deserializes_entities() {
        let stage = Typed::new(IssueStage);
        let ctx = context();
        let mut state = Vec::new();

        let outcome = stage
            .process(&ctx, &mut state, "run-1", json!({"key": "ETL-1"}))
            .await;

        assert!(matches!(outcome, EntityOutcome::Processed));
        assert_eq!(state, vec!["ETL-1".to_string()]);
        assert_eq!(stage.data_type_name(), "issues");
    }

    #[tokio::test]
    async fn malformed_entities_are_per_entity_failures() {
        let stage = Typed::new(IssueStage);
        let ctx = context();
        let mut state = Vec::new();

        let outcome = stage
            .process(&ctx, &mut state, "run-1", json!({"id": 7}))
            .await;

        match outcome {
            EntityOutcome::Failed(message) => assert!(message.contains("malformed issues entity")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(state.is_empty());
    }

    #[test]
    fn entity_outcome_from_error_keeps_context() {
        let outcome = EntityOutcome::from_result(Err(anyhow::anyhow!("inner").context("outer")));
        match outcome {
            EntityOutcome::Failed(message) => assert_eq!(message, "outer: inner"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
