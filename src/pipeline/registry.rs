//! Processor lookup for claimed job instances.
//!
//! Processors are keyed by the definition's `agg_processor_name`, falling
//! back to the job type name when the definition does not name one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{EtlProcessor, ExecutionContext, PipelineRunner, RunReport};
use crate::error::PipelineError;
use crate::jobs::JobType;
use crate::models::job_definition::Model as JobDefinitionModel;

/// Object-safe view of an [`EtlProcessor`], hiding its `State` type.
#[async_trait]
pub trait DynProcessor: Send + Sync {
    async fn execute(
        &self,
        runner: &PipelineRunner,
        ctx: ExecutionContext,
    ) -> Result<RunReport, PipelineError>;
}

#[async_trait]
impl<P> DynProcessor for P
where
    P: EtlProcessor,
{
    async fn execute(
        &self,
        runner: &PipelineRunner,
        ctx: ExecutionContext,
    ) -> Result<RunReport, PipelineError> {
        runner.run(self, ctx).await
    }
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn DynProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `processor` under an aggregation processor name.
    pub fn register<P>(&mut self, name: impl Into<String>, processor: P)
    where
        P: EtlProcessor + 'static,
    {
        let name = name.into();
        debug!(processor = %name, "Registering processor");
        self.processors.insert(name, Arc::new(processor));
    }

    /// Registers `processor` as the default for every definition of `job_type`.
    pub fn register_for_job_type<P>(&mut self, job_type: JobType, processor: P)
    where
        P: EtlProcessor + 'static,
    {
        self.register(job_type.as_str(), processor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    /// Resolves the processor for `definition`.
    pub fn resolve(
        &self,
        definition: &JobDefinitionModel,
    ) -> Result<Arc<dyn DynProcessor>, PipelineError> {
        let key = definition
            .agg_processor_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(definition.job_type.as_str());

        self.processors
            .get(key)
            .or_else(|| self.processors.get(definition.job_type.as_str()))
            .cloned()
            .ok_or_else(|| PipelineError::UnknownProcessor(key.to_string()))
    }
}
