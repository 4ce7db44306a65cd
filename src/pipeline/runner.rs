//! Executes a processor's stages against one claimed job instance.
//!
//! Progress is written back after every result file and every
//! `progress_flush_every` entities, always conditioned on this worker still
//! holding the lease. A file index at or below the stage's recorded
//! checkpoint is skipped, so a retried instance resumes where the previous
//! attempt stopped.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use tracing::{debug, error, info, instrument, warn};

use super::{EntityOutcome, EtlProcessor, ExecutionContext, Stage};
use crate::config::{PipelineConfig, StageFailurePolicy};
use crate::error::PipelineError;
use crate::ingestion::{IngestionResultReader, ResultFile};
use crate::jobs::{
    EntityFailure, FileProgressDetail, JobProgress, JobProgressDetails, JobStatus,
};
use crate::repositories::{JobDefinitionRepository, JobInstancePatch, JobInstanceRepository};

/// A stage that ended in error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: String,
    pub error: String,
}

/// Summary of one pipeline execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub stage_failures: Vec<StageFailure>,
    pub entities_processed: u64,
    pub entities_failed: u64,
    pub files_skipped: u64,
    pub watermark_advanced: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.stage_failures.is_empty()
    }
}

struct RunProgress {
    progress: JobProgress,
    details: JobProgressDetails,
    unflushed: u64,
}

#[derive(Clone)]
pub struct PipelineRunner {
    instances: JobInstanceRepository,
    definitions: JobDefinitionRepository,
    reader: Arc<dyn IngestionResultReader>,
    config: PipelineConfig,
}

impl PipelineRunner {
    pub fn new(
        instances: JobInstanceRepository,
        definitions: JobDefinitionRepository,
        reader: Arc<dyn IngestionResultReader>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            instances,
            definitions,
            reader,
            config,
        }
    }

    /// Runs `processor` for the instance in `ctx`.
    ///
    /// Stage failures are reported in the returned [`RunReport`]; `Err` means
    /// the run could not proceed at all (state creation, `pre_process`, lost
    /// lease, store failure).
    #[instrument(skip_all, fields(job_instance_id = %ctx.job_instance_id(), worker_id = %ctx.worker_id()))]
    pub async fn run<P>(&self, processor: &P, mut ctx: ExecutionContext) -> Result<RunReport, PipelineError>
    where
        P: EtlProcessor + ?Sized,
    {
        let mut state = processor
            .create_state(&ctx)
            .await
            .map_err(|source| PipelineError::Processor {
                hook: "create_state",
                source,
            })?;

        let mut run = RunProgress {
            progress: ctx.instance().job_progress(),
            details: ctx.instance().job_progress_details(),
            unflushed: 0,
        };
        let mut report = RunReport::default();

        let outcome = match processor.pre_process(&mut ctx, &mut state).await {
            Ok(()) => {
                self.run_stages(processor, &mut ctx, &mut state, &mut run, &mut report)
                    .await
            }
            Err(source) => Err(PipelineError::Processor {
                hook: "pre_process",
                source,
            }),
        };

        if let Err(err) = processor.post_process(&mut ctx, &mut state).await {
            warn!(error = %format!("{err:#}"), "post_process failed");
        }
        outcome?;

        self.persist_progress(&ctx, &run, true).await?;

        if report.succeeded() {
            report.watermark_advanced = self.advance_definition(&ctx).await?;
            info!(
                entities_processed = report.entities_processed,
                entities_failed = report.entities_failed,
                "Pipeline run succeeded"
            );
        } else {
            warn!(
                failed_stages = report.stage_failures.len(),
                "Pipeline run finished with failed stages"
            );
        }
        Ok(report)
    }

    async fn run_stages<P>(
        &self,
        processor: &P,
        ctx: &mut ExecutionContext,
        state: &mut P::State,
        run: &mut RunProgress,
        report: &mut RunReport,
    ) -> Result<(), PipelineError>
    where
        P: EtlProcessor + ?Sized,
    {
        for stage in processor.stages() {
            let name = stage.data_type_name().to_string();
            let started = Instant::now();
            let result = self
                .run_stage(stage.as_ref(), ctx, state, run, report)
                .await;
            histogram!("etl_pipeline_stage_duration_ms", "stage" => name.clone())
                .record(started.elapsed().as_secs_f64() * 1_000.0);

            match result {
                Ok(()) => debug!(stage = %name, "Stage completed"),
                Err(PipelineError::Stage { stage, source }) => {
                    let message = format!("{source:#}");
                    error!(stage = %stage, error = %message, "Stage failed");
                    counter!("etl_pipeline_stage_failures_total", "stage" => stage.clone())
                        .increment(1);
                    report.stage_failures.push(StageFailure {
                        stage,
                        error: message,
                    });
                    if self.config.stage_failure_policy == StageFailurePolicy::AbortInstance {
                        break;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    async fn run_stage<S: Send>(
        &self,
        stage: &dyn Stage<S>,
        ctx: &mut ExecutionContext,
        state: &mut S,
        run: &mut RunProgress,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let name = stage.data_type_name().to_string();
        let stage_error = |source: anyhow::Error| PipelineError::Stage {
            stage: name.clone(),
            source,
        };

        stage.pre_stage(ctx, state).await.map_err(&stage_error)?;

        let scope = ctx.ingestion_scope();
        let files = self
            .reader
            .list_files(&scope, &name, stage.only_process_latest_ingestion_job())
            .await
            .map_err(|err| stage_error(err.into()))?;
        let checkpoint = run.progress.last_processed(&name);

        for file in files {
            if checkpoint.is_some_and(|done| file.index <= done) {
                report.files_skipped += 1;
                continue;
            }
            self.run_file(stage, &name, &file, ctx, state, run, report)
                .await?;
            run.progress.record(&name, file.index);
            self.persist_progress(ctx, run, true).await?;
        }

        stage.post_stage(ctx, state).await.map_err(&stage_error)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_file<S: Send>(
        &self,
        stage: &dyn Stage<S>,
        name: &str,
        file: &ResultFile,
        ctx: &ExecutionContext,
        state: &mut S,
        run: &mut RunProgress,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let max_failures = self.config.max_failures_recorded;
        // A file past the checkpoint is replayed from its first entity.
        *run.details.stage_mut(name).file_mut(file.index) = FileProgressDetail::default();

        let mut entities = match self.reader.open(&ctx.ingestion_scope(), name, file).await {
            Ok(entities) => entities,
            Err(err) => {
                warn!(stage = %name, file_index = file.index, error = %err, "Result file unreadable");
                run.details
                    .stage_mut(name)
                    .file_mut(file.index)
                    .mark_unreadable(EntityFailure {
                        ingestion_job_id: file.ingestion_job_id.clone(),
                        entity_index: None,
                        error: err.to_string(),
                    });
                return Ok(());
            }
        };

        let mut entity_index = 0i64;
        while let Some(item) = entities.next().await {
            if ctx.lease_lost() {
                return Err(PipelineError::LeaseLost(ctx.job_instance_id()));
            }

            let outcome = match item {
                Ok(entity) => {
                    stage
                        .process(ctx, state, &file.ingestion_job_id, entity)
                        .await
                }
                Err(err) => {
                    // The rest of the file cannot be read.
                    run.details.stage_mut(name).file_mut(file.index).record_failure(
                        EntityFailure {
                            ingestion_job_id: file.ingestion_job_id.clone(),
                            entity_index: Some(entity_index),
                            error: err.to_string(),
                        },
                        max_failures,
                    );
                    report.entities_failed += 1;
                    break;
                }
            };

            let file_progress = run.details.stage_mut(name).file_mut(file.index);
            match outcome {
                EntityOutcome::Processed => {
                    file_progress.record_success();
                    report.entities_processed += 1;
                    counter!("etl_pipeline_entities_processed_total", "stage" => name.to_string())
                        .increment(1);
                }
                EntityOutcome::Failed(error) => {
                    file_progress.record_failure(
                        EntityFailure {
                            ingestion_job_id: file.ingestion_job_id.clone(),
                            entity_index: Some(entity_index),
                            error,
                        },
                        max_failures,
                    );
                    report.entities_failed += 1;
                    counter!("etl_pipeline_entities_failed_total", "stage" => name.to_string())
                        .increment(1);
                }
                EntityOutcome::Fatal(source) => {
                    file_progress.duration_milliseconds += started.elapsed().as_millis() as u64;
                    return Err(PipelineError::Stage {
                        stage: name.to_string(),
                        source,
                    });
                }
            }

            entity_index += 1;
            run.unflushed += 1;
            if self.config.progress_flush_every > 0 && run.unflushed >= self.config.progress_flush_every
            {
                self.persist_progress(ctx, run, false).await?;
                run.unflushed = 0;
            }
        }

        run.details
            .stage_mut(name)
            .file_mut(file.index)
            .duration_milliseconds += started.elapsed().as_millis() as u64;
        Ok(())
    }

    /// Writes progress (and, when `with_metadata`, the instance metadata)
    /// under the lease.
    async fn persist_progress(
        &self,
        ctx: &ExecutionContext,
        run: &RunProgress,
        with_metadata: bool,
    ) -> Result<(), PipelineError> {
        let mut patch = JobInstancePatch::default()
            .progress(run.progress.clone())
            .progress_details(run.details.clone())
            .status_condition(JobStatus::Running)
            .worker_id_condition(ctx.worker_id().to_string());
        if with_metadata {
            patch = patch.metadata(ctx.instance_metadata.clone());
        }

        if self.instances.update(ctx.job_instance_id(), patch).await? {
            Ok(())
        } else {
            Err(PipelineError::LeaseLost(ctx.job_instance_id()))
        }
    }

    /// Moves the definition watermark to this run's start and merges the
    /// metadata staged by the processor. A full run also records itself as
    /// the latest full iteration.
    async fn advance_definition(&self, ctx: &ExecutionContext) -> Result<bool, PipelineError> {
        let definition = ctx.definition();
        let mut patch = ctx.definition_metadata_patch().clone();
        if ctx.is_full() {
            patch.set_last_full_iteration_ts(ctx.started_at());
        }

        let advanced = self
            .definitions
            .advance_watermark(
                definition.id,
                definition
                    .last_iteration_ts
                    .map(|ts| ts.with_timezone(&chrono::Utc)),
                ctx.started_at(),
                &patch,
            )
            .await?;
        if !advanced {
            warn!(
                job_definition_id = %definition.id,
                "Definition watermark changed during the run; not advancing"
            );
        }
        Ok(advanced)
    }
}
