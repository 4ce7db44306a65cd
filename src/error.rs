//! # Error Handling
//!
//! Error taxonomy for the orchestrator. Lost races are not errors: the stores
//! report them as `Ok(false)` and callers move on. Store errors propagate to the
//! worker's outer loop, which retries on its next tick.

use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;

use crate::ingestion::IngestionError;
use crate::jobs::JobInstanceId;

/// Errors raised by the job definition and job instance stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("failed to (de)serialize stored document: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid record: {0}")]
    Validation(String),
    #[error("job definition {0} not found")]
    DefinitionNotFound(uuid::Uuid),
    #[error("could not allocate an instance id for job definition {job_definition_id} after {attempts} attempts")]
    SequenceContention {
        job_definition_id: uuid::Uuid,
        attempts: u32,
    },
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }
}

/// Errors that end a pipeline run for one job instance.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("processor hook '{hook}' failed: {source}")]
    Processor {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("no processor registered for '{0}'")]
    UnknownProcessor(String),
    #[error("lease on job instance {0} was lost")]
    LeaseLost(JobInstanceId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingestion(#[from] IngestionError),
}

impl From<DbErr> for PipelineError {
    fn from(err: DbErr) -> Self {
        PipelineError::Store(StoreError::Database(err))
    }
}

/// Returns true when the database rejected a write because of a unique or
/// primary key constraint.
pub fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&&*code))
}
