//! # Ingestion Results
//!
//! The pipeline reads ingested entities through [`IngestionResultReader`].
//! Results are grouped by ingestion run (`ingestion_job_id`) and split into
//! files. Every file carries an `index` that grows across all files a reader
//! returns for one data type, so the pipeline can checkpoint "last file done"
//! as a single number per stage.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::JobInstanceId;

pub mod memory;

pub use memory::InMemoryIngestionReader;

/// Lazily produced entities of one result file, in file order.
pub type EntityStream = BoxStream<'static, Result<JsonValue, IngestionError>>;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("result file {file_index} of ingestion job '{ingestion_job_id}' is unreadable: {message}")]
    UnreadableFile {
        ingestion_job_id: String,
        file_index: i64,
        message: String,
    },
    #[error("ingestion results for {job_instance_id} are unavailable: {message}")]
    Unavailable {
        job_instance_id: JobInstanceId,
        message: String,
    },
}

/// Identifies whose ingestion results a stage reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionScope {
    pub job_instance_id: JobInstanceId,
    pub tenant_id: String,
    pub integration_id: String,
    pub integration_type: String,
    pub ingestion_trigger_id: Option<String>,
}

impl IngestionScope {
    pub fn job_definition_id(&self) -> Uuid {
        self.job_instance_id.job_definition_id
    }
}

/// One result file produced by an ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
    pub ingestion_job_id: String,
    pub index: i64,
}

#[async_trait]
pub trait IngestionResultReader: Send + Sync {
    /// Result files holding `data_type` entities, ascending by `index`. With
    /// `latest_only` set only the most recent ingestion run is considered.
    async fn list_files(
        &self,
        scope: &IngestionScope,
        data_type: &str,
        latest_only: bool,
    ) -> Result<Vec<ResultFile>, IngestionError>;

    /// Opens one file returned by [`IngestionResultReader::list_files`].
    async fn open(
        &self,
        scope: &IngestionScope,
        data_type: &str,
        file: &ResultFile,
    ) -> Result<EntityStream, IngestionError>;
}
