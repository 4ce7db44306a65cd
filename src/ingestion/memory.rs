//! In-memory ingestion results, keyed by job definition. Used by tests and by
//! embedders that push entities into the pipeline directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{EntityStream, IngestionError, IngestionResultReader, IngestionScope, ResultFile};

#[derive(Debug, Clone)]
enum StoredFile {
    Entities(Vec<JsonValue>),
    Unreadable(String),
}

#[derive(Debug, Clone, Default)]
struct IngestionRun {
    ingestion_job_id: String,
    files: BTreeMap<String, Vec<StoredFile>>,
}

#[derive(Default)]
pub struct InMemoryIngestionReader {
    runs: Mutex<HashMap<Uuid, Vec<IngestionRun>>>,
}

impl InMemoryIngestionReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a file of `data_type` entities to ingestion run
    /// `ingestion_job_id`. Runs are ordered by first appearance; the last one
    /// is the latest.
    pub fn push_file(
        &self,
        job_definition_id: Uuid,
        ingestion_job_id: &str,
        data_type: &str,
        entities: Vec<JsonValue>,
    ) {
        self.push(
            job_definition_id,
            ingestion_job_id,
            data_type,
            StoredFile::Entities(entities),
        );
    }

    /// Appends a file that fails to open with `message`.
    pub fn push_unreadable_file(
        &self,
        job_definition_id: Uuid,
        ingestion_job_id: &str,
        data_type: &str,
        message: &str,
    ) {
        self.push(
            job_definition_id,
            ingestion_job_id,
            data_type,
            StoredFile::Unreadable(message.to_string()),
        );
    }

    fn push(&self, job_definition_id: Uuid, ingestion_job_id: &str, data_type: &str, file: StoredFile) {
        let mut runs = self.lock();
        let runs = runs.entry(job_definition_id).or_default();
        let run = match runs
            .iter()
            .position(|run| run.ingestion_job_id == ingestion_job_id)
        {
            Some(pos) => &mut runs[pos],
            None => {
                runs.push(IngestionRun {
                    ingestion_job_id: ingestion_job_id.to_string(),
                    ..IngestionRun::default()
                });
                let last = runs.len() - 1;
                &mut runs[last]
            }
        };
        run.files.entry(data_type.to_string()).or_default().push(file);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<IngestionRun>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every file of `data_type` across all runs with its global index.
    fn indexed_files(&self, job_definition_id: Uuid, data_type: &str) -> Vec<(usize, ResultFile, StoredFile)> {
        let runs = self.lock();
        let Some(runs) = runs.get(&job_definition_id) else {
            return Vec::new();
        };

        let mut index = 0i64;
        let mut files = Vec::new();
        for (run_position, run) in runs.iter().enumerate() {
            for stored in run.files.get(data_type).into_iter().flatten() {
                files.push((
                    run_position,
                    ResultFile {
                        ingestion_job_id: run.ingestion_job_id.clone(),
                        index,
                    },
                    stored.clone(),
                ));
                index += 1;
            }
        }
        files
    }
}

#[async_trait]
impl IngestionResultReader for InMemoryIngestionReader {
    async fn list_files(
        &self,
        scope: &IngestionScope,
        data_type: &str,
        latest_only: bool,
    ) -> Result<Vec<ResultFile>, IngestionError> {
        let files = self.indexed_files(scope.job_definition_id(), data_type);
        let latest_run = self
            .lock()
            .get(&scope.job_definition_id())
            .map(|runs| runs.len().saturating_sub(1));

        Ok(files
            .into_iter()
            .filter(|(run_position, _, _)| !latest_only || Some(*run_position) == latest_run)
            .map(|(_, file, _)| file)
            .collect())
    }

    async fn open(
        &self,
        scope: &IngestionScope,
        data_type: &str,
        file: &ResultFile,
    ) -> Result<EntityStream, IngestionError> {
        let stored = self
            .indexed_files(scope.job_definition_id(), data_type)
            .into_iter()
            .find(|(_, candidate, _)| candidate == file)
            .map(|(_, _, stored)| stored);

        match stored {
            Some(StoredFile::Entities(entities)) => Ok(stream::iter(entities.into_iter().map(Ok)).boxed()),
            Some(StoredFile::Unreadable(message)) => Err(IngestionError::UnreadableFile {
                ingestion_job_id: file.ingestion_job_id.clone(),
                file_index: file.index,
                message,
            }),
            None => Err(IngestionError::UnreadableFile {
                ingestion_job_id: file.ingestion_job_id.clone(),
                file_index: file.index,
                message: "no such file".to_string(),
            }),
        }
    }
}
