//! # Job Definition Repository
//!
//! Durable catalog of recurring job specifications. Definitions are never hard
//! deleted; they are disabled through `is_active`.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{Page, STREAM_PAGE_SIZE, db_now, to_db_time};
use crate::error::StoreError;
use crate::jobs::{JobMetadata, JobPriority, JobType};
use crate::models::job_definition::{
    ActiveModel as JobDefinitionActiveModel, Column, Entity as JobDefinition,
    Model as JobDefinitionModel,
};

/// Values for a definition to be inserted.
#[derive(Debug, Clone)]
pub struct NewJobDefinition {
    pub tenant_id: String,
    pub integration_id: String,
    pub integration_type: String,
    pub job_type: JobType,
    pub is_active: bool,
    pub default_priority: JobPriority,
    pub attempt_max: i32,
    pub retry_wait_time_in_minutes: i32,
    pub timeout_in_minutes: i32,
    pub frequency_in_minutes: i32,
    pub full_frequency_in_minutes: Option<i32>,
    pub agg_processor_name: Option<String>,
    pub ingestion_trigger_id: Option<String>,
    pub metadata: Option<JobMetadata>,
    pub last_iteration_ts: Option<DateTime<Utc>>,
}

impl NewJobDefinition {
    /// A definition with the default scheduling policy: active, medium
    /// priority, three attempts, hourly cadence and a one hour timeout.
    pub fn new(
        tenant_id: impl Into<String>,
        integration_id: impl Into<String>,
        integration_type: impl Into<String>,
        job_type: JobType,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            integration_id: integration_id.into(),
            integration_type: integration_type.into(),
            job_type,
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
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.tenant_id.trim().is_empty() {
            return Err(StoreError::validation("job definition requires a tenant id"));
        }
        if self.integration_id.trim().is_empty() {
            return Err(StoreError::validation(
                "job definition requires an integration id",
            ));
        }
        if self.integration_type.trim().is_empty() {
            return Err(StoreError::validation(
                "job definition requires an integration type",
            ));
        }
        if self.attempt_max < 1 {
            return Err(StoreError::validation("attempt_max must be at least 1"));
        }
        if self.timeout_in_minutes < 1 || self.frequency_in_minutes < 1 {
            return Err(StoreError::validation(
                "timeout and frequency must be at least one minute",
            ));
        }
        Ok(())
    }
}

/// Predicate for listing and streaming definitions. `None` fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct JobDefinitionFilter {
    pub ids: Option<Vec<Uuid>>,
    /// `(tenant_id, integration_id)` pairs; a definition matches any pair
    pub tenant_integration_pairs: Option<Vec<(String, String)>>,
    pub tenant_ids: Option<Vec<String>>,
    pub is_active: Option<bool>,
    pub job_types: Option<Vec<JobType>>,
}

impl JobDefinitionFilter {
    /// `None` when an empty membership list means nothing can match.
    fn condition(&self) -> Option<Condition> {
        let mut condition = Condition::all();

        if let Some(ids) = &self.ids {
            if ids.is_empty() {
                return None;
            }
            condition = condition.add(Column::Id.is_in(ids.clone()));
        }
        if let Some(pairs) = &self.tenant_integration_pairs {
            if pairs.is_empty() {
                return None;
            }
            let any = pairs
                .iter()
                .fold(Condition::any(), |any, (tenant, integration)| {
                    any.add(
                        Condition::all()
                            .add(Column::TenantId.eq(tenant.clone()))
                            .add(Column::IntegrationId.eq(integration.clone())),
                    )
                });
            condition = condition.add(any);
        }
        if let Some(tenant_ids) = &self.tenant_ids {
            if tenant_ids.is_empty() {
                return None;
            }
            condition = condition.add(Column::TenantId.is_in(tenant_ids.clone()));
        }
        if let Some(is_active) = self.is_active {
            condition = condition.add(Column::IsActive.eq(is_active));
        }
        if let Some(job_types) = &self.job_types {
            if job_types.is_empty() {
                return None;
            }
            condition = condition.add(Column::JobType.is_in(job_types.clone()));
        }

        Some(condition)
    }
}

/// Which definitions an update applies to.
#[derive(Debug, Clone)]
pub enum DefinitionSelector {
    Id(Uuid),
    /// Every definition belonging to the tenant
    Tenant(String),
}

/// Partial update; only `Some` fields are written. `metadata` replaces the
/// stored document wholesale.
#[derive(Debug, Clone, Default)]
pub struct JobDefinitionPatch {
    pub is_active: Option<bool>,
    pub default_priority: Option<JobPriority>,
    pub attempt_max: Option<i32>,
    pub retry_wait_time_in_minutes: Option<i32>,
    pub timeout_in_minutes: Option<i32>,
    pub frequency_in_minutes: Option<i32>,
    pub full_frequency_in_minutes: Option<Option<i32>>,
    pub agg_processor_name: Option<Option<String>>,
    pub ingestion_trigger_id: Option<Option<String>>,
    pub metadata: Option<JobMetadata>,
    pub last_iteration_ts: Option<DateTime<Utc>>,
}

impl JobDefinitionPatch {
    pub fn is_empty(&self) -> bool {
        self.is_active.is_none()
            && self.default_priority.is_none()
            && self.attempt_max.is_none()
            && self.retry_wait_time_in_minutes.is_none()
            && self.timeout_in_minutes.is_none()
            && self.frequency_in_minutes.is_none()
            && self.full_frequency_in_minutes.is_none()
            && self.agg_processor_name.is_none()
            && self.ingestion_trigger_id.is_none()
            && self.metadata.is_none()
            && self.last_iteration_ts.is_none()
    }
}

/// Repository for job definition database operations
#[derive(Clone)]
pub struct JobDefinitionRepository {
    db: DatabaseConnection,
}

impl JobDefinitionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts a definition and returns its generated id. `created_at` is
    /// assigned here and never rewritten.
    pub async fn insert(&self, definition: NewJobDefinition) -> Result<Uuid, StoreError> {
        definition.validate()?;

        let id = Uuid::new_v4();
        let metadata = definition
            .metadata
            .as_ref()
            .filter(|m| !m.is_empty())
            .map(JobMetadata::to_json);

        let model = JobDefinitionActiveModel {
            id: Set(id),
            tenant_id: Set(definition.tenant_id.clone()),
            integration_id: Set(definition.integration_id.clone()),
            integration_type: Set(definition.integration_type.clone()),
            job_type: Set(definition.job_type),
            is_active: Set(definition.is_active),
            default_priority: Set(definition.default_priority),
            attempt_max: Set(definition.attempt_max),
            retry_wait_time_in_minutes: Set(definition.retry_wait_time_in_minutes),
            timeout_in_minutes: Set(definition.timeout_in_minutes),
            frequency_in_minutes: Set(definition.frequency_in_minutes),
            full_frequency_in_minutes: Set(definition.full_frequency_in_minutes),
            agg_processor_name: Set(definition.agg_processor_name.clone()),
            ingestion_trigger_id: Set(definition.ingestion_trigger_id.clone()),
            metadata: Set(metadata),
            last_iteration_ts: Set(definition.last_iteration_ts.map(to_db_time)),
            created_at: Set(db_now()),
        };

        JobDefinition::insert(model)
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| {
                error!(
                    error = ?err,
                    tenant_id = %definition.tenant_id,
                    "Failed to insert job definition"
                );
                StoreError::from(err)
            })?;

        info!(
            job_definition_id = %id,
            tenant_id = %definition.tenant_id,
            integration_id = %definition.integration_id,
            job_type = %definition.job_type,
            "Created job definition"
        );

        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobDefinitionModel>, StoreError> {
        Ok(JobDefinition::find_by_id(id).one(&self.db).await?)
    }

    /// Applies `patch` to the selected definitions. Returns whether any row
    /// was updated; an empty patch updates nothing.
    pub async fn update(
        &self,
        selector: DefinitionSelector,
        patch: JobDefinitionPatch,
    ) -> Result<bool, StoreError> {
        if patch.is_empty() {
            debug!(?selector, "Ignoring empty job definition patch");
            return Ok(false);
        }

        let mut update = JobDefinition::update_many();
        if let Some(is_active) = patch.is_active {
            update = update.col_expr(Column::IsActive, Expr::value(is_active));
        }
        if let Some(priority) = patch.default_priority {
            update = update.col_expr(Column::DefaultPriority, Expr::value(priority));
        }
        if let Some(attempt_max) = patch.attempt_max {
            update = update.col_expr(Column::AttemptMax, Expr::value(attempt_max));
        }
        if let Some(minutes) = patch.retry_wait_time_in_minutes {
            update = update.col_expr(Column::RetryWaitTimeInMinutes, Expr::value(minutes));
        }
        if let Some(minutes) = patch.timeout_in_minutes {
            update = update.col_expr(Column::TimeoutInMinutes, Expr::value(minutes));
        }
        if let Some(minutes) = patch.frequency_in_minutes {
            update = update.col_expr(Column::FrequencyInMinutes, Expr::value(minutes));
        }
        if let Some(minutes) = patch.full_frequency_in_minutes {
            update = update.col_expr(Column::FullFrequencyInMinutes, Expr::value(minutes));
        }
        if let Some(name) = patch.agg_processor_name {
            update = update.col_expr(Column::AggProcessorName, Expr::value(name));
        }
        if let Some(trigger) = patch.ingestion_trigger_id {
            update = update.col_expr(Column::IngestionTriggerId, Expr::value(trigger));
        }
        if let Some(metadata) = patch.metadata {
            update = update.col_expr(Column::Metadata, Expr::value(metadata.to_json()));
        }
        if let Some(ts) = patch.last_iteration_ts {
            update = update.col_expr(Column::LastIterationTs, Expr::value(to_db_time(ts)));
        }

        update = match &selector {
            DefinitionSelector::Id(id) => update.filter(Column::Id.eq(*id)),
            DefinitionSelector::Tenant(tenant_id) => {
                update.filter(Column::TenantId.eq(tenant_id.clone()))
            }
        };

        let result = update.exec(&self.db).await?;
        debug!(?selector, rows = result.rows_affected, "Updated job definitions");
        Ok(result.rows_affected > 0)
    }

    /// Returns page `page` (zero based) of the matching definitions, ordered
    /// by creation time, plus the total match count.
    pub async fn filter(
        &self,
        page: u64,
        page_size: u64,
        filter: &JobDefinitionFilter,
    ) -> Result<Page<JobDefinitionModel>, StoreError> {
        if page_size == 0 {
            return Err(StoreError::validation("page size must be positive"));
        }
        let Some(condition) = filter.condition() else {
            return Ok(Page::empty());
        };

        let query = JobDefinition::find().filter(condition);
        let total_count = query.clone().count(&self.db).await?;
        let records = query
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .offset(page * page_size)
            .limit(page_size)
            .all(&self.db)
            .await?;

        Ok(Page {
            records,
            total_count,
        })
    }

    /// Lazily scans every matching definition once, in id order, fetching
    /// small keyset pages so rows inserted behind the cursor are not revisited.
    pub fn stream_all(
        &self,
        filter: JobDefinitionFilter,
    ) -> BoxStream<'static, Result<JobDefinitionModel, StoreError>> {
        let Some(condition) = filter.condition() else {
            return stream::empty().boxed();
        };
        let db = self.db.clone();

        stream::try_unfold(Some(None::<Uuid>), move |cursor| {
            let db = db.clone();
            let condition = condition.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let mut query = JobDefinition::find().filter(condition);
                if let Some(last_id) = after {
                    query = query.filter(Column::Id.gt(last_id));
                }
                let rows = query
                    .order_by_asc(Column::Id)
                    .limit(STREAM_PAGE_SIZE)
                    .all(&db)
                    .await?;
                if rows.is_empty() {
                    return Ok(None);
                }
                let next = if (rows.len() as u64) < STREAM_PAGE_SIZE {
                    None
                } else {
                    rows.last().map(|row| Some(row.id))
                };
                Ok::<_, StoreError>(Some((rows, next)))
            }
        })
        .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    /// Advances the watermark to `new_ts` and merges `metadata_patch` into the
    /// stored metadata, but only while the stored watermark still equals
    /// `expected_previous`. Returns false when a concurrent writer moved it or
    /// when `new_ts` would not move it forward.
    pub async fn advance_watermark(
        &self,
        id: Uuid,
        expected_previous: Option<DateTime<Utc>>,
        new_ts: DateTime<Utc>,
        metadata_patch: &JobMetadata,
    ) -> Result<bool, StoreError> {
        let txn = self.db.begin().await?;
        let advanced =
            advance_watermark_in(&txn, id, expected_previous, new_ts, metadata_patch).await?;
        txn.commit().await?;
        Ok(advanced)
    }
}

/// Compare-and-swap on `last_iteration_ts` plus metadata merge, executed on
/// the caller's connection or transaction.
pub(crate) async fn advance_watermark_in<C>(
    conn: &C,
    id: Uuid,
    expected_previous: Option<DateTime<Utc>>,
    new_ts: DateTime<Utc>,
    metadata_patch: &JobMetadata,
) -> Result<bool, StoreError>
where
    C: sea_orm::ConnectionTrait,
{
    let Some(current) = JobDefinition::find_by_id(id)
        .lock_exclusive()
        .one(conn)
        .await?
    else {
        return Err(StoreError::DefinitionNotFound(id));
    };

    let expected = expected_previous.map(to_db_time);
    let new_ts = to_db_time(new_ts);

    if current.last_iteration_ts != expected {
        debug!(
            job_definition_id = %id,
            stored = ?current.last_iteration_ts,
            expected = ?expected,
            "Watermark changed concurrently; not advancing"
        );
        return Ok(false);
    }
    if current.last_iteration_ts.is_some_and(|stored| stored >= new_ts) {
        debug!(job_definition_id = %id, "Watermark would move backwards; not advancing");
        return Ok(false);
    }

    let merged = current.job_metadata().merged(metadata_patch);

    let mut update = JobDefinition::update_many()
        .col_expr(Column::LastIterationTs, Expr::value(new_ts))
        .col_expr(Column::Metadata, Expr::value(merged.to_json()))
        .filter(Column::Id.eq(id));
    update = match expected {
        Some(previous) => update.filter(Column::LastIterationTs.eq(previous)),
        None => update.filter(Column::LastIterationTs.is_null()),
    };

    let result = update.exec(conn).await?;
    if result.rows_affected > 0 {
        info!(
            job_definition_id = %id,
            last_iteration_ts = %new_ts,
            "Advanced job definition watermark"
        );
    }
    Ok(result.rows_affected > 0)
}
