//! # Job Instance Repository
//!
//! Execution records for job definitions. Two primitives carry the
//! concurrency story:
//!
//! - `insert` allocates the next per-definition `instance_id` inside a
//!   transaction that locks the parent definition row, retrying if a
//!   concurrent writer took the same number.
//! - `update` is a single `UPDATE ... WHERE` statement that can be conditioned
//!   on the current `status` and/or `worker_id`. The returned `bool` is the only
//!   signal a caller gets that it lost a race.
//!
//! `status_changed_at` is computed in that same statement with a `CASE` on the
//! pre-update status, so it moves if and only if the status value changes.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, EntityTrait, Iterable, Order, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Select, Set, TransactionTrait, Value,
};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job_definition::advance_watermark_in;
use super::{Page, STREAM_PAGE_SIZE, db_now, to_db_time};
use crate::error::{StoreError, is_unique_violation};
use crate::jobs::{
    JobInstanceId, JobMetadata, JobPriority, JobProgress, JobProgressDetails, JobStatus,
};
use crate::models::job_definition::Entity as JobDefinition;
use crate::models::job_instance::{
    ActiveModel as JobInstanceActiveModel, Column, Entity as JobInstance,
    Model as JobInstanceModel,
};

/// Attempts at allocating an instance id before giving up.
const MAX_SEQUENCE_ATTEMPTS: u32 = 5;

/// Values for an instance to be inserted. Unset scheduling fields are copied
/// from the parent definition.
#[derive(Debug, Clone, Default)]
pub struct NewJobInstance {
    pub job_definition_id: Uuid,
    pub status: Option<JobStatus>,
    pub scheduled_start_time: Option<DateTime<Utc>>,
    pub priority: Option<JobPriority>,
    pub timeout_in_minutes: Option<i32>,
    pub is_full: bool,
    pub is_reprocessing: bool,
    pub tags: Vec<String>,
    pub payload: Option<Vec<u8>>,
    pub payload_gcs_filename: Option<String>,
    pub metadata: Option<JobMetadata>,
}

impl NewJobInstance {
    pub fn for_definition(job_definition_id: Uuid) -> Self {
        Self {
            job_definition_id,
            ..Self::default()
        }
    }
}

/// Watermark advance applied together with an instance insert.
#[derive(Debug, Clone)]
pub struct DefinitionAdvance {
    pub expected_previous: Option<DateTime<Utc>>,
    pub last_iteration_ts: DateTime<Utc>,
    pub metadata_patch: JobMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl From<SortDirection> for Order {
    fn from(direction: SortDirection) -> Self {
        match direction {
            SortDirection::Asc => Order::Asc,
            SortDirection::Desc => Order::Desc,
        }
    }
}

/// Sort keys accepted by [`JobInstanceFilter::order_by`]. Ascending priority
/// yields `High` before `Medium` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceOrder {
    StatusChangedAt(SortDirection),
    CreatedAt(SortDirection),
    InstanceId(SortDirection),
    Priority(SortDirection),
}

/// Predicate for listing, counting and streaming instances. `None` fields do
/// not filter.
#[derive(Debug, Clone, Default)]
pub struct JobInstanceFilter {
    pub instance_ids: Option<Vec<JobInstanceId>>,
    pub job_definition_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<JobStatus>>,
    /// Every listed tag must be present on the instance
    pub tags: Option<Vec<String>>,
    pub scheduled_time_at_or_before: Option<DateTime<Utc>>,
    pub last_heartbeat_before: Option<DateTime<Utc>>,
    pub last_status_change_before: Option<DateTime<Utc>>,
    pub created_at_before: Option<DateTime<Utc>>,
    pub is_full: Option<bool>,
    /// Compares `attempt_count` with the parent definition's `attempt_max`
    pub below_max_attempts: Option<bool>,
    /// Whether `start_time` (or the last status change when never started)
    /// plus the instance timeout lies in the past
    pub timed_out: Option<bool>,
    pub order_by: Vec<InstanceOrder>,
    /// Return rows with `payload` nulled out
    pub exclude_payload: bool,
}

impl JobInstanceFilter {
    fn condition(&self, backend: DatabaseBackend, now: DateTime<Utc>) -> Option<Condition> {
        let mut condition = Condition::all();

        if let Some(ids) = &self.instance_ids {
            if ids.is_empty() {
                return None;
            }
            condition = condition.add(instance_ids_condition(ids));
        }
        if let Some(definition_ids) = &self.job_definition_ids {
            if definition_ids.is_empty() {
                return None;
            }
            condition = condition.add(Column::JobDefinitionId.is_in(definition_ids.clone()));
        }
        if let Some(statuses) = &self.statuses {
            if statuses.is_empty() {
                return None;
            }
            condition = condition.add(Column::Status.is_in(statuses.clone()));
        }
        if let Some(tags) = &self.tags {
            for expr in tags_expressions(backend, tags) {
                condition = condition.add(expr);
            }
        }
        if let Some(ts) = self.scheduled_time_at_or_before {
            condition = condition.add(Column::ScheduledStartTime.lte(to_db_time(ts)));
        }
        if let Some(ts) = self.last_heartbeat_before {
            condition = condition.add(Column::LastHeartbeat.lt(to_db_time(ts)));
        }
        if let Some(ts) = self.last_status_change_before {
            condition = condition.add(Column::StatusChangedAt.lt(to_db_time(ts)));
        }
        if let Some(ts) = self.created_at_before {
            condition = condition.add(Column::CreatedAt.lt(to_db_time(ts)));
        }
        if let Some(is_full) = self.is_full {
            condition = condition.add(Column::IsFull.eq(is_full));
        }
        if let Some(below) = self.below_max_attempts {
            condition = condition.add(below_max_attempts_expression(below));
        }
        if let Some(timed_out) = self.timed_out {
            condition = condition.add(timed_out_expression(backend, now, timed_out));
        }

        Some(condition)
    }

    fn apply_order(&self, mut query: Select<JobInstance>) -> Select<JobInstance> {
        for order in &self.order_by {
            query = match *order {
                InstanceOrder::StatusChangedAt(dir) => {
                    query.order_by(Column::StatusChangedAt, dir.into())
                }
                InstanceOrder::CreatedAt(dir) => query.order_by(Column::CreatedAt, dir.into()),
                InstanceOrder::InstanceId(dir) => query.order_by(Column::InstanceId, dir.into()),
                InstanceOrder::Priority(dir) => query.order_by(Column::Priority, dir.into()),
            };
        }
        // Deterministic tie-break for paging.
        query
            .order_by_asc(Column::JobDefinitionId)
            .order_by_asc(Column::InstanceId)
    }
}

fn instance_ids_condition(ids: &[JobInstanceId]) -> Condition {
    ids.iter().fold(Condition::any(), |any, id| {
        any.add(
            Condition::all()
                .add(Column::JobDefinitionId.eq(id.job_definition_id))
                .add(Column::InstanceId.eq(id.instance_id)),
        )
    })
}

fn tags_expressions(backend: DatabaseBackend, tags: &[String]) -> Vec<SimpleExpr> {
    if tags.is_empty() {
        return Vec::new();
    }
    match backend {
        DatabaseBackend::Postgres => {
            let wanted = JsonValue::from(tags.to_vec()).to_string();
            vec![Expr::cust_with_values(
                r#""job_instances"."tags" @> CAST(? AS jsonb)"#,
                [Value::from(wanted)],
            )]
        }
        _ => tags
            .iter()
            .map(|tag| {
                Expr::cust_with_values(
                    r#"EXISTS (SELECT 1 FROM json_each("job_instances"."tags") WHERE json_each.value = ?)"#,
                    [Value::from(tag.clone())],
                )
            })
            .collect(),
    }
}

fn below_max_attempts_expression(below: bool) -> SimpleExpr {
    let operator = if below { "<" } else { ">=" };
    Expr::cust(format!(
        r#""job_instances"."attempt_count" {operator} (SELECT "job_definitions"."attempt_max" FROM "job_definitions" WHERE "job_definitions"."id" = "job_instances"."job_definition_id")"#
    ))
}

fn timed_out_expression(backend: DatabaseBackend, now: DateTime<Utc>, timed_out: bool) -> SimpleExpr {
    let predicate = match backend {
        DatabaseBackend::Postgres => Expr::cust_with_values(
            r#"(COALESCE("job_instances"."start_time", "job_instances"."status_changed_at") + make_interval(mins => "job_instances"."timeout_in_minutes")) <= ?"#,
            [Value::from(to_db_time(now))],
        ),
        _ => Expr::cust_with_values(
            r#"((julianday(?) - julianday(COALESCE("job_instances"."start_time", "job_instances"."status_changed_at"))) * 1440.0) >= "job_instances"."timeout_in_minutes""#,
            [Value::from(to_db_time(now).to_rfc3339())],
        ),
    };
    if timed_out { predicate } else { predicate.not() }
}

/// Partial, optionally conditional update of one instance. Only `Some`
/// fields are written; `progress`, `progress_details` and `metadata` replace
/// the stored documents wholesale.
#[derive(Debug, Clone, Default)]
pub struct JobInstancePatch {
    pub status: Option<JobStatus>,
    pub worker_id: Option<String>,
    /// Adds one to `attempt_count` in the database
    pub increment_attempt_count: bool,
    pub heartbeat: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub progress: Option<JobProgress>,
    pub progress_details: Option<JobProgressDetails>,
    pub payload_gcs_filename: Option<String>,
    pub metadata: Option<JobMetadata>,
    /// Apply only when the stored status equals this value
    pub status_condition: Option<JobStatus>,
    /// Apply only when the stored worker id equals this value
    pub worker_id_condition: Option<String>,
}

impl JobInstancePatch {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn increment_attempt_count(mut self) -> Self {
        self.increment_attempt_count = true;
        self
    }

    pub fn heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.heartbeat = Some(at);
        self
    }

    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn progress(mut self, progress: JobProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn progress_details(mut self, details: JobProgressDetails) -> Self {
        self.progress_details = Some(details);
        self
    }

    pub fn payload_gcs_filename(mut self, filename: impl Into<String>) -> Self {
        self.payload_gcs_filename = Some(filename.into());
        self
    }

    pub fn metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn status_condition(mut self, status: JobStatus) -> Self {
        self.status_condition = Some(status);
        self
    }

    pub fn worker_id_condition(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id_condition = Some(worker_id.into());
        self
    }
}

/// Rows removed by [`JobInstanceRepository::delete`]. At least one criterion
/// is required; both together must both match.
#[derive(Debug, Clone, Default)]
pub struct InstanceDeleteCriteria {
    pub created_at_before: Option<DateTime<Utc>>,
    pub instance_ids: Option<Vec<JobInstanceId>>,
}

/// Repository for job instance database operations
#[derive(Clone)]
pub struct JobInstanceRepository {
    db: DatabaseConnection,
}

impl JobInstanceRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts an instance under the next free `instance_id` of its definition.
    pub async fn insert(&self, instance: NewJobInstance) -> Result<JobInstanceId, StoreError> {
        match self.insert_with(instance, InsertMode::Always, None).await {
            Ok(id) => Ok(id),
            Err(outcome) => Err(outcome.into()),
        }
    }

    /// Inserts an instance unless the definition already has a PENDING or
    /// RUNNING one. The check runs under the definition row lock, so two
    /// schedulers cannot both enqueue.
    pub async fn insert_unless_active(
        &self,
        instance: NewJobInstance,
    ) -> Result<Option<JobInstanceId>, StoreError> {
        match self.insert_with(instance, InsertMode::UnlessActive, None).await {
            Ok(id) => Ok(Some(id)),
            Err(InsertOutcome::DefinitionBusy) => Ok(None),
            Err(outcome) => Err(outcome.into()),
        }
    }

    /// Inserts an instance and advances the parent definition's watermark and
    /// metadata in the same transaction. When the watermark compare-and-swap
    /// fails nothing is written and `None` is returned.
    pub async fn insert_and_advance_definition(
        &self,
        instance: NewJobInstance,
        advance: DefinitionAdvance,
    ) -> Result<Option<JobInstanceId>, StoreError> {
        match self
            .insert_with(instance, InsertMode::Always, Some(&advance))
            .await
        {
            Ok(id) => Ok(Some(id)),
            Err(InsertOutcome::WatermarkMoved) => Ok(None),
            Err(outcome) => Err(outcome.into()),
        }
    }

    async fn insert_with(
        &self,
        instance: NewJobInstance,
        mode: InsertMode,
        advance: Option<&DefinitionAdvance>,
    ) -> Result<JobInstanceId, InsertOutcome> {
        let definition_id = instance.job_definition_id;

        for attempt in 1..=MAX_SEQUENCE_ATTEMPTS {
            let txn = self.db.begin().await.map_err(StoreError::from)?;

            match insert_in_txn(&txn, &instance, mode).await {
                Ok(None) => {
                    txn.rollback().await.map_err(StoreError::from)?;
                    debug!(
                        job_definition_id = %definition_id,
                        "Definition already has an active instance; not inserting"
                    );
                    return Err(InsertOutcome::DefinitionBusy);
                }
                Ok(Some(id)) => {
                    if let Some(advance) = advance {
                        let advanced = advance_watermark_in(
                            &txn,
                            definition_id,
                            advance.expected_previous,
                            advance.last_iteration_ts,
                            &advance.metadata_patch,
                        )
                        .await?;
                        if !advanced {
                            txn.rollback().await.map_err(StoreError::from)?;
                            return Err(InsertOutcome::WatermarkMoved);
                        }
                    }
                    txn.commit().await.map_err(StoreError::from)?;
                    info!(
                        job_definition_id = %definition_id,
                        instance_id = id.instance_id,
                        "Created job instance"
                    );
                    return Ok(id);
                }
                Err(StoreError::Database(err)) if is_unique_violation(&err) => {
                    txn.rollback().await.map_err(StoreError::from)?;
                    warn!(
                        job_definition_id = %definition_id,
                        attempt,
                        "Instance id taken by a concurrent insert; retrying"
                    );
                }
                Err(err) => {
                    txn.rollback().await.map_err(StoreError::from)?;
                    error!(error = ?err, job_definition_id = %definition_id, "Failed to insert job instance");
                    return Err(err.into());
                }
            }
        }

        Err(StoreError::SequenceContention {
            job_definition_id: definition_id,
            attempts: MAX_SEQUENCE_ATTEMPTS,
        }
        .into())
    }

    pub async fn get(&self, id: JobInstanceId) -> Result<Option<JobInstanceModel>, StoreError> {
        Ok(
            JobInstance::find_by_id((id.job_definition_id, id.instance_id))
                .one(&self.db)
                .await?,
        )
    }

    /// Returns page `page` (zero based) of the matching instances plus the
    /// total match count.
    pub async fn filter(
        &self,
        page: u64,
        page_size: u64,
        filter: &JobInstanceFilter,
    ) -> Result<Page<JobInstanceModel>, StoreError> {
        if page_size == 0 {
            return Err(StoreError::validation("page size must be positive"));
        }
        let backend = self.db.get_database_backend();
        let Some(condition) = filter.condition(backend, Utc::now()) else {
            return Ok(Page::empty());
        };

        let total_count = JobInstance::find()
            .filter(condition.clone())
            .count(&self.db)
            .await?;

        let query = filter.apply_order(JobInstance::find().filter(condition));
        let query = query.offset(page * page_size).limit(page_size);
        let records = if filter.exclude_payload {
            without_payload(query).all(&self.db).await?
        } else {
            query.all(&self.db).await?
        };

        Ok(Page {
            records,
            total_count,
        })
    }

    pub async fn count(&self, filter: &JobInstanceFilter) -> Result<u64, StoreError> {
        let backend = self.db.get_database_backend();
        let Some(condition) = filter.condition(backend, Utc::now()) else {
            return Ok(0);
        };
        Ok(JobInstance::find().filter(condition).count(&self.db).await?)
    }

    /// Lazily scans every matching instance once in key order. `order_by` is
    /// ignored; keyset paging keeps the scan stable while rows are updated.
    pub fn stream(
        &self,
        filter: JobInstanceFilter,
    ) -> BoxStream<'static, Result<JobInstanceModel, StoreError>> {
        let db = self.db.clone();
        let backend = db.get_database_backend();
        let Some(condition) = filter.condition(backend, Utc::now()) else {
            return stream::empty().boxed();
        };
        let exclude_payload = filter.exclude_payload;

        stream::try_unfold(Some(None::<JobInstanceId>), move |cursor| {
            let db = db.clone();
            let condition = condition.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let mut query = JobInstance::find().filter(condition);
                if let Some(last) = after {
                    query = query.filter(
                        Condition::any()
                            .add(Column::JobDefinitionId.gt(last.job_definition_id))
                            .add(
                                Condition::all()
                                    .add(Column::JobDefinitionId.eq(last.job_definition_id))
                                    .add(Column::InstanceId.gt(last.instance_id)),
                            ),
                    );
                }
                let query = query
                    .order_by_asc(Column::JobDefinitionId)
                    .order_by_asc(Column::InstanceId)
                    .limit(STREAM_PAGE_SIZE);
                let rows = if exclude_payload {
                    without_payload(query).all(&db).await?
                } else {
                    query.all(&db).await?
                };
                if rows.is_empty() {
                    return Ok(None);
                }
                let next = if (rows.len() as u64) < STREAM_PAGE_SIZE {
                    None
                } else {
                    rows.last().map(|row| Some(row.id()))
                };
                Ok::<_, StoreError>(Some((rows, next)))
            }
        })
        .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    /// Applies `patch` in one statement. Returns false, leaving the row
    /// untouched, when the instance does not exist or a condition does not
    /// hold.
    ///
    /// `updated_at` is stamped on every matching row, so an empty patch is a
    /// touch: it returns true for an existing row whose conditions hold and
    /// changes nothing else.
    pub async fn update(
        &self,
        id: JobInstanceId,
        patch: JobInstancePatch,
    ) -> Result<bool, StoreError> {
        let now = db_now();
        let mut update = JobInstance::update_many().col_expr(Column::UpdatedAt, Expr::value(now));

        if let Some(status) = patch.status {
            let status_changed_at: SimpleExpr =
                Expr::case(Column::Status.eq(status), Expr::col(Column::StatusChangedAt))
                    .finally(Expr::value(now))
                    .into();
            update = update
                .col_expr(Column::StatusChangedAt, status_changed_at)
                .col_expr(Column::Status, Expr::value(status));
        }
        if let Some(worker_id) = &patch.worker_id {
            update = update.col_expr(Column::WorkerId, Expr::value(worker_id.clone()));
        }
        if patch.increment_attempt_count {
            update = update.col_expr(Column::AttemptCount, Expr::col(Column::AttemptCount).add(1));
        }
        if let Some(heartbeat) = patch.heartbeat {
            update = update.col_expr(Column::LastHeartbeat, Expr::value(to_db_time(heartbeat)));
        }
        if let Some(start_time) = patch.start_time {
            update = update.col_expr(Column::StartTime, Expr::value(to_db_time(start_time)));
        }
        if let Some(progress) = &patch.progress {
            update = update.col_expr(Column::Progress, Expr::value(progress.to_json()));
        }
        if let Some(details) = &patch.progress_details {
            update = update.col_expr(Column::ProgressDetails, Expr::value(details.to_json()));
        }
        if let Some(filename) = &patch.payload_gcs_filename {
            update = update.col_expr(Column::PayloadGcsFilename, Expr::value(filename.clone()));
        }
        if let Some(metadata) = &patch.metadata {
            update = update.col_expr(Column::Metadata, Expr::value(metadata.to_json()));
        }

        update = update
            .filter(Column::JobDefinitionId.eq(id.job_definition_id))
            .filter(Column::InstanceId.eq(id.instance_id));
        if let Some(expected) = patch.status_condition {
            update = update.filter(Column::Status.eq(expected));
        }
        if let Some(expected) = &patch.worker_id_condition {
            update = update.filter(Column::WorkerId.eq(expected.clone()));
        }

        let result = update.exec(&self.db).await.map_err(|err| {
            error!(error = ?err, job_instance_id = %id, "Failed to update job instance");
            StoreError::from(err)
        })?;

        let applied = result.rows_affected > 0;
        debug!(
            job_instance_id = %id,
            applied,
            status = ?patch.status,
            status_condition = ?patch.status_condition,
            "Conditional job instance update"
        );
        Ok(applied)
    }

    /// Bulk delete for retention. Never touches job definitions.
    pub async fn delete(&self, criteria: InstanceDeleteCriteria) -> Result<u64, StoreError> {
        if criteria.created_at_before.is_none() && criteria.instance_ids.is_none() {
            return Err(StoreError::validation(
                "instance delete requires created_at_before or instance ids",
            ));
        }

        let mut delete = JobInstance::delete_many();
        if let Some(cutoff) = criteria.created_at_before {
            delete = delete.filter(Column::CreatedAt.lt(to_db_time(cutoff)));
        }
        if let Some(ids) = &criteria.instance_ids {
            if ids.is_empty() {
                return Ok(0);
            }
            delete = delete.filter(instance_ids_condition(ids));
        }

        let result = delete.exec(&self.db).await?;
        if result.rows_affected > 0 {
            info!(rows = result.rows_affected, "Deleted job instances");
        }
        Ok(result.rows_affected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertMode {
    Always,
    UnlessActive,
}

enum InsertOutcome {
    WatermarkMoved,
    DefinitionBusy,
    Store(StoreError),
}

impl From<StoreError> for InsertOutcome {
    fn from(err: StoreError) -> Self {
        InsertOutcome::Store(err)
    }
}

impl From<InsertOutcome> for StoreError {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Store(err) => err,
            InsertOutcome::WatermarkMoved => {
                StoreError::validation("job definition watermark moved concurrently")
            }
            InsertOutcome::DefinitionBusy => {
                StoreError::validation("job definition already has an active instance")
            }
        }
    }
}

/// Selects every column except `payload`, which is returned as NULL.
fn without_payload(query: Select<JobInstance>) -> Select<JobInstance> {
    query
        .select_only()
        .columns(Column::iter().filter(|column| !matches!(column, Column::Payload)))
        .expr_as(Expr::cust("NULL"), "payload")
}

async fn insert_in_txn(
    txn: &DatabaseTransaction,
    instance: &NewJobInstance,
    mode: InsertMode,
) -> Result<Option<JobInstanceId>, StoreError> {
    let Some(definition) = JobDefinition::find_by_id(instance.job_definition_id)
        .lock_exclusive()
        .one(txn)
        .await?
    else {
        return Err(StoreError::DefinitionNotFound(instance.job_definition_id));
    };

    if mode == InsertMode::UnlessActive {
        let active = JobInstance::find()
            .filter(Column::JobDefinitionId.eq(instance.job_definition_id))
            .filter(Column::Status.is_in([JobStatus::Pending, JobStatus::Running]))
            .count(txn)
            .await?;
        if active > 0 {
            return Ok(None);
        }
    }

    let max_instance_id: Option<Option<i64>> = JobInstance::find()
        .select_only()
        .column_as(Column::InstanceId.max(), "max_instance_id")
        .filter(Column::JobDefinitionId.eq(instance.job_definition_id))
        .into_tuple()
        .one(txn)
        .await?;
    let next_instance_id = max_instance_id.flatten().unwrap_or(0) + 1;

    let now = db_now();
    let metadata = instance
        .metadata
        .as_ref()
        .filter(|m| !m.is_empty())
        .map(JobMetadata::to_json);

    let model = JobInstanceActiveModel {
        job_definition_id: Set(instance.job_definition_id),
        instance_id: Set(next_instance_id),
        worker_id: Set(None),
        status: Set(instance.status.unwrap_or_default()),
        scheduled_start_time: Set(instance.scheduled_start_time.map(to_db_time).unwrap_or(now)),
        priority: Set(instance.priority.unwrap_or(definition.default_priority)),
        attempt_count: Set(0),
        timeout_in_minutes: Set(instance
            .timeout_in_minutes
            .unwrap_or(definition.timeout_in_minutes)),
        is_full: Set(instance.is_full),
        is_reprocessing: Set(instance.is_reprocessing),
        tags: Set(JsonValue::from(instance.tags.clone())),
        last_heartbeat: Set(None),
        start_time: Set(None),
        status_changed_at: Set(now),
        payload: Set(instance.payload.clone()),
        payload_gcs_filename: Set(instance.payload_gcs_filename.clone()),
        progress: Set(None),
        progress_details: Set(None),
        metadata: Set(metadata),
        created_at: Set(now),
        updated_at: Set(now),
    };

    JobInstance::insert(model)
        .exec_without_returning(txn)
        .await?;

    Ok(Some(JobInstanceId::new(
        instance.job_definition_id,
        next_instance_id,
    )))
}
