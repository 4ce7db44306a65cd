//! # Reaper
//!
//! Periodic maintenance over job instances:
//!
//! - **Reclaim**: RUNNING instances whose heartbeat went stale or whose
//!   timeout elapsed go back to PENDING, or to FAILURE once the definition's
//!   attempts are used up. Every transition is conditioned on the instance
//!   still being RUNNING under the worker it was read with, so a worker that
//!   finishes concurrently, or a newer lease, wins.
//! - **Retry**: FAILURE instances with attempts left return to PENDING after
//!   the definition's retry wait.
//! - **Retention**: instances older than the retention window are deleted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use metrics::{counter, histogram};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ReaperConfig;
use crate::error::StoreError;
use crate::jobs::JobStatus;
use crate::models::job_definition::Model as JobDefinitionModel;
use crate::models::job_instance::Model as JobInstanceModel;
use crate::repositories::{
    InstanceDeleteCriteria, JobDefinitionRepository, JobInstanceFilter, JobInstancePatch,
    JobInstanceRepository,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapStats {
    pub reclaimed: u64,
    pub failed_terminal: u64,
    pub retried: u64,
    pub purged: u64,
}

pub struct Reaper {
    definitions: JobDefinitionRepository,
    instances: JobInstanceRepository,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        definitions: JobDefinitionRepository,
        instances: JobInstanceRepository,
        config: ReaperConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            config,
        }
    }

    /// Run the reaper loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting job reaper");
        let tick_interval = StdDuration::from_secs(self.config.tick_interval_seconds.max(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job reaper shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = ?err, "Reaper tick failed");
                    }
                    histogram!("etl_reaper_tick_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job reaper stopped");
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ReapStats, StoreError> {
        let mut stats = ReapStats::default();
        self.reclaim_abandoned(now, &mut stats).await?;
        self.retry_failed(now, &mut stats).await?;
        stats.purged = self.purge_expired(now).await?;

        debug!(
            reclaimed = stats.reclaimed,
            failed_terminal = stats.failed_terminal,
            retried = stats.retried,
            purged = stats.purged,
            "Reaper tick completed"
        );
        Ok(stats)
    }

    /// Returns abandoned RUNNING instances to PENDING, or fails them when no
    /// attempts remain.
    pub async fn reclaim_abandoned(
        &self,
        now: DateTime<Utc>,
        stats: &mut ReapStats,
    ) -> Result<(), StoreError> {
        let grace = Duration::seconds(self.config.heartbeat_grace_seconds as i64);
        let mut definitions = DefinitionCache::new(&self.definitions);
        let mut running = self.instances.stream(JobInstanceFilter {
            statuses: Some(vec![JobStatus::Running]),
            exclude_payload: true,
            ..JobInstanceFilter::default()
        });

        while let Some(instance) = running.try_next().await? {
            if !is_abandoned(&instance, now, grace) {
                continue;
            }
            let id = instance.id();
            let Some(definition) = definitions.get(instance.job_definition_id).await? else {
                warn!(job_instance_id = %id, "Running instance without a definition");
                continue;
            };

            let exhausted = instance.attempt_count >= definition.attempt_max;
            if !self
                .instances
                .update(id, reclaim_patch(&instance, exhausted))
                .await?
            {
                debug!(job_instance_id = %id, "Instance left RUNNING or changed worker before reclaim");
                continue;
            }

            if exhausted {
                stats.failed_terminal += 1;
                counter!("etl_reaper_terminal_failures_total").increment(1);
                warn!(
                    job_instance_id = %id,
                    worker_id = ?instance.worker_id,
                    attempt_count = instance.attempt_count,
                    attempt_max = definition.attempt_max,
                    "Abandoned instance exhausted its attempts; marked failed"
                );
            } else {
                stats.reclaimed += 1;
                counter!("etl_reaper_reclaims_total").increment(1);
                info!(
                    job_instance_id = %id,
                    worker_id = ?instance.worker_id,
                    attempt_count = instance.attempt_count,
                    "Reclaimed abandoned instance"
                );
            }
        }
        Ok(())
    }

    /// Moves retryable FAILURE instances back to PENDING once their
    /// definition's retry wait has passed.
    pub async fn retry_failed(
        &self,
        now: DateTime<Utc>,
        stats: &mut ReapStats,
    ) -> Result<(), StoreError> {
        let mut definitions = DefinitionCache::new(&self.definitions);
        let mut failed = self.instances.stream(JobInstanceFilter {
            statuses: Some(vec![JobStatus::Failure]),
            below_max_attempts: Some(true),
            exclude_payload: true,
            ..JobInstanceFilter::default()
        });

        while let Some(instance) = failed.try_next().await? {
            let Some(definition) = definitions.get(instance.job_definition_id).await? else {
                continue;
            };
            if !definition.is_active {
                continue;
            }
            let wait = Duration::minutes(definition.retry_wait_time_in_minutes.max(0) as i64);
            if instance.status_changed_at.with_timezone(&Utc) + wait > now {
                continue;
            }

            let id = instance.id();
            let patch = JobInstancePatch::default()
                .status(JobStatus::Pending)
                .status_condition(JobStatus::Failure);
            if self.instances.update(id, patch).await? {
                stats.retried += 1;
                counter!("etl_reaper_retries_total").increment(1);
                info!(
                    job_instance_id = %id,
                    attempt_count = instance.attempt_count,
                    "Failed instance rescheduled for retry"
                );
            }
        }
        Ok(())
    }

    /// Deletes instances created before the retention window. A retention of
    /// zero days disables the sweep.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        if self.config.retention_days == 0 {
            return Ok(0);
        }
        let cutoff = now - Duration::days(self.config.retention_days as i64);
        let purged = self
            .instances
            .delete(InstanceDeleteCriteria {
                created_at_before: Some(cutoff),
                ..InstanceDeleteCriteria::default()
            })
            .await?;
        if purged > 0 {
            counter!("etl_reaper_purged_total").increment(purged);
        }
        Ok(purged)
    }
}

/// Whether a RUNNING instance should be reclaimed at `now`.
///
/// The liveness threshold is the smaller of the instance timeout and the
/// heartbeat grace, measured from the last heartbeat (or the start time when
/// no heartbeat was ever written). Independently, an instance whose start
/// time plus timeout has passed is abandoned regardless of heartbeats.
pub fn is_abandoned(instance: &JobInstanceModel, now: DateTime<Utc>, grace: Duration) -> bool {
    let timeout = Duration::minutes(instance.timeout_in_minutes.max(0) as i64);
    let started = instance
        .start_time
        .unwrap_or(instance.status_changed_at)
        .with_timezone(&Utc);
    if started + timeout <= now {
        return true;
    }

    let liveness = timeout.min(grace);
    let last_sign_of_life = instance
        .last_heartbeat
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(started);
    last_sign_of_life + liveness <= now
}

/// Transition for an abandoned instance, guarded by the lease it was read
/// under. A row that was reclaimed and claimed again in the meantime carries
/// a different worker id and is left alone.
pub fn reclaim_patch(instance: &JobInstanceModel, exhausted: bool) -> JobInstancePatch {
    let next_status = if exhausted {
        JobStatus::Failure
    } else {
        JobStatus::Pending
    };
    let patch = JobInstancePatch::default()
        .status(next_status)
        .status_condition(JobStatus::Running);
    match &instance.worker_id {
        Some(worker_id) => patch.worker_id_condition(worker_id.clone()),
        None => patch,
    }
}

struct DefinitionCache<'a> {
    repository: &'a JobDefinitionRepository,
    loaded: HashMap<Uuid, Option<JobDefinitionModel>>,
}

impl<'a> DefinitionCache<'a> {
    fn new(repository: &'a JobDefinitionRepository) -> Self {
        Self {
            repository,
            loaded: HashMap::new(),
        }
    }

    async fn get(&mut self, id: Uuid) -> Result<Option<JobDefinitionModel>, StoreError> {
        if let Some(cached) = self.loaded.get(&id) {
            return Ok(cached.clone());
        }
        let definition = self.repository.get(id).await?;
        self.loaded.insert(id, definition.clone());
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobPriority;
    use crate::repositories::to_db_time;

    fn running_instance(
        start: DateTime<Utc>,
        heartbeat: Option<DateTime<Utc>>,
        timeout_in_minutes: i32,
    ) -> JobInstanceModel {
        JobInstanceModel {
            job_definition_id: Uuid::new_v4(),
            instance_id: 1,
            worker_id: Some("w-1".to_string()),
            status: JobStatus::Running,
            scheduled_start_time: to_db_time(start),
            priority: JobPriority::Medium,
            attempt_count: 1,
            timeout_in_minutes,
            is_full: false,
            is_reprocessing: false,
            tags: serde_json::json!([]),
            last_heartbeat: heartbeat.map(to_db_time),
            start_time: Some(to_db_time(start)),
            status_changed_at: to_db_time(start),
            payload: None,
            payload_gcs_filename: None,
            progress: None,
            progress_details: None,
            metadata: None,
            created_at: to_db_time(start),
            updated_at: to_db_time(start),
        }
    }

    #[test]
    fn fresh_heartbeat_keeps_instance_alive() {
        let now = Utc::now();
        let instance = running_instance(now - Duration::minutes(10), Some(now), 60);
        assert!(!is_abandoned(&instance, now, Duration::minutes(5)));
    }

    #[test]
    fn stale_heartbeat_beyond_grace_is_abandoned() {
        let now = Utc::now();
        let instance = running_instance(
            now - Duration::minutes(10),
            Some(now - Duration::minutes(6)),
            60,
        );
        assert!(is_abandoned(&instance, now, Duration::minutes(5)));
    }

    #[test]
    fn heartbeat_within_short_timeout_is_alive() {
        let now = Utc::now();
        let instance = running_instance(
            now - Duration::seconds(90),
            Some(now - Duration::seconds(70)),
            2,
        );
        assert!(!is_abandoned(&instance, now, Duration::minutes(5)));
    }

    #[test]
    fn never_beaten_instance_falls_back_to_start_time() {
        let now = Utc::now();
        let instance = running_instance(now - Duration::minutes(6), None, 60);
        assert!(is_abandoned(&instance, now, Duration::minutes(5)));
    }

    #[test]
    fn elapsed_timeout_is_abandoned_despite_heartbeats() {
        let now = Utc::now();
        let instance = running_instance(now - Duration::minutes(61), Some(now), 60);
        assert!(is_abandoned(&instance, now, Duration::minutes(5)));
    }
}
