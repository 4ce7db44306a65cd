//! # Job Scheduler
//!
//! Background task that walks active job definitions and enqueues a PENDING
//! instance for every definition that is due. At most one PENDING or RUNNING
//! instance exists per definition; the check and the insert share the
//! definition row lock, so several scheduler processes may run side by side.
//!
//! A definition is due once `frequency_in_minutes` has passed since the later
//! of its watermark and its most recently scheduled instance. A run is full
//! when the definition has a full cadence and no full run started within it.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use metrics::{counter, histogram};
use rand::Rng;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::SchedulerConfig;
use crate::error::StoreError;
use crate::models::job_definition::Model as JobDefinitionModel;
use crate::repositories::{
    InstanceOrder, JobDefinitionFilter, JobDefinitionRepository, JobInstanceFilter,
    JobInstanceRepository, NewJobInstance, SortDirection,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub definitions_polled: u64,
    pub instances_created: u64,
    pub skipped_active: u64,
    pub skipped_not_due: u64,
    pub definitions_with_errors: u64,
}

/// Background scheduler service.
pub struct Scheduler {
    definitions: JobDefinitionRepository,
    instances: JobInstanceRepository,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        definitions: JobDefinitionRepository,
        instances: JobInstanceRepository,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            definitions,
            instances,
            config,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting job scheduler");
        let tick_interval = StdDuration::from_secs(self.config.tick_interval_seconds.max(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = ?err, "Scheduler tick failed");
                    }
                    histogram!("etl_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job scheduler stopped");
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats, StoreError> {
        let mut stats = TickStats::default();
        let mut active = self.definitions.stream_all(JobDefinitionFilter {
            is_active: Some(true),
            ..JobDefinitionFilter::default()
        });

        while let Some(definition) = active.try_next().await? {
            stats.definitions_polled += 1;
            if let Err(err) = self.schedule_definition(&definition, now, &mut stats).await {
                stats.definitions_with_errors += 1;
                error!(
                    error = ?err,
                    job_definition_id = %definition.id,
                    "Failed to schedule job definition"
                );
            }
        }

        debug!(
            polled = stats.definitions_polled,
            created = stats.instances_created,
            skipped_active = stats.skipped_active,
            skipped_not_due = stats.skipped_not_due,
            errors = stats.definitions_with_errors,
            "Scheduler tick completed"
        );
        Ok(stats)
    }

    async fn schedule_definition(
        &self,
        definition: &JobDefinitionModel,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> Result<(), StoreError> {
        let latest = self
            .instances
            .filter(
                0,
                1,
                &JobInstanceFilter {
                    job_definition_ids: Some(vec![definition.id]),
                    order_by: vec![InstanceOrder::InstanceId(SortDirection::Desc)],
                    exclude_payload: true,
                    ..JobInstanceFilter::default()
                },
            )
            .await?
            .records
            .into_iter()
            .next();

        let last_scheduled = latest
            .as_ref()
            .map(|instance| instance.scheduled_start_time.with_timezone(&Utc));
        let watermark = definition
            .last_iteration_ts
            .map(|ts| ts.with_timezone(&Utc));

        if !is_due(watermark, last_scheduled, definition.frequency_in_minutes, now) {
            stats.skipped_not_due += 1;
            return Ok(());
        }

        let is_full = full_run_due(
            definition.full_frequency_in_minutes,
            definition.job_metadata().last_full_iteration_ts(),
            now,
        );
        let jitter_seconds = sample_jitter_seconds(&self.config, definition.frequency_in_minutes);
        let scheduled_at = now + Duration::seconds(jitter_seconds as i64);

        let created = self
            .instances
            .insert_unless_active(NewJobInstance {
                scheduled_start_time: Some(scheduled_at),
                is_full,
                ..NewJobInstance::for_definition(definition.id)
            })
            .await?;

        match created {
            Some(id) => {
                stats.instances_created += 1;
                counter!(
                    "etl_scheduler_instances_created_total",
                    "integration_type" => definition.integration_type.clone()
                )
                .increment(1);
                info!(
                    job_instance_id = %id,
                    tenant_id = %definition.tenant_id,
                    integration_id = %definition.integration_id,
                    is_full,
                    jitter_seconds,
                    scheduled_at = %scheduled_at,
                    "Scheduled job instance"
                );
            }
            None => {
                stats.skipped_active += 1;
                debug!(
                    job_definition_id = %definition.id,
                    "Skipping scheduling; an instance is already pending or running"
                );
            }
        }
        Ok(())
    }
}

/// Whether a definition with the given anchors is due at `now`. A definition
/// that never ran and was never scheduled is due immediately.
pub fn is_due(
    watermark: Option<DateTime<Utc>>,
    last_scheduled: Option<DateTime<Utc>>,
    frequency_in_minutes: i32,
    now: DateTime<Utc>,
) -> bool {
    let anchor = match (watermark, last_scheduled) {
        (Some(a), Some(b)) => a.max(b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => return true,
    };
    anchor + Duration::minutes(frequency_in_minutes.max(1) as i64) <= now
}

/// Whether the next run should be a full one.
pub fn full_run_due(
    full_frequency_in_minutes: Option<i32>,
    last_full: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let Some(cadence) = full_frequency_in_minutes.filter(|minutes| *minutes > 0) else {
        return false;
    };
    match last_full {
        Some(last) => last + Duration::minutes(cadence as i64) <= now,
        None => true,
    }
}

fn sample_jitter_seconds(config: &SchedulerConfig, frequency_in_minutes: i32) -> u64 {
    let mut rng = rand::thread_rng();
    compute_jitter_seconds(config, frequency_in_minutes, &mut rng)
}

fn compute_jitter_seconds<R: Rng + ?Sized>(
    config: &SchedulerConfig,
    frequency_in_minutes: i32,
    rng: &mut R,
) -> u64 {
    let max = config.jitter_pct_max.max(0.0);
    if max == 0.0 {
        return 0;
    }
    let base_seconds = frequency_in_minutes.max(0) as f64 * 60.0;
    let jitter_pct = rng.gen_range(0.0..=max);
    (base_seconds * jitter_pct).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn never_run_definition_is_due() {
        assert!(is_due(None, None, 60, at("2026-01-01T00:00:00Z")));
    }

    #[test]
    fn due_uses_later_of_watermark_and_last_schedule() {
        let now = at("2026-01-01T12:00:00Z");
        assert!(is_due(Some(at("2026-01-01T10:30:00Z")), None, 60, now));
        assert!(!is_due(
            Some(at("2026-01-01T10:30:00Z")),
            Some(at("2026-01-01T11:30:00Z")),
            60,
            now
        ));
        assert!(is_due(
            Some(at("2026-01-01T11:30:00Z")),
            Some(at("2026-01-01T11:00:00Z")),
            30,
            now
        ));
    }

    #[test]
    fn full_runs_follow_their_own_cadence() {
        let now = at("2026-01-02T00:00:00Z");
        assert!(!full_run_due(None, None, now));
        assert!(full_run_due(Some(1440), None, now));
        assert!(!full_run_due(Some(1440), Some(at("2026-01-01T06:00:00Z")), now));
        assert!(full_run_due(Some(1440), Some(at("2026-01-01T00:00:00Z")), now));
    }

    #[test]
    fn jitter_respects_bounds() {
        let config = SchedulerConfig {
            tick_interval_seconds: 60,
            jitter_pct_max: 0.2,
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let jitter = compute_jitter_seconds(&config, 15, &mut rng);
            assert!(jitter <= 180);
        }
    }

    #[test]
    fn jitter_zero_when_disabled() {
        let config = SchedulerConfig {
            tick_interval_seconds: 60,
            jitter_pct_max: 0.0,
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        assert_eq!(compute_jitter_seconds(&config, 60, &mut rng), 0);
    }
}
