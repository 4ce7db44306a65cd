//! # Dispatcher
//!
//! Claims due job instances for this worker. A claim is a conditional update
//! `PENDING -> RUNNING` keyed on the current status; the store decides which
//! of several concurrent claimants wins and losers simply move on to the next
//! candidate.

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info, instrument};

use crate::config::DispatcherConfig;
use crate::error::StoreError;
use crate::jobs::{JobInstanceId, JobStatus};
use crate::models::job_instance::Model as JobInstanceModel;
use crate::repositories::{
    InstanceOrder, JobInstanceFilter, JobInstancePatch, JobInstanceRepository, SortDirection,
};

#[derive(Clone)]
pub struct Dispatcher {
    instances: JobInstanceRepository,
    worker_id: String,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        instances: JobInstanceRepository,
        worker_id: impl Into<String>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            instances,
            worker_id: worker_id.into(),
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Pending, due, not over-attempted instances in claim order: priority
    /// ascending (HIGH first), then instance id.
    pub fn eligible_filter(now: DateTime<Utc>) -> JobInstanceFilter {
        JobInstanceFilter {
            statuses: Some(vec![JobStatus::Pending]),
            scheduled_time_at_or_before: Some(now),
            below_max_attempts: Some(true),
            order_by: vec![
                InstanceOrder::Priority(SortDirection::Asc),
                InstanceOrder::InstanceId(SortDirection::Asc),
            ],
            exclude_payload: true,
            ..JobInstanceFilter::default()
        }
    }

    /// Up to `claim_batch` claimable instances, best first. Nothing is leased.
    pub async fn candidates(&self, now: DateTime<Utc>) -> Result<Vec<JobInstanceModel>, StoreError> {
        let page = self
            .instances
            .filter(0, self.config.claim_batch.max(1), &Self::eligible_filter(now))
            .await?;
        Ok(page.records)
    }

    /// Attempts to lease `id` for this worker. Returns false when another
    /// worker got there first or the instance is no longer pending.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn try_claim(&self, id: JobInstanceId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        counter!("etl_dispatcher_claims_attempted_total").increment(1);

        let patch = JobInstancePatch::default()
            .status(JobStatus::Running)
            .worker_id(self.worker_id.clone())
            .start_time(now)
            .heartbeat(now)
            .increment_attempt_count()
            .status_condition(JobStatus::Pending);

        let won = self.instances.update(id, patch).await?;
        if won {
            counter!("etl_dispatcher_claims_won_total").increment(1);
            info!(job_instance_id = %id, "Claimed job instance");
        } else {
            counter!("etl_dispatcher_claims_lost_total").increment(1);
            debug!(job_instance_id = %id, "Claim lost to another worker");
        }
        Ok(won)
    }

    /// Claims up to `max` instances, skipping candidates lost to other
    /// workers. Returns the leased rows as stored after the claim.
    pub async fn claim(&self, max: usize) -> Result<Vec<JobInstanceModel>, StoreError> {
        let now = Utc::now();
        let mut claimed = Vec::new();
        for candidate in self.candidates(now).await? {
            if claimed.len() >= max {
                break;
            }
            let id = candidate.id();
            if self.try_claim(id, now).await? {
                if let Some(leased) = self.instances.get(id).await? {
                    claimed.push(leased);
                }
            }
        }
        Ok(claimed)
    }
}
