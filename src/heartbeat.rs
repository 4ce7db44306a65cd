//! Lease keep-alive for a running job instance.
//!
//! Each beat is conditioned on the instance still being RUNNING under this
//! worker's id. The first beat that does not apply means the lease is gone;
//! the `lease_lost` token is cancelled so the pipeline stops at its next
//! checkpoint.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::config::HeartbeatConfig;
use crate::error::StoreError;
use crate::jobs::{JobInstanceId, JobStatus};
use crate::repositories::{JobInstancePatch, JobInstanceRepository};

#[derive(Clone)]
pub struct Heartbeat {
    instances: JobInstanceRepository,
    worker_id: String,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(
        instances: JobInstanceRepository,
        worker_id: impl Into<String>,
        config: &HeartbeatConfig,
    ) -> Self {
        Self {
            instances,
            worker_id: worker_id.into(),
            interval: Duration::from_secs(config.interval_seconds.max(1)),
        }
    }

    /// Sends one heartbeat. Returns false when this worker no longer holds
    /// the lease.
    pub async fn beat(&self, id: JobInstanceId) -> Result<bool, StoreError> {
        let patch = JobInstancePatch::default()
            .heartbeat(Utc::now())
            .status_condition(JobStatus::Running)
            .worker_id_condition(self.worker_id.clone());
        self.instances.update(id, patch).await
    }

    /// Beats every interval until `stop` fires or the lease is lost.
    pub fn spawn(
        self,
        id: JobInstanceId,
        lease_lost: CancellationToken,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let beats = async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = sleep(self.interval) => {
                        match self.beat(id).await {
                            Ok(true) => debug!(job_instance_id = %id, "Heartbeat recorded"),
                            Ok(false) => {
                                warn!(
                                    job_instance_id = %id,
                                    worker_id = %self.worker_id,
                                    "Lease lost; stopping heartbeat"
                                );
                                lease_lost.cancel();
                                break;
                            }
                            // A missed beat is tolerated; the reaper grace covers several intervals.
                            Err(err) => warn!(error = ?err, job_instance_id = %id, "Heartbeat failed"),
                        }
                    }
                }
            }
        };
        tokio::spawn(beats.in_current_span())
    }
}
