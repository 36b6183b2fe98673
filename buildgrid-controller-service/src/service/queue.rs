use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildgrid_common::model::{now_utc, BuildId, Platform, TokenSecret, WorkerId};
use buildgrid_common::SafeDisplay;
use tracing::{info, warn};

use crate::metrics;
use crate::model::{source_handle, JobAssignment, QueueCounts};
use crate::repo::build::{BuildRepo, ClaimOutcome};
use crate::repo::RepoError;

#[derive(Debug, thiserror::Error)]
pub enum QueueServiceError {
    #[error("Worker is not idle")]
    WorkerBusy,
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for QueueServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            QueueServiceError::WorkerBusy => self.to_string(),
            QueueServiceError::Internal(_) => "Internal error".to_string(),
            QueueServiceError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

/// The assignment engine: serializes the Pending -> Assigned edge so that
/// each build is handed to exactly one worker, however many workers poll
/// concurrently. Exclusivity is delegated to the store's transactional lock
/// set; nothing is coordinated in process memory.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Atomically assigns the oldest pending build to the worker and mints
    /// its bootstrap OTP, or returns `None` when nothing is eligible.
    async fn try_assign_one(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Option<JobAssignment>, QueueServiceError>;

    /// Startup hook. All queue state lives in the store, so this only audits
    /// the invariants that must hold in any reachable state and logs what it
    /// finds.
    async fn rebuild_from_store(&self) -> Result<(), QueueServiceError>;

    async fn counts(&self) -> Result<QueueCounts, QueueServiceError>;
}

pub struct QueueServiceDefault {
    build_repo: Arc<dyn BuildRepo>,
    otp_ttl: Duration,
}

impl QueueServiceDefault {
    pub fn new(build_repo: Arc<dyn BuildRepo>, otp_ttl: Duration) -> Self {
        Self {
            build_repo,
            otp_ttl,
        }
    }
}

#[async_trait]
impl QueueService for QueueServiceDefault {
    async fn try_assign_one(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Option<JobAssignment>, QueueServiceError> {
        let now = now_utc();
        let otp = TokenSecret::generate();
        let otp_expires_at = now + chrono::Duration::from_std(self.otp_ttl).unwrap_or_default();

        match self
            .build_repo
            .claim_oldest_pending(&worker_id.0, now, otp.as_uuid(), otp_expires_at)
            .await?
        {
            ClaimOutcome::Assigned(build) => {
                let build_id = BuildId(build.id);
                let platform = Platform::from_str(&build.platform)
                    .map_err(QueueServiceError::Internal)?;
                metrics::record_build_assigned();
                info!(build_id = %build_id, worker_id = %worker_id, "build assigned");
                Ok(Some(JobAssignment {
                    build_id,
                    platform,
                    source_handle: source_handle(&build_id),
                    bootstrap_otp: otp,
                }))
            }
            ClaimOutcome::NothingPending => Ok(None),
            ClaimOutcome::WorkerNotIdle => Err(QueueServiceError::WorkerBusy),
        }
    }

    async fn rebuild_from_store(&self) -> Result<(), QueueServiceError> {
        let audit = self.build_repo.audit_counts().await?;
        if audit.pending_with_worker > 0 {
            warn!(
                count = audit.pending_with_worker,
                "found pending builds with an assigned worker"
            );
        }
        if audit.in_progress_without_worker > 0 {
            warn!(
                count = audit.in_progress_without_worker,
                "found in-progress builds without an assigned worker"
            );
        }
        let counts = self.counts().await?;
        info!(
            pending = counts.pending,
            active = counts.active,
            "queue state loaded from store"
        );
        Ok(())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueServiceError> {
        let counts = self.build_repo.queue_counts().await?;
        Ok(QueueCounts {
            pending: counts.pending.max(0) as u64,
            active: counts.active.max(0) as u64,
        })
    }
}
