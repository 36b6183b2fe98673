use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildgrid_common::model::{
    now_utc, BuildId, TokenSecret, WorkerCapabilities, WorkerId, WorkerStatus,
};
use buildgrid_common::SafeDisplay;
use tracing::info;

use crate::model::{Worker, WorkerCounts, WorkerRegisteredResponse};
use crate::repo::worker::{WorkerRecord, WorkerRepo};
use crate::repo::RepoError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerServiceError {
    #[error("Worker not found: {0}")]
    NotFound(WorkerId),
    #[error("Session token expired")]
    TokenExpired,
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SafeDisplay for WorkerServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            WorkerServiceError::NotFound(_) => self.to_string(),
            WorkerServiceError::TokenExpired => self.to_string(),
            WorkerServiceError::Validation(_) => self.to_string(),
            WorkerServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            WorkerServiceError::Internal(_) => "Internal error".to_string(),
        }
    }
}

/// Worker lifecycle: registration, heartbeat-by-rotation, graceful
/// shutdown. Liveness detection itself lives in the staleness sweep.
#[async_trait]
pub trait WorkerService: Send + Sync {
    /// Creates a fresh worker record. Names are not unique, so
    /// re-registration always produces a new identity.
    async fn register(
        &self,
        name: &str,
        capabilities: &WorkerCapabilities,
    ) -> Result<WorkerRegisteredResponse, WorkerServiceError>;

    /// The implicit heartbeat on every poll: verifies the presented session
    /// token, rotates it and bumps last_seen in the same commit, and returns
    /// the replacement. The old token stops validating once the commit
    /// returns.
    async fn heartbeat(
        &self,
        worker: &Worker,
        presented: &TokenSecret,
    ) -> Result<TokenSecret, WorkerServiceError>;

    /// Graceful shutdown: the worker goes Offline, its in-progress builds
    /// return to Pending, and the record is retained for accounting.
    async fn unregister(&self, worker_id: &WorkerId)
        -> Result<Vec<BuildId>, WorkerServiceError>;

    async fn list(&self) -> Result<Vec<Worker>, WorkerServiceError>;

    async fn counts(&self) -> Result<WorkerCounts, WorkerServiceError>;
}

pub struct WorkerServiceDefault {
    worker_repo: Arc<dyn WorkerRepo>,
    session_token_ttl: Duration,
}

impl WorkerServiceDefault {
    pub fn new(worker_repo: Arc<dyn WorkerRepo>, session_token_ttl: Duration) -> Self {
        Self {
            worker_repo,
            session_token_ttl,
        }
    }
}

#[async_trait]
impl WorkerService for WorkerServiceDefault {
    async fn register(
        &self,
        name: &str,
        capabilities: &WorkerCapabilities,
    ) -> Result<WorkerRegisteredResponse, WorkerServiceError> {
        if name.trim().is_empty() {
            return Err(WorkerServiceError::Validation(
                "worker name must not be empty".to_string(),
            ));
        }
        if capabilities.platforms.is_empty() {
            return Err(WorkerServiceError::Validation(
                "worker must support at least one platform".to_string(),
            ));
        }

        let worker_id = WorkerId::new_v4();
        let session_token = TokenSecret::generate();
        let now = now_utc();
        let record = WorkerRecord {
            id: worker_id.0,
            name: name.to_string(),
            capabilities: serde_json::to_string(capabilities)
                .map_err(|e| WorkerServiceError::Internal(e.to_string()))?,
            status: WorkerStatus::Idle.as_db_str().to_string(),
            session_token: session_token.0,
            previous_session_token: None,
            session_expires_at: now
                + chrono::Duration::from_std(self.session_token_ttl).unwrap_or_default(),
            last_seen: now,
            completed_builds: 0,
            failed_builds: 0,
            created_at: now,
            shutdown_at: None,
        };
        self.worker_repo.create(&record).await?;
        info!(worker_id = %worker_id, name, "worker registered");

        Ok(WorkerRegisteredResponse {
            worker_id,
            session_token,
        })
    }

    async fn heartbeat(
        &self,
        worker: &Worker,
        presented: &TokenSecret,
    ) -> Result<TokenSecret, WorkerServiceError> {
        let now = now_utc();
        let new_token = TokenSecret::generate();
        let new_expires_at =
            now + chrono::Duration::from_std(self.session_token_ttl).unwrap_or_default();

        let rotated = self
            .worker_repo
            .rotate_session(
                &worker.id.0,
                presented.as_uuid(),
                new_token.as_uuid(),
                new_expires_at,
                now,
            )
            .await?;
        if rotated {
            Ok(new_token)
        } else {
            // lost a rotation race: the presented token is no longer current
            Err(WorkerServiceError::TokenExpired)
        }
    }

    async fn unregister(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Vec<BuildId>, WorkerServiceError> {
        if self.worker_repo.get(&worker_id.0).await?.is_none() {
            return Err(WorkerServiceError::NotFound(*worker_id));
        }
        let now = now_utc();
        let released = self
            .worker_repo
            .mark_offline_and_release(&worker_id.0, Some(now), now)
            .await?;
        info!(worker_id = %worker_id, released = released.len(), "worker unregistered");
        Ok(released.into_iter().map(BuildId).collect())
    }

    async fn list(&self) -> Result<Vec<Worker>, WorkerServiceError> {
        let records = self.worker_repo.list().await?;
        records
            .into_iter()
            .map(|record| Worker::try_from(record).map_err(WorkerServiceError::Internal))
            .collect()
    }

    async fn counts(&self) -> Result<WorkerCounts, WorkerServiceError> {
        let counts = self.worker_repo.status_counts().await?;
        Ok(WorkerCounts {
            idle: counts.idle.max(0) as u64,
            building: counts.building.max(0) as u64,
            offline: counts.offline.max(0) as u64,
        })
    }
}
