use std::ops::Deref;
use std::result::Result;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use buildgrid_common::model::{
    BuildId, BuildStatus, Platform, TokenSecret, WorkerId,
};
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use uuid::Uuid;

use crate::model::Build;
use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BuildRecord {
    pub id: Uuid,
    pub platform: String,
    pub status: String,
    pub worker_id: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source_path: String,
    pub credentials_path: Option<String>,
    pub result_path: Option<String>,
    pub failure_reason: Option<String>,
    pub access_token: Uuid,
}

impl TryFrom<BuildRecord> for Build {
    type Error = String;

    fn try_from(value: BuildRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: BuildId(value.id),
            platform: Platform::from_str(&value.platform)?,
            status: BuildStatus::from_str(&value.status)?,
            worker_id: value.worker_id.map(WorkerId),
            submitted_at: value.submitted_at,
            assigned_at: value.assigned_at,
            started_at: value.started_at,
            completed_at: value.completed_at,
            source_path: value.source_path,
            credentials_path: value.credentials_path,
            result_path: value.result_path,
            failure_reason: value.failure_reason,
            access_token: TokenSecret(value.access_token),
        })
    }
}

impl From<Build> for BuildRecord {
    fn from(value: Build) -> Self {
        Self {
            id: value.id.0,
            platform: value.platform.as_db_str().to_string(),
            status: value.status.as_db_str().to_string(),
            worker_id: value.worker_id.map(|w| w.0),
            submitted_at: value.submitted_at,
            assigned_at: value.assigned_at,
            started_at: value.started_at,
            completed_at: value.completed_at,
            source_path: value.source_path,
            credentials_path: value.credentials_path,
            result_path: value.result_path,
            failure_reason: value.failure_reason,
            access_token: value.access_token.0,
        }
    }
}

#[derive(Debug)]
pub enum ClaimOutcome {
    Assigned(BuildRecord),
    NothingPending,
    WorkerNotIdle,
}

#[derive(Debug)]
pub enum OutcomeOutcome {
    Applied(BuildRecord),
    NotFound,
    WrongWorker,
    InvalidStatus(String),
}

#[derive(Debug)]
pub enum CancelOutcome {
    Cancelled(BuildRecord),
    NotFound,
    InvalidStatus(String),
}

#[derive(Debug)]
pub enum RetryOutcome {
    Created,
    NotFound,
    InvalidStatus(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildQueueCounts {
    pub pending: i64,
    pub active: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildAuditCounts {
    pub pending_with_worker: i64,
    pub in_progress_without_worker: i64,
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Inserts the build and its "submitted" log entry in one transaction.
    async fn create(&self, build: &BuildRecord, log_message: &str) -> Result<(), RepoError>;

    async fn get(&self, build_id: &Uuid) -> Result<Option<BuildRecord>, RepoError>;

    async fn get_by_access_token(
        &self,
        access_token: &Uuid,
    ) -> Result<Option<BuildRecord>, RepoError>;

    async fn list_active(&self) -> Result<Vec<BuildRecord>, RepoError>;

    async fn list_recent(&self, limit: i64) -> Result<Vec<BuildRecord>, RepoError>;

    /// The Pending -> Assigned edge. Picks the oldest pending build (FIFO by
    /// submitted_at, id as tiebreak), marks the worker Building, records the
    /// bootstrap OTP, all in a single transaction. Exactly one concurrent
    /// caller can win any given build.
    async fn claim_oldest_pending(
        &self,
        worker_id: &Uuid,
        now: DateTime<Utc>,
        otp_secret: &Uuid,
        otp_expires_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RepoError>;

    /// Assigned -> Building, triggered by the guest's first artifact channel
    /// call. Returns true only when the transition actually happened; a
    /// repeated call or any other status is a no-op.
    async fn mark_building(&self, build_id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepoError>;

    /// Terminal transition reported by the owning worker. Updates the build,
    /// flips the worker back to Idle, bumps its counters and revokes the
    /// build's guest tokens in one transaction.
    async fn record_outcome(
        &self,
        build_id: &Uuid,
        worker_id: &Uuid,
        success: bool,
        result_path: Option<String>,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<OutcomeOutcome, RepoError>;

    async fn cancel(&self, build_id: &Uuid, now: DateTime<Utc>) -> Result<CancelOutcome, RepoError>;

    /// Retry-as-new-build: verifies the original is Failed, inserts the new
    /// Pending record and cross-referencing log entries on both builds.
    async fn create_retry(
        &self,
        original_id: &Uuid,
        new_build: &BuildRecord,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, RepoError>;

    async fn queue_counts(&self) -> Result<BuildQueueCounts, RepoError>;

    async fn audit_counts(&self) -> Result<BuildAuditCounts, RepoError>;
}

pub struct DbBuildRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbBuildRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const BUILD_COLUMNS: &str = "id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token";

#[async_trait]
impl BuildRepo for DbBuildRepo<sqlx::Postgres> {
    async fn create(&self, build: &BuildRecord, log_message: &str) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            r#"
              INSERT INTO builds
                (id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(build.id)
        .bind(build.platform.clone())
        .bind(build.status.clone())
        .bind(build.worker_id)
        .bind(build.submitted_at)
        .bind(build.assigned_at)
        .bind(build.started_at)
        .bind(build.completed_at)
        .bind(build.source_path.clone())
        .bind(build.credentials_path.clone())
        .bind(build.result_path.clone())
        .bind(build.failure_reason.clone())
        .bind(build.access_token)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', $2, $3)",
        )
        .bind(build.id)
        .bind(log_message)
        .bind(build.submitted_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, build_id: &Uuid) -> Result<Option<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token FROM builds WHERE id = $1",
        )
        .bind(build_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_by_access_token(
        &self,
        access_token: &Uuid,
    ) -> Result<Option<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token FROM builds WHERE access_token = $1",
        )
        .bind(access_token)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_active(&self) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token FROM builds WHERE status IN ('assigned', 'building') ORDER BY submitted_at, id",
        )
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token FROM builds ORDER BY submitted_at DESC, id LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn claim_oldest_pending(
        &self,
        worker_id: &Uuid,
        now: DateTime<Utc>,
        otp_secret: &Uuid,
        otp_expires_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let worker_updated =
            sqlx::query("UPDATE workers SET status = 'building' WHERE id = $1 AND status = 'idle'")
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
        if worker_updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ClaimOutcome::WorkerNotIdle);
        }

        // skip-locked keeps concurrent pollers from serializing on the head
        // of the queue; each caller locks a disjoint candidate row
        let candidate: Option<(Uuid,)> = sqlx::query_as(
            r#"
              SELECT id FROM builds
              WHERE status = 'pending'
              ORDER BY submitted_at, id
              LIMIT 1
              FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some((build_id,)) = candidate else {
            tx.rollback().await?;
            return Ok(ClaimOutcome::NothingPending);
        };

        let build = sqlx::query_as::<_, BuildRecord>(&format!(
            "UPDATE builds SET status = 'assigned', worker_id = $2, assigned_at = $3 WHERE id = $1 RETURNING {BUILD_COLUMNS}",
        ))
        .bind(build_id)
        .bind(worker_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO tokens (secret, class, build_id, worker_id, expires_at, consumed, created_at) VALUES ($1, 'bootstrap_otp', $2, $3, $4, FALSE, $5)",
        )
        .bind(otp_secret)
        .bind(build_id)
        .bind(worker_id)
        .bind(otp_expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', $2, $3)",
        )
        .bind(build_id)
        .bind(format!("assigned to worker {worker_id}"))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ClaimOutcome::Assigned(build))
    }

    async fn mark_building(&self, build_id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'building', started_at = $2 WHERE id = $1 AND status = 'assigned'",
        )
        .bind(build_id)
        .bind(now)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(
        &self,
        build_id: &Uuid,
        worker_id: &Uuid,
        success: bool,
        result_path: Option<String>,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<OutcomeOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let current: Option<(String, Option<Uuid>)> =
            sqlx::query_as("SELECT status, worker_id FROM builds WHERE id = $1 FOR UPDATE")
                .bind(build_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status, assigned_worker)) = current else {
            tx.rollback().await?;
            return Ok(OutcomeOutcome::NotFound);
        };
        if !matches!(status.as_str(), "assigned" | "building") {
            tx.rollback().await?;
            return Ok(OutcomeOutcome::InvalidStatus(status));
        }
        if assigned_worker != Some(*worker_id) {
            tx.rollback().await?;
            return Ok(OutcomeOutcome::WrongWorker);
        }

        let new_status = if success { "completed" } else { "failed" };
        let build = sqlx::query_as::<_, BuildRecord>(&format!(
            "UPDATE builds SET status = $2, completed_at = $3, result_path = $4, failure_reason = $5 WHERE id = $1 RETURNING {BUILD_COLUMNS}",
        ))
        .bind(build_id)
        .bind(new_status)
        .bind(now)
        .bind(result_path)
        .bind(failure_reason.clone())
        .fetch_one(&mut *tx)
        .await?;

        let counter_update = if success {
            "UPDATE workers SET status = 'idle', completed_builds = completed_builds + 1 WHERE id = $1"
        } else {
            "UPDATE workers SET status = 'idle', failed_builds = failed_builds + 1 WHERE id = $1"
        };
        sqlx::query(counter_update)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        // revoke all build-scoped guest tokens and OTPs on terminal transition
        sqlx::query("DELETE FROM tokens WHERE build_id = $1")
            .bind(build_id)
            .execute(&mut *tx)
            .await?;

        let message = if success {
            "build completed".to_string()
        } else {
            format!(
                "build failed: {}",
                failure_reason.as_deref().unwrap_or("unknown failure")
            )
        };
        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(build_id)
        .bind(if success { "info" } else { "error" })
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(OutcomeOutcome::Applied(build))
    }

    async fn cancel(
        &self,
        build_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM builds WHERE id = $1 FOR UPDATE")
                .bind(build_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = current else {
            tx.rollback().await?;
            return Ok(CancelOutcome::NotFound);
        };
        if status != "pending" {
            tx.rollback().await?;
            return Ok(CancelOutcome::InvalidStatus(status));
        }

        let build = sqlx::query_as::<_, BuildRecord>(&format!(
            "UPDATE builds SET status = 'cancelled', completed_at = $2 WHERE id = $1 RETURNING {BUILD_COLUMNS}",
        ))
        .bind(build_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', 'cancelled by submitter', $2)",
        )
        .bind(build_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CancelOutcome::Cancelled(build))
    }

    async fn create_retry(
        &self,
        original_id: &Uuid,
        new_build: &BuildRecord,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM builds WHERE id = $1 FOR UPDATE")
                .bind(original_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = current else {
            tx.rollback().await?;
            return Ok(RetryOutcome::NotFound);
        };
        if status != "failed" {
            tx.rollback().await?;
            return Ok(RetryOutcome::InvalidStatus(status));
        }

        sqlx::query(
            r#"
              INSERT INTO builds
                (id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(new_build.id)
        .bind(new_build.platform.clone())
        .bind(new_build.status.clone())
        .bind(new_build.worker_id)
        .bind(new_build.submitted_at)
        .bind(new_build.assigned_at)
        .bind(new_build.started_at)
        .bind(new_build.completed_at)
        .bind(new_build.source_path.clone())
        .bind(new_build.credentials_path.clone())
        .bind(new_build.result_path.clone())
        .bind(new_build.failure_reason.clone())
        .bind(new_build.access_token)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', $2, $3)",
        )
        .bind(original_id)
        .bind(format!("retried as build {}", new_build.id))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', $2, $3)",
        )
        .bind(new_build.id)
        .bind(format!("retry of build {original_id}"))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RetryOutcome::Created)
    }

    async fn queue_counts(&self) -> Result<BuildQueueCounts, RepoError> {
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE status = 'pending'")
                .fetch_one(self.db_pool.deref())
                .await?;
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE status IN ('assigned', 'building')",
        )
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(BuildQueueCounts { pending, active })
    }

    async fn audit_counts(&self) -> Result<BuildAuditCounts, RepoError> {
        let pending_with_worker: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE status = 'pending' AND worker_id IS NOT NULL",
        )
        .fetch_one(self.db_pool.deref())
        .await?;
        let in_progress_without_worker: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE status IN ('assigned', 'building') AND worker_id IS NULL",
        )
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(BuildAuditCounts {
            pending_with_worker,
            in_progress_without_worker,
        })
    }
}

#[async_trait]
impl BuildRepo for DbBuildRepo<sqlx::Sqlite> {
    async fn create(&self, build: &BuildRecord, log_message: &str) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            r#"
              INSERT INTO builds
                (id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(build.id)
        .bind(build.platform.clone())
        .bind(build.status.clone())
        .bind(build.worker_id)
        .bind(build.submitted_at)
        .bind(build.assigned_at)
        .bind(build.started_at)
        .bind(build.completed_at)
        .bind(build.source_path.clone())
        .bind(build.credentials_path.clone())
        .bind(build.result_path.clone())
        .bind(build.failure_reason.clone())
        .bind(build.access_token)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', $2, $3)",
        )
        .bind(build.id)
        .bind(log_message)
        .bind(build.submitted_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, build_id: &Uuid) -> Result<Option<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token FROM builds WHERE id = $1",
        )
        .bind(build_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_by_access_token(
        &self,
        access_token: &Uuid,
    ) -> Result<Option<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token FROM builds WHERE access_token = $1",
        )
        .bind(access_token)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_active(&self) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token FROM builds WHERE status IN ('assigned', 'building') ORDER BY submitted_at, id",
        )
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token FROM builds ORDER BY submitted_at DESC, id LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn claim_oldest_pending(
        &self,
        worker_id: &Uuid,
        now: DateTime<Utc>,
        otp_secret: &Uuid,
        otp_expires_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let worker_updated =
            sqlx::query("UPDATE workers SET status = 'building' WHERE id = $1 AND status = 'idle'")
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
        if worker_updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ClaimOutcome::WorkerNotIdle);
        }

        // SQLite has no skip-locked, but writers are serialized, so the
        // status guard on the update makes the claim atomic
        let build = sqlx::query_as::<_, BuildRecord>(&format!(
            r#"
              UPDATE builds SET status = 'assigned', worker_id = $1, assigned_at = $2
              WHERE id = (SELECT id FROM builds WHERE status = 'pending' ORDER BY submitted_at, id LIMIT 1)
                AND status = 'pending'
              RETURNING {BUILD_COLUMNS}
            "#,
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(build) = build else {
            tx.rollback().await?;
            return Ok(ClaimOutcome::NothingPending);
        };

        sqlx::query(
            "INSERT INTO tokens (secret, class, build_id, worker_id, expires_at, consumed, created_at) VALUES ($1, 'bootstrap_otp', $2, $3, $4, FALSE, $5)",
        )
        .bind(otp_secret)
        .bind(build.id)
        .bind(worker_id)
        .bind(otp_expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', $2, $3)",
        )
        .bind(build.id)
        .bind(format!("assigned to worker {worker_id}"))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ClaimOutcome::Assigned(build))
    }

    async fn mark_building(&self, build_id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'building', started_at = $2 WHERE id = $1 AND status = 'assigned'",
        )
        .bind(build_id)
        .bind(now)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(
        &self,
        build_id: &Uuid,
        worker_id: &Uuid,
        success: bool,
        result_path: Option<String>,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<OutcomeOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let current: Option<(String, Option<Uuid>)> =
            sqlx::query_as("SELECT status, worker_id FROM builds WHERE id = $1")
                .bind(build_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status, assigned_worker)) = current else {
            tx.rollback().await?;
            return Ok(OutcomeOutcome::NotFound);
        };
        if !matches!(status.as_str(), "assigned" | "building") {
            tx.rollback().await?;
            return Ok(OutcomeOutcome::InvalidStatus(status));
        }
        if assigned_worker != Some(*worker_id) {
            tx.rollback().await?;
            return Ok(OutcomeOutcome::WrongWorker);
        }

        let new_status = if success { "completed" } else { "failed" };
        let build = sqlx::query_as::<_, BuildRecord>(&format!(
            "UPDATE builds SET status = $2, completed_at = $3, result_path = $4, failure_reason = $5 WHERE id = $1 RETURNING {BUILD_COLUMNS}",
        ))
        .bind(build_id)
        .bind(new_status)
        .bind(now)
        .bind(result_path)
        .bind(failure_reason.clone())
        .fetch_one(&mut *tx)
        .await?;

        let counter_update = if success {
            "UPDATE workers SET status = 'idle', completed_builds = completed_builds + 1 WHERE id = $1"
        } else {
            "UPDATE workers SET status = 'idle', failed_builds = failed_builds + 1 WHERE id = $1"
        };
        sqlx::query(counter_update)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM tokens WHERE build_id = $1")
            .bind(build_id)
            .execute(&mut *tx)
            .await?;

        let message = if success {
            "build completed".to_string()
        } else {
            format!(
                "build failed: {}",
                failure_reason.as_deref().unwrap_or("unknown failure")
            )
        };
        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(build_id)
        .bind(if success { "info" } else { "error" })
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(OutcomeOutcome::Applied(build))
    }

    async fn cancel(
        &self,
        build_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM builds WHERE id = $1")
                .bind(build_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = current else {
            tx.rollback().await?;
            return Ok(CancelOutcome::NotFound);
        };
        if status != "pending" {
            tx.rollback().await?;
            return Ok(CancelOutcome::InvalidStatus(status));
        }

        let build = sqlx::query_as::<_, BuildRecord>(&format!(
            "UPDATE builds SET status = 'cancelled', completed_at = $2 WHERE id = $1 AND status = 'pending' RETURNING {BUILD_COLUMNS}",
        ))
        .bind(build_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', 'cancelled by submitter', $2)",
        )
        .bind(build_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CancelOutcome::Cancelled(build))
    }

    async fn create_retry(
        &self,
        original_id: &Uuid,
        new_build: &BuildRecord,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM builds WHERE id = $1")
                .bind(original_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((status,)) = current else {
            tx.rollback().await?;
            return Ok(RetryOutcome::NotFound);
        };
        if status != "failed" {
            tx.rollback().await?;
            return Ok(RetryOutcome::InvalidStatus(status));
        }

        sqlx::query(
            r#"
              INSERT INTO builds
                (id, platform, status, worker_id, submitted_at, assigned_at, started_at, completed_at, source_path, credentials_path, result_path, failure_reason, access_token)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(new_build.id)
        .bind(new_build.platform.clone())
        .bind(new_build.status.clone())
        .bind(new_build.worker_id)
        .bind(new_build.submitted_at)
        .bind(new_build.assigned_at)
        .bind(new_build.started_at)
        .bind(new_build.completed_at)
        .bind(new_build.source_path.clone())
        .bind(new_build.credentials_path.clone())
        .bind(new_build.result_path.clone())
        .bind(new_build.failure_reason.clone())
        .bind(new_build.access_token)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', $2, $3)",
        )
        .bind(original_id)
        .bind(format!("retried as build {}", new_build.id))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'info', $2, $3)",
        )
        .bind(new_build.id)
        .bind(format!("retry of build {original_id}"))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RetryOutcome::Created)
    }

    async fn queue_counts(&self) -> Result<BuildQueueCounts, RepoError> {
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE status = 'pending'")
                .fetch_one(self.db_pool.deref())
                .await?;
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE status IN ('assigned', 'building')",
        )
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(BuildQueueCounts { pending, active })
    }

    async fn audit_counts(&self) -> Result<BuildAuditCounts, RepoError> {
        let pending_with_worker: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE status = 'pending' AND worker_id IS NOT NULL",
        )
        .fetch_one(self.db_pool.deref())
        .await?;
        let in_progress_without_worker: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE status IN ('assigned', 'building') AND worker_id IS NULL",
        )
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(BuildAuditCounts {
            pending_with_worker,
            in_progress_without_worker,
        })
    }
}
