use std::ops::Deref;
use std::result::Result;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use buildgrid_common::model::{TokenSecret, WorkerCapabilities, WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use uuid::Uuid;

use crate::model::Worker;
use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub name: String,
    pub capabilities: String,
    pub status: String,
    pub session_token: Uuid,
    pub previous_session_token: Option<Uuid>,
    pub session_expires_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub completed_builds: i64,
    pub failed_builds: i64,
    pub created_at: DateTime<Utc>,
    pub shutdown_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkerRecord> for Worker {
    type Error = String;

    fn try_from(value: WorkerRecord) -> Result<Self, Self::Error> {
        let capabilities: WorkerCapabilities = serde_json::from_str(&value.capabilities)
            .map_err(|e| format!("Invalid worker capabilities: {e}"))?;
        Ok(Self {
            id: WorkerId(value.id),
            name: value.name,
            capabilities,
            status: WorkerStatus::from_str(&value.status)?,
            session_token: TokenSecret(value.session_token),
            session_expires_at: value.session_expires_at,
            last_seen: value.last_seen,
            completed_builds: value.completed_builds as u64,
            failed_builds: value.failed_builds as u64,
            created_at: value.created_at,
            shutdown_at: value.shutdown_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStatusCounts {
    pub idle: i64,
    pub building: i64,
    pub offline: i64,
}

#[async_trait]
pub trait WorkerRepo: Send + Sync {
    async fn create(&self, worker: &WorkerRecord) -> Result<(), RepoError>;

    async fn get(&self, worker_id: &Uuid) -> Result<Option<WorkerRecord>, RepoError>;

    async fn get_by_session_token(
        &self,
        session_token: &Uuid,
    ) -> Result<Option<WorkerRecord>, RepoError>;

    /// Finds the worker whose last completed rotation replaced this token.
    /// Used only to classify a replayed old token as expired; it never
    /// authenticates.
    async fn get_by_previous_session_token(
        &self,
        session_token: &Uuid,
    ) -> Result<Option<WorkerRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<WorkerRecord>, RepoError>;

    /// Rotates the session token and bumps last_seen in one commit, guarded
    /// by the presented token. Returns false when the guard missed, meaning
    /// the presented token was already rotated away.
    async fn rotate_session(
        &self,
        worker_id: &Uuid,
        presented: &Uuid,
        new_token: &Uuid,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// Workers whose last_seen is older than the cutoff and that are not
    /// already Offline.
    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerRecord>, RepoError>;

    /// Marks the worker Offline and returns each of its in-progress builds
    /// to Pending, with a "reassigned" log entry per build and all of the
    /// worker's outstanding tokens revoked. One transaction per worker.
    async fn mark_offline_and_release(
        &self,
        worker_id: &Uuid,
        shutdown_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, RepoError>;

    async fn status_counts(&self) -> Result<WorkerStatusCounts, RepoError>;
}

pub struct DbWorkerRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbWorkerRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl WorkerRepo for DbWorkerRepo<sqlx::Postgres> {
    async fn create(&self, worker: &WorkerRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO workers
                (id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(worker.id)
        .bind(worker.name.clone())
        .bind(worker.capabilities.clone())
        .bind(worker.status.clone())
        .bind(worker.session_token)
        .bind(worker.previous_session_token)
        .bind(worker.session_expires_at)
        .bind(worker.last_seen)
        .bind(worker.completed_builds)
        .bind(worker.failed_builds)
        .bind(worker.created_at)
        .bind(worker.shutdown_at)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn get(&self, worker_id: &Uuid) -> Result<Option<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers WHERE id = $1",
        )
        .bind(worker_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_by_session_token(
        &self,
        session_token: &Uuid,
    ) -> Result<Option<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers WHERE session_token = $1",
        )
        .bind(session_token)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_by_previous_session_token(
        &self,
        session_token: &Uuid,
    ) -> Result<Option<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers WHERE previous_session_token = $1",
        )
        .bind(session_token)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers ORDER BY created_at, id",
        )
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn rotate_session(
        &self,
        worker_id: &Uuid,
        presented: &Uuid,
        new_token: &Uuid,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE workers SET session_token = $3, previous_session_token = $2, session_expires_at = $4, last_seen = $5 WHERE id = $1 AND session_token = $2",
        )
        .bind(worker_id)
        .bind(presented)
        .bind(new_token)
        .bind(new_expires_at)
        .bind(now)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers WHERE status != 'offline' AND last_seen < $1",
        )
        .bind(cutoff)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn mark_offline_and_release(
        &self,
        worker_id: &Uuid,
        shutdown_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            "UPDATE workers SET status = 'offline', shutdown_at = COALESCE($2, shutdown_at) WHERE id = $1",
        )
        .bind(worker_id)
        .bind(shutdown_at)
        .execute(&mut *tx)
        .await?;

        let released: Vec<(Uuid,)> = sqlx::query_as(
            r#"
              UPDATE builds
              SET status = 'pending', worker_id = NULL, assigned_at = NULL, started_at = NULL
              WHERE worker_id = $1 AND status IN ('assigned', 'building')
              RETURNING id
            "#,
        )
        .bind(worker_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tokens WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        for (build_id,) in &released {
            sqlx::query(
                "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'warn', $2, $3)",
            )
            .bind(build_id)
            .bind(format!("reassigned: worker {worker_id} went offline"))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(released.into_iter().map(|(id,)| id).collect())
    }

    async fn status_counts(&self) -> Result<WorkerStatusCounts, RepoError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM workers GROUP BY status")
                .fetch_all(self.db_pool.deref())
                .await?;
        let mut counts = WorkerStatusCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "idle" => counts.idle = count,
                "building" => counts.building = count,
                "offline" => counts.offline = count,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl WorkerRepo for DbWorkerRepo<sqlx::Sqlite> {
    async fn create(&self, worker: &WorkerRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO workers
                (id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(worker.id)
        .bind(worker.name.clone())
        .bind(worker.capabilities.clone())
        .bind(worker.status.clone())
        .bind(worker.session_token)
        .bind(worker.previous_session_token)
        .bind(worker.session_expires_at)
        .bind(worker.last_seen)
        .bind(worker.completed_builds)
        .bind(worker.failed_builds)
        .bind(worker.created_at)
        .bind(worker.shutdown_at)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn get(&self, worker_id: &Uuid) -> Result<Option<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers WHERE id = $1",
        )
        .bind(worker_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_by_session_token(
        &self,
        session_token: &Uuid,
    ) -> Result<Option<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers WHERE session_token = $1",
        )
        .bind(session_token)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn get_by_previous_session_token(
        &self,
        session_token: &Uuid,
    ) -> Result<Option<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers WHERE previous_session_token = $1",
        )
        .bind(session_token)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers ORDER BY created_at, id",
        )
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn rotate_session(
        &self,
        worker_id: &Uuid,
        presented: &Uuid,
        new_token: &Uuid,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE workers SET session_token = $3, previous_session_token = $2, session_expires_at = $4, last_seen = $5 WHERE id = $1 AND session_token = $2",
        )
        .bind(worker_id)
        .bind(presented)
        .bind(new_token)
        .bind(new_expires_at)
        .bind(now)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT id, name, capabilities, status, session_token, previous_session_token, session_expires_at, last_seen, completed_builds, failed_builds, created_at, shutdown_at FROM workers WHERE status != 'offline' AND last_seen < $1",
        )
        .bind(cutoff)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn mark_offline_and_release(
        &self,
        worker_id: &Uuid,
        shutdown_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            "UPDATE workers SET status = 'offline', shutdown_at = COALESCE($2, shutdown_at) WHERE id = $1",
        )
        .bind(worker_id)
        .bind(shutdown_at)
        .execute(&mut *tx)
        .await?;

        let released: Vec<(Uuid,)> = sqlx::query_as(
            r#"
              UPDATE builds
              SET status = 'pending', worker_id = NULL, assigned_at = NULL, started_at = NULL
              WHERE worker_id = $1 AND status IN ('assigned', 'building')
              RETURNING id
            "#,
        )
        .bind(worker_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tokens WHERE worker_id = $1")
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        for (build_id,) in &released {
            sqlx::query(
                "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, 'warn', $2, $3)",
            )
            .bind(build_id)
            .bind(format!("reassigned: worker {worker_id} went offline"))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(released.into_iter().map(|(id,)| id).collect())
    }

    async fn status_counts(&self) -> Result<WorkerStatusCounts, RepoError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM workers GROUP BY status")
                .fetch_all(self.db_pool.deref())
                .await?;
        let mut counts = WorkerStatusCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "idle" => counts.idle = count,
                "building" => counts.building = count,
                "offline" => counts.offline = count,
                _ => {}
            }
        }
        Ok(counts)
    }
}
