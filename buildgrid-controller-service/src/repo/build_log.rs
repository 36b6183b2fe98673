use std::ops::Deref;
use std::result::Result;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use buildgrid_common::model::{BuildId, LogSeverity};
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use uuid::Uuid;

use crate::model::BuildLogEntry;
use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BuildLogRecord {
    pub id: i64,
    pub build_id: Uuid,
    pub severity: String,
    pub message: String,
    pub inserted_at: DateTime<Utc>,
}

impl TryFrom<BuildLogRecord> for BuildLogEntry {
    type Error = String;

    fn try_from(value: BuildLogRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            build_id: BuildId(value.build_id),
            severity: LogSeverity::from_str(&value.severity)?,
            message: value.message,
            inserted_at: value.inserted_at,
        })
    }
}

#[async_trait]
pub trait BuildLogRepo: Send + Sync {
    async fn append(
        &self,
        build_id: &Uuid,
        severity: LogSeverity,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError>;

    /// Entries in insertion order, capped at `limit`.
    async fn query(&self, build_id: &Uuid, limit: i64) -> Result<Vec<BuildLogRecord>, RepoError>;
}

pub struct DbBuildLogRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbBuildLogRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl BuildLogRepo for DbBuildLogRepo<sqlx::Postgres> {
    async fn append(
        &self,
        build_id: &Uuid,
        severity: LogSeverity,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(build_id)
        .bind(severity.as_db_str())
        .bind(message)
        .bind(now)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn query(&self, build_id: &Uuid, limit: i64) -> Result<Vec<BuildLogRecord>, RepoError> {
        sqlx::query_as::<_, BuildLogRecord>(
            "SELECT id, build_id, severity, message, inserted_at FROM build_logs WHERE build_id = $1 ORDER BY id LIMIT $2",
        )
        .bind(build_id)
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }
}

#[async_trait]
impl BuildLogRepo for DbBuildLogRepo<sqlx::Sqlite> {
    async fn append(
        &self,
        build_id: &Uuid,
        severity: LogSeverity,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO build_logs (build_id, severity, message, inserted_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(build_id)
        .bind(severity.as_db_str())
        .bind(message)
        .bind(now)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn query(&self, build_id: &Uuid, limit: i64) -> Result<Vec<BuildLogRecord>, RepoError> {
        sqlx::query_as::<_, BuildLogRecord>(
            "SELECT id, build_id, severity, message, inserted_at FROM build_logs WHERE build_id = $1 ORDER BY id LIMIT $2",
        )
        .bind(build_id)
        .bind(limit)
        .fetch_all(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }
}
