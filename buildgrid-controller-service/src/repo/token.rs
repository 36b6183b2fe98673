use std::ops::Deref;
use std::result::Result;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Database, Pool};
use uuid::Uuid;

use crate::repo::RepoError;

/// A bootstrap OTP or guest token row. Session tokens live on the worker row
/// and build access tokens on the build row; only the short-lived guest-side
/// classes need their own records.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TokenRecord {
    pub secret: Uuid,
    pub class: String,
    pub build_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub created_at: DateTime<Utc>,
}

pub const TOKEN_CLASS_BOOTSTRAP_OTP: &str = "bootstrap_otp";
pub const TOKEN_CLASS_GUEST: &str = "guest";

#[derive(Debug)]
pub enum OtpExchangeOutcome {
    Exchanged(TokenRecord),
    AlreadyConsumed,
    Invalid,
}

#[async_trait]
pub trait TokenRepo: Send + Sync {
    async fn get(&self, secret: &Uuid) -> Result<Option<TokenRecord>, RepoError>;

    /// Consumes the OTP and mints the guest token in the same transaction.
    /// The consumed flag is flipped by a guarded update, so two concurrent
    /// exchanges of the same OTP cannot both succeed.
    async fn exchange_otp(
        &self,
        otp_secret: &Uuid,
        build_id: &Uuid,
        guest_secret: &Uuid,
        guest_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<OtpExchangeOutcome, RepoError>;

    /// Drops every token past its expiry. Consumed OTPs are kept until they
    /// expire so a replayed exchange still classifies as consumed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RepoError>;
}

pub struct DbTokenRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbTokenRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TokenRepo for DbTokenRepo<sqlx::Postgres> {
    async fn get(&self, secret: &Uuid) -> Result<Option<TokenRecord>, RepoError> {
        sqlx::query_as::<_, TokenRecord>(
            "SELECT secret, class, build_id, worker_id, expires_at, consumed, created_at FROM tokens WHERE secret = $1",
        )
        .bind(secret)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn exchange_otp(
        &self,
        otp_secret: &Uuid,
        build_id: &Uuid,
        guest_secret: &Uuid,
        guest_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<OtpExchangeOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let consumed: Option<(Option<Uuid>,)> = sqlx::query_as(
            r#"
              UPDATE tokens SET consumed = TRUE
              WHERE secret = $1 AND class = 'bootstrap_otp' AND build_id = $2
                AND consumed = FALSE AND expires_at > $3
              RETURNING worker_id
            "#,
        )
        .bind(otp_secret)
        .bind(build_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((worker_id,)) = consumed else {
            // classify the miss without changing anything
            let existing: Option<(bool, DateTime<Utc>, Uuid)> = sqlx::query_as(
                "SELECT consumed, expires_at, build_id FROM tokens WHERE secret = $1 AND class = 'bootstrap_otp'",
            )
            .bind(otp_secret)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Ok(match existing {
                Some((true, _, existing_build)) if existing_build == *build_id => {
                    OtpExchangeOutcome::AlreadyConsumed
                }
                _ => OtpExchangeOutcome::Invalid,
            });
        };

        let guest = TokenRecord {
            secret: *guest_secret,
            class: TOKEN_CLASS_GUEST.to_string(),
            build_id: *build_id,
            worker_id,
            expires_at: guest_expires_at,
            consumed: false,
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO tokens (secret, class, build_id, worker_id, expires_at, consumed, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(guest.secret)
        .bind(guest.class.clone())
        .bind(guest.build_id)
        .bind(guest.worker_id)
        .bind(guest.expires_at)
        .bind(guest.consumed)
        .bind(guest.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(OtpExchangeOutcome::Exchanged(guest))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TokenRepo for DbTokenRepo<sqlx::Sqlite> {
    async fn get(&self, secret: &Uuid) -> Result<Option<TokenRecord>, RepoError> {
        sqlx::query_as::<_, TokenRecord>(
            "SELECT secret, class, build_id, worker_id, expires_at, consumed, created_at FROM tokens WHERE secret = $1",
        )
        .bind(secret)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn exchange_otp(
        &self,
        otp_secret: &Uuid,
        build_id: &Uuid,
        guest_secret: &Uuid,
        guest_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<OtpExchangeOutcome, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let consumed: Option<(Option<Uuid>,)> = sqlx::query_as(
            r#"
              UPDATE tokens SET consumed = TRUE
              WHERE secret = $1 AND class = 'bootstrap_otp' AND build_id = $2
                AND consumed = FALSE AND expires_at > $3
              RETURNING worker_id
            "#,
        )
        .bind(otp_secret)
        .bind(build_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((worker_id,)) = consumed else {
            let existing: Option<(bool, DateTime<Utc>, Uuid)> = sqlx::query_as(
                "SELECT consumed, expires_at, build_id FROM tokens WHERE secret = $1 AND class = 'bootstrap_otp'",
            )
            .bind(otp_secret)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;
            return Ok(match existing {
                Some((true, _, existing_build)) if existing_build == *build_id => {
                    OtpExchangeOutcome::AlreadyConsumed
                }
                _ => OtpExchangeOutcome::Invalid,
            });
        };

        let guest = TokenRecord {
            secret: *guest_secret,
            class: TOKEN_CLASS_GUEST.to_string(),
            build_id: *build_id,
            worker_id,
            expires_at: guest_expires_at,
            consumed: false,
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO tokens (secret, class, build_id, worker_id, expires_at, consumed, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(guest.secret)
        .bind(guest.class.clone())
        .bind(guest.build_id)
        .bind(guest.worker_id)
        .bind(guest.expires_at)
        .bind(guest.consumed)
        .bind(guest.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(OtpExchangeOutcome::Exchanged(guest))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected())
    }
}
