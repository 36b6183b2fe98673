use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildgrid_common::model::{now_utc, BuildId, TokenSecret};
use buildgrid_common::SafeDisplay;
use tracing::info;

use crate::model::GuestTokenResponse;
use crate::repo::token::{OtpExchangeOutcome, TokenRepo};
use crate::repo::RepoError;

#[derive(Debug, thiserror::Error)]
pub enum TokenServiceError {
    #[error("Bootstrap token already used")]
    Consumed,
    #[error("Invalid or expired bootstrap token")]
    Invalid,
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for TokenServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            TokenServiceError::Consumed => self.to_string(),
            TokenServiceError::Invalid => self.to_string(),
            TokenServiceError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

#[async_trait]
pub trait TokenService: Send + Sync {
    /// Exchanges a single-use bootstrap OTP, scoped to the given build, for
    /// a guest token. Consume-and-mint happen in one store commit; a second
    /// presentation of the same OTP fails as consumed.
    async fn exchange_bootstrap_otp(
        &self,
        otp: &TokenSecret,
        build_id: &BuildId,
    ) -> Result<GuestTokenResponse, TokenServiceError>;

    /// Drops expired OTP and guest tokens; invoked by the background sweep.
    async fn sweep_expired(&self) -> Result<u64, TokenServiceError>;
}

pub struct TokenServiceDefault {
    token_repo: Arc<dyn TokenRepo>,
    guest_token_ttl: Duration,
}

impl TokenServiceDefault {
    pub fn new(token_repo: Arc<dyn TokenRepo>, guest_token_ttl: Duration) -> Self {
        Self {
            token_repo,
            guest_token_ttl,
        }
    }
}

#[async_trait]
impl TokenService for TokenServiceDefault {
    async fn exchange_bootstrap_otp(
        &self,
        otp: &TokenSecret,
        build_id: &BuildId,
    ) -> Result<GuestTokenResponse, TokenServiceError> {
        let now = now_utc();
        let guest_secret = TokenSecret::generate();
        let expires_at = now + chrono::Duration::from_std(self.guest_token_ttl).unwrap_or_default();

        match self
            .token_repo
            .exchange_otp(
                otp.as_uuid(),
                &build_id.0,
                guest_secret.as_uuid(),
                expires_at,
                now,
            )
            .await?
        {
            OtpExchangeOutcome::Exchanged(guest) => {
                info!(build_id = %build_id, "bootstrap OTP exchanged for guest token");
                Ok(GuestTokenResponse {
                    guest_token: TokenSecret(guest.secret),
                    expires_at: guest.expires_at,
                })
            }
            OtpExchangeOutcome::AlreadyConsumed => Err(TokenServiceError::Consumed),
            OtpExchangeOutcome::Invalid => Err(TokenServiceError::Invalid),
        }
    }

    async fn sweep_expired(&self) -> Result<u64, TokenServiceError> {
        Ok(self.token_repo.delete_expired(now_utc()).await?)
    }
}
