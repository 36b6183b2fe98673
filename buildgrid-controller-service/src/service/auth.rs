use std::sync::Arc;

use async_trait::async_trait;
use buildgrid_common::model::{now_utc, BuildId, TokenSecret};
use buildgrid_common::SafeDisplay;
use sha2::{Digest, Sha256};

use crate::model::{SubmitterAuth, Worker};
use crate::repo::build::BuildRepo;
use crate::repo::token::{TokenRepo, TOKEN_CLASS_GUEST};
use crate::repo::worker::WorkerRepo;
use crate::repo::RepoError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid or missing credential")]
    Unauthenticated,
    #[error("Session token expired")]
    TokenExpired,
    #[error("Credential does not grant access to this resource")]
    Forbidden,
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for AuthError {
    fn to_safe_string(&self) -> String {
        match self {
            AuthError::Unauthenticated => self.to_string(),
            AuthError::TokenExpired => self.to_string(),
            AuthError::Forbidden => self.to_string(),
            AuthError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

/// Length-equalized comparison: both sides are hashed first, so neither
/// length nor prefix structure is observable through timing.
pub fn secret_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    Sha256::digest(lhs) == Sha256::digest(rhs)
}

/// Validates each token class against its own scope. Cross-class
/// presentation never succeeds because every entry point checks exactly one
/// class.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn authorize_admin(&self, presented: &str) -> Result<(), AuthError>;

    /// Admin key, or the build token bound to exactly this build.
    async fn authorize_build_access(
        &self,
        auth: &SubmitterAuth,
        build_id: &BuildId,
    ) -> Result<(), AuthError>;

    /// Resolves the worker behind a session token; expired sessions are
    /// rejected so the worker re-registers.
    async fn authorize_worker_session(&self, presented: &TokenSecret)
        -> Result<Worker, AuthError>;

    /// Guest token bound to exactly this build.
    async fn authorize_guest(
        &self,
        presented: &TokenSecret,
        build_id: &BuildId,
    ) -> Result<(), AuthError>;
}

pub struct AuthServiceDefault {
    admin_key: String,
    build_repo: Arc<dyn BuildRepo>,
    worker_repo: Arc<dyn WorkerRepo>,
    token_repo: Arc<dyn TokenRepo>,
}

impl AuthServiceDefault {
    pub fn new(
        admin_key: String,
        build_repo: Arc<dyn BuildRepo>,
        worker_repo: Arc<dyn WorkerRepo>,
        token_repo: Arc<dyn TokenRepo>,
    ) -> Self {
        Self {
            admin_key,
            build_repo,
            worker_repo,
            token_repo,
        }
    }

    /// Whether the secret is a live credential of some other token class:
    /// an unexpired worker session token or a build access token.
    async fn is_known_foreign_secret(
        &self,
        presented: &TokenSecret,
    ) -> Result<bool, RepoError> {
        if let Some(worker) = self
            .worker_repo
            .get_by_session_token(presented.as_uuid())
            .await?
        {
            return Ok(worker.session_expires_at > now_utc());
        }
        Ok(self
            .build_repo
            .get_by_access_token(presented.as_uuid())
            .await?
            .is_some())
    }
}

#[async_trait]
impl AuthService for AuthServiceDefault {
    async fn authorize_admin(&self, presented: &str) -> Result<(), AuthError> {
        if secret_eq(presented.as_bytes(), self.admin_key.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::Unauthenticated)
        }
    }

    async fn authorize_build_access(
        &self,
        auth: &SubmitterAuth,
        build_id: &BuildId,
    ) -> Result<(), AuthError> {
        match auth {
            SubmitterAuth::AdminKey(presented) => self.authorize_admin(presented).await,
            SubmitterAuth::BuildToken(presented) => {
                let build = self
                    .build_repo
                    .get(&build_id.0)
                    .await?
                    .ok_or(AuthError::Forbidden)?;
                if secret_eq(
                    presented.as_uuid().as_bytes(),
                    build.access_token.as_bytes(),
                ) {
                    Ok(())
                } else {
                    Err(AuthError::Forbidden)
                }
            }
        }
    }

    async fn authorize_worker_session(
        &self,
        presented: &TokenSecret,
    ) -> Result<Worker, AuthError> {
        let record = match self
            .worker_repo
            .get_by_session_token(presented.as_uuid())
            .await?
        {
            Some(record) => record,
            None => {
                // a token rotated away by a completed poll must classify as
                // expired so the worker re-registers instead of retrying
                return if self
                    .worker_repo
                    .get_by_previous_session_token(presented.as_uuid())
                    .await?
                    .is_some()
                {
                    Err(AuthError::TokenExpired)
                } else {
                    Err(AuthError::Unauthenticated)
                };
            }
        };
        if record.session_expires_at <= now_utc() {
            return Err(AuthError::TokenExpired);
        }
        Worker::try_from(record).map_err(|_| AuthError::Unauthenticated)
    }

    async fn authorize_guest(
        &self,
        presented: &TokenSecret,
        build_id: &BuildId,
    ) -> Result<(), AuthError> {
        let token = match self.token_repo.get(presented.as_uuid()).await? {
            Some(token) => token,
            None => {
                // a valid credential of another class is a class error, not
                // a missing credential
                return if self.is_known_foreign_secret(presented).await? {
                    Err(AuthError::Forbidden)
                } else {
                    Err(AuthError::Unauthenticated)
                };
            }
        };
        if token.expires_at <= now_utc() {
            return Err(AuthError::Unauthenticated);
        }
        if token.class != TOKEN_CLASS_GUEST {
            return Err(AuthError::Forbidden);
        }
        if token.build_id != build_id.0 {
            return Err(AuthError::Forbidden);
        }
        Ok(())
    }
}
