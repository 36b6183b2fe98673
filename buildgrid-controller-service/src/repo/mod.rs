use buildgrid_common::SafeDisplay;

pub mod build;
pub mod build_log;
pub mod token;
pub mod worker;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Internal(#[from] sqlx::Error),
}

impl RepoError {
    /// Transient store conditions the caller should retry with backoff,
    /// surfaced externally as 503.
    pub fn is_unavailable(&self) -> bool {
        match self {
            RepoError::Internal(error) => matches!(
                error,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
        }
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        match self {
            RepoError::Internal(_) => {
                if self.is_unavailable() {
                    "Store temporarily unavailable".to_string()
                } else {
                    "Internal repository error".to_string()
                }
            }
        }
    }
}
