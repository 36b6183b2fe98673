use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use buildgrid_common::model::{now_utc, BuildId, BuildStatus, LogSeverity, Platform, TokenSecret};
use buildgrid_common::SafeDisplay;
use tokio::fs::File;
use tokio::io::AsyncRead;
use tracing::{error, info};

use crate::metrics;
use crate::model::{Build, BuildCreatedResponse, BuildLogEntry, SecureCredentialsResponse, Worker};
use crate::repo::build::{
    BuildRecord, BuildRepo, CancelOutcome, OutcomeOutcome, RetryOutcome,
};
use crate::repo::build_log::BuildLogRepo;
use crate::repo::RepoError;
use crate::storage::{ArtifactKind, ArtifactStore, StorageError};

/// Request bodies are handed down as boxed readers so the service can stream
/// them into the artifact store without buffering whole payloads.
pub type ArtifactStream = Pin<Box<dyn AsyncRead + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum BuildServiceError {
    #[error("Build not found: {0}")]
    NotFound(BuildId),
    #[error("Illegal transition for build {build_id}: status is {current}")]
    IllegalTransition { build_id: BuildId, current: String },
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SafeDisplay for BuildServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            BuildServiceError::NotFound(_) => self.to_string(),
            BuildServiceError::IllegalTransition { .. } => self.to_string(),
            BuildServiceError::Forbidden(_) => self.to_string(),
            BuildServiceError::Validation(_) => self.to_string(),
            BuildServiceError::Storage(inner) => inner.to_safe_string(),
            BuildServiceError::InternalRepoError(inner) => inner.to_safe_string(),
            BuildServiceError::Internal(_) => "Internal error".to_string(),
        }
    }
}

/// Owns the build lifecycle outside of the Pending -> Assigned edge, which
/// belongs to the queue service.
#[async_trait]
pub trait BuildService: Send + Sync {
    async fn submit(
        &self,
        platform: Platform,
        source: ArtifactStream,
        credentials: Option<ArtifactStream>,
    ) -> Result<BuildCreatedResponse, BuildServiceError>;

    async fn status(&self, build_id: &BuildId) -> Result<Build, BuildServiceError>;

    async fn logs(
        &self,
        build_id: &BuildId,
        limit: i64,
    ) -> Result<Vec<BuildLogEntry>, BuildServiceError>;

    async fn list_active(&self) -> Result<Vec<Build>, BuildServiceError>;

    async fn list_recent(&self, limit: i64) -> Result<Vec<Build>, BuildServiceError>;

    async fn cancel(&self, build_id: &BuildId) -> Result<Build, BuildServiceError>;

    /// Retry-as-new-build: the failed original stays terminal; its source and
    /// credential bytes are hardlinked (or copied) under a fresh build id
    /// with a fresh build token.
    async fn retry(&self, build_id: &BuildId) -> Result<BuildCreatedResponse, BuildServiceError>;

    /// Implicit Assigned -> Building edge, fired by the guest's first
    /// artifact channel call.
    async fn mark_building(&self, build_id: &BuildId) -> Result<(), BuildServiceError>;

    async fn open_source(&self, build_id: &BuildId) -> Result<(File, u64), BuildServiceError>;

    async fn open_result(&self, build_id: &BuildId) -> Result<(File, u64), BuildServiceError>;

    async fn secure_credentials(
        &self,
        build_id: &BuildId,
    ) -> Result<SecureCredentialsResponse, BuildServiceError>;

    /// Worker-reported terminal outcome. The result bytes are fully staged
    /// before the state transition commits, and only renamed into place
    /// afterwards, so a rejected duplicate can never clobber the first
    /// result.
    async fn report_outcome(
        &self,
        worker: &Worker,
        build_id: &BuildId,
        success: bool,
        failure: Option<String>,
        artifact: Option<ArtifactStream>,
    ) -> Result<Build, BuildServiceError>;
}

pub struct BuildServiceDefault {
    build_repo: Arc<dyn BuildRepo>,
    build_log_repo: Arc<dyn BuildLogRepo>,
    artifact_store: Arc<ArtifactStore>,
}

impl BuildServiceDefault {
    pub fn new(
        build_repo: Arc<dyn BuildRepo>,
        build_log_repo: Arc<dyn BuildLogRepo>,
        artifact_store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            build_repo,
            build_log_repo,
            artifact_store,
        }
    }

    async fn get_build(&self, build_id: &BuildId) -> Result<Build, BuildServiceError> {
        let record = self
            .build_repo
            .get(&build_id.0)
            .await?
            .ok_or(BuildServiceError::NotFound(*build_id))?;
        Build::try_from(record).map_err(BuildServiceError::Internal)
    }
}

#[async_trait]
impl BuildService for BuildServiceDefault {
    async fn submit(
        &self,
        platform: Platform,
        mut source: ArtifactStream,
        credentials: Option<ArtifactStream>,
    ) -> Result<BuildCreatedResponse, BuildServiceError> {
        let build_id = BuildId::new_v4();
        let access_token = TokenSecret::generate();
        let now = now_utc();

        let source_stored = self
            .artifact_store
            .ingest(&build_id, ArtifactKind::Source, &mut source)
            .await?;

        let credentials_stored = match credentials {
            Some(mut reader) => Some(
                self.artifact_store
                    .ingest(&build_id, ArtifactKind::Credentials, &mut reader)
                    .await?,
            ),
            None => None,
        };

        let record = BuildRecord {
            id: build_id.0,
            platform: platform.as_db_str().to_string(),
            status: BuildStatus::Pending.as_db_str().to_string(),
            worker_id: None,
            submitted_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            source_path: source_stored.relative_path,
            credentials_path: credentials_stored.map(|c| c.relative_path),
            result_path: None,
            failure_reason: None,
            access_token: access_token.0,
        };

        self.build_repo.create(&record, "submitted").await?;
        metrics::record_build_submitted();
        info!(build_id = %build_id, platform = %platform, "build submitted");

        Ok(BuildCreatedResponse {
            id: build_id,
            status: BuildStatus::Pending,
            build_token: access_token,
        })
    }

    async fn status(&self, build_id: &BuildId) -> Result<Build, BuildServiceError> {
        self.get_build(build_id).await
    }

    async fn logs(
        &self,
        build_id: &BuildId,
        limit: i64,
    ) -> Result<Vec<BuildLogEntry>, BuildServiceError> {
        // a missing build yields NotFound rather than an empty log
        let _ = self.get_build(build_id).await?;
        let records = self.build_log_repo.query(&build_id.0, limit).await?;
        records
            .into_iter()
            .map(|record| BuildLogEntry::try_from(record).map_err(BuildServiceError::Internal))
            .collect()
    }

    async fn list_active(&self) -> Result<Vec<Build>, BuildServiceError> {
        let records = self.build_repo.list_active().await?;
        records
            .into_iter()
            .map(|record| Build::try_from(record).map_err(BuildServiceError::Internal))
            .collect()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Build>, BuildServiceError> {
        let records = self.build_repo.list_recent(limit).await?;
        records
            .into_iter()
            .map(|record| Build::try_from(record).map_err(BuildServiceError::Internal))
            .collect()
    }

    async fn cancel(&self, build_id: &BuildId) -> Result<Build, BuildServiceError> {
        match self.build_repo.cancel(&build_id.0, now_utc()).await? {
            CancelOutcome::Cancelled(record) => {
                info!(build_id = %build_id, "build cancelled");
                Build::try_from(record).map_err(BuildServiceError::Internal)
            }
            CancelOutcome::NotFound => Err(BuildServiceError::NotFound(*build_id)),
            CancelOutcome::InvalidStatus(current) => Err(BuildServiceError::IllegalTransition {
                build_id: *build_id,
                current,
            }),
        }
    }

    async fn retry(&self, build_id: &BuildId) -> Result<BuildCreatedResponse, BuildServiceError> {
        let original = self.get_build(build_id).await?;
        if original.status != BuildStatus::Failed {
            return Err(BuildServiceError::IllegalTransition {
                build_id: *build_id,
                current: original.status.as_db_str().to_string(),
            });
        }

        let new_id = BuildId::new_v4();
        let access_token = TokenSecret::generate();
        let now = now_utc();

        let source_path = ArtifactStore::relative_path(&new_id, ArtifactKind::Source);
        self.artifact_store
            .link_or_copy(&original.source_path, &source_path)
            .await?;

        let credentials_path = match &original.credentials_path {
            Some(original_path) => {
                let new_path = ArtifactStore::relative_path(&new_id, ArtifactKind::Credentials);
                self.artifact_store
                    .link_or_copy(original_path, &new_path)
                    .await?;
                Some(new_path)
            }
            None => None,
        };

        let record = BuildRecord {
            id: new_id.0,
            platform: original.platform.as_db_str().to_string(),
            status: BuildStatus::Pending.as_db_str().to_string(),
            worker_id: None,
            submitted_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            source_path,
            credentials_path,
            result_path: None,
            failure_reason: None,
            access_token: access_token.0,
        };

        match self
            .build_repo
            .create_retry(&build_id.0, &record, now)
            .await?
        {
            RetryOutcome::Created => {
                info!(original = %build_id, retry = %new_id, "build retried");
                Ok(BuildCreatedResponse {
                    id: new_id,
                    status: BuildStatus::Pending,
                    build_token: access_token,
                })
            }
            RetryOutcome::NotFound => Err(BuildServiceError::NotFound(*build_id)),
            RetryOutcome::InvalidStatus(current) => Err(BuildServiceError::IllegalTransition {
                build_id: *build_id,
                current,
            }),
        }
    }

    async fn mark_building(&self, build_id: &BuildId) -> Result<(), BuildServiceError> {
        let now = now_utc();
        if self.build_repo.mark_building(&build_id.0, now).await? {
            self.build_log_repo
                .append(&build_id.0, LogSeverity::Info, "build started", now)
                .await?;
        }
        Ok(())
    }

    async fn open_source(&self, build_id: &BuildId) -> Result<(File, u64), BuildServiceError> {
        let build = self.get_build(build_id).await?;
        Ok(self.artifact_store.open_stream(&build.source_path).await?)
    }

    async fn open_result(&self, build_id: &BuildId) -> Result<(File, u64), BuildServiceError> {
        let build = self.get_build(build_id).await?;
        let result_path = build
            .result_path
            .ok_or_else(|| BuildServiceError::Validation("build has no result".to_string()))?;
        Ok(self.artifact_store.open_stream(&result_path).await?)
    }

    async fn secure_credentials(
        &self,
        build_id: &BuildId,
    ) -> Result<SecureCredentialsResponse, BuildServiceError> {
        let build = self.get_build(build_id).await?;
        let credentials_path = build.credentials_path.ok_or_else(|| {
            BuildServiceError::Validation("build has no credential bundle".to_string())
        })?;
        let credentials = self
            .artifact_store
            .read_secure_credentials(&credentials_path)
            .await?;
        Ok(SecureCredentialsResponse {
            key: BASE64.encode(&credentials.key),
            password: credentials.password,
            profiles: credentials
                .profiles
                .iter()
                .map(|profile| BASE64.encode(profile))
                .collect(),
        })
    }

    async fn report_outcome(
        &self,
        worker: &Worker,
        build_id: &BuildId,
        success: bool,
        failure: Option<String>,
        artifact: Option<ArtifactStream>,
    ) -> Result<Build, BuildServiceError> {
        if success && artifact.is_none() {
            return Err(BuildServiceError::Validation(
                "a successful outcome requires a result artifact".to_string(),
            ));
        }
        if !success && failure.is_none() {
            return Err(BuildServiceError::Validation(
                "a failed outcome requires a failure message".to_string(),
            ));
        }

        let staged = match artifact {
            Some(mut reader) => Some(
                self.artifact_store
                    .stage(ArtifactKind::Result, &mut reader)
                    .await?,
            ),
            None => None,
        };

        let result_path = staged
            .as_ref()
            .map(|_| ArtifactStore::relative_path(build_id, ArtifactKind::Result));

        let outcome = self
            .build_repo
            .record_outcome(
                &build_id.0,
                &worker.id.0,
                success,
                result_path,
                failure,
                now_utc(),
            )
            .await;

        match outcome {
            Ok(OutcomeOutcome::Applied(record)) => {
                if let Some(staged) = staged {
                    self.artifact_store.commit(staged, build_id).await?;
                }
                if success {
                    metrics::record_build_completed();
                } else {
                    metrics::record_build_failed();
                }
                info!(build_id = %build_id, worker_id = %worker.id, success, "build outcome recorded");
                Build::try_from(record).map_err(BuildServiceError::Internal)
            }
            Ok(OutcomeOutcome::NotFound) => {
                if let Some(staged) = staged {
                    self.artifact_store.discard(staged).await;
                }
                Err(BuildServiceError::NotFound(*build_id))
            }
            Ok(OutcomeOutcome::WrongWorker) => {
                if let Some(staged) = staged {
                    self.artifact_store.discard(staged).await;
                }
                error!(build_id = %build_id, worker_id = %worker.id, "outcome reported by non-owning worker");
                Err(BuildServiceError::Forbidden(
                    "build is not assigned to this worker".to_string(),
                ))
            }
            Ok(OutcomeOutcome::InvalidStatus(current)) => {
                if let Some(staged) = staged {
                    self.artifact_store.discard(staged).await;
                }
                Err(BuildServiceError::IllegalTransition {
                    build_id: *build_id,
                    current,
                })
            }
            Err(err) => {
                if let Some(staged) = staged {
                    self.artifact_store.discard(staged).await;
                }
                Err(err.into())
            }
        }
    }
}
