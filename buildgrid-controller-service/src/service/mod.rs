use std::sync::Arc;

use buildgrid_common::config::DbConfig;

use crate::config::ControllerServiceConfig;
use crate::db;
use crate::repo;
use crate::storage::ArtifactStore;

pub mod auth;
pub mod build;
pub mod queue;
pub mod sweep;
pub mod token;
pub mod worker;

use self::auth::{AuthService, AuthServiceDefault};
use self::build::{BuildService, BuildServiceDefault};
use self::queue::{QueueService, QueueServiceDefault};
use self::sweep::Sweeps;
use self::token::{TokenService, TokenServiceDefault};
use self::worker::{WorkerService, WorkerServiceDefault};

#[derive(Clone)]
pub struct Services {
    pub auth_service: Arc<dyn AuthService>,
    pub token_service: Arc<dyn TokenService>,
    pub build_service: Arc<dyn BuildService>,
    pub queue_service: Arc<dyn QueueService>,
    pub worker_service: Arc<dyn WorkerService>,
    pub artifact_store: Arc<ArtifactStore>,
    pub sweeps: Arc<Sweeps>,
}

impl Services {
    pub async fn new(config: &ControllerServiceConfig) -> Result<Services, String> {
        match config.db.clone() {
            DbConfig::Postgres(db_config) => {
                let db_pool = Arc::new(
                    db::create_postgres_pool(&db_config)
                        .await
                        .map_err(|e| e.to_string())?,
                );

                let build_repo: Arc<dyn repo::build::BuildRepo> =
                    Arc::new(repo::build::DbBuildRepo::new(db_pool.clone()));
                let worker_repo: Arc<dyn repo::worker::WorkerRepo> =
                    Arc::new(repo::worker::DbWorkerRepo::new(db_pool.clone()));
                let token_repo: Arc<dyn repo::token::TokenRepo> =
                    Arc::new(repo::token::DbTokenRepo::new(db_pool.clone()));
                let build_log_repo: Arc<dyn repo::build_log::BuildLogRepo> =
                    Arc::new(repo::build_log::DbBuildLogRepo::new(db_pool.clone()));

                Self::make(config, build_repo, worker_repo, token_repo, build_log_repo).await
            }
            DbConfig::Sqlite(db_config) => {
                let db_pool = Arc::new(
                    db::create_sqlite_pool(&db_config)
                        .await
                        .map_err(|e| e.to_string())?,
                );

                let build_repo: Arc<dyn repo::build::BuildRepo> =
                    Arc::new(repo::build::DbBuildRepo::new(db_pool.clone()));
                let worker_repo: Arc<dyn repo::worker::WorkerRepo> =
                    Arc::new(repo::worker::DbWorkerRepo::new(db_pool.clone()));
                let token_repo: Arc<dyn repo::token::TokenRepo> =
                    Arc::new(repo::token::DbTokenRepo::new(db_pool.clone()));
                let build_log_repo: Arc<dyn repo::build_log::BuildLogRepo> =
                    Arc::new(repo::build_log::DbBuildLogRepo::new(db_pool.clone()));

                Self::make(config, build_repo, worker_repo, token_repo, build_log_repo).await
            }
        }
    }

    async fn make(
        config: &ControllerServiceConfig,
        build_repo: Arc<dyn repo::build::BuildRepo>,
        worker_repo: Arc<dyn repo::worker::WorkerRepo>,
        token_repo: Arc<dyn repo::token::TokenRepo>,
        build_log_repo: Arc<dyn repo::build_log::BuildLogRepo>,
    ) -> Result<Services, String> {
        let artifact_store = Arc::new(
            ArtifactStore::new(&config.storage)
                .await
                .map_err(|e| e.to_string())?,
        );

        let auth_service: Arc<dyn AuthService> = Arc::new(AuthServiceDefault::new(
            config.auth.admin_key.clone(),
            build_repo.clone(),
            worker_repo.clone(),
            token_repo.clone(),
        ));

        let token_service: Arc<dyn TokenService> = Arc::new(TokenServiceDefault::new(
            token_repo.clone(),
            config.auth.guest_token_ttl,
        ));

        let build_service: Arc<dyn BuildService> = Arc::new(BuildServiceDefault::new(
            build_repo.clone(),
            build_log_repo.clone(),
            artifact_store.clone(),
        ));

        let queue_service: Arc<dyn QueueService> = Arc::new(QueueServiceDefault::new(
            build_repo.clone(),
            config.auth.otp_ttl,
        ));

        let worker_service: Arc<dyn WorkerService> = Arc::new(WorkerServiceDefault::new(
            worker_repo.clone(),
            config.auth.session_token_ttl,
        ));

        let sweeps = Arc::new(Sweeps::new(
            worker_repo.clone(),
            token_service.clone(),
            artifact_store.clone(),
            config.sweep.clone(),
        ));

        Ok(Services {
            auth_service,
            token_service,
            build_service,
            queue_service,
            worker_service,
            artifact_store,
            sweeps,
        })
    }
}
