use std::sync::Arc;

use poem_openapi::payload::Json;
use poem_openapi::OpenApi;

use crate::api::{ApiResult, ApiTags};
use crate::model::{HealthcheckResponse, VersionInfo};
use crate::service::queue::QueueService;
use crate::service::worker::WorkerService;
use crate::service::Services;
use crate::VERSION;

pub struct HealthcheckApi {
    queue_service: Arc<dyn QueueService>,
    worker_service: Arc<dyn WorkerService>,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::HealthCheck)]
impl HealthcheckApi {
    pub fn new(services: &Services) -> Self {
        Self {
            queue_service: services.queue_service.clone(),
            worker_service: services.worker_service.clone(),
        }
    }

    /// Controller health and queue depth
    #[oai(path = "/health", method = "get", operation_id = "healthcheck")]
    async fn healthcheck(&self) -> ApiResult<Json<HealthcheckResponse>> {
        let queue = self.queue_service.counts().await?;
        let workers = self.worker_service.counts().await?;
        Ok(Json(HealthcheckResponse {
            status: "ok".to_string(),
            queue,
            workers,
        }))
    }

    /// Controller version
    #[oai(path = "/version", method = "get", operation_id = "version")]
    async fn version(&self) -> Json<VersionInfo> {
        Json(VersionInfo {
            version: VERSION.to_string(),
        })
    }
}
