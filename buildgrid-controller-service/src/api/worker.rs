use std::sync::Arc;

use buildgrid_common::model::{WorkerId, WorkerStatus};
use buildgrid_common::recorded_http_api_request;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::types::multipart::{JsonField, Upload};
use poem_openapi::{Multipart, OpenApi};
use tracing::{warn, Instrument};

use crate::api::security::{AdminSecurity, SessionSecurity};
use crate::api::{ApiError, ApiResult, ApiTags};
use crate::model::{
    OutcomeResponse, PollResponse, UnregisterResponse, WorkerRegistrationRequest,
    WorkerRegisteredResponse, WorkerResultQuery, WorkerView,
};
use crate::service::auth::AuthService;
use crate::service::build::{ArtifactStream, BuildService};
use crate::service::queue::{QueueService, QueueServiceError};
use crate::service::worker::WorkerService;
use crate::service::Services;

#[derive(Multipart)]
pub struct WorkerResultPayload {
    query: JsonField<WorkerResultQuery>,
    artifact: Option<Upload>,
}

pub struct WorkerApi {
    auth_service: Arc<dyn AuthService>,
    worker_service: Arc<dyn WorkerService>,
    queue_service: Arc<dyn QueueService>,
    build_service: Arc<dyn BuildService>,
}

#[OpenApi(prefix_path = "/v1/workers", tag = ApiTags::Worker)]
impl WorkerApi {
    pub fn new(services: &Services) -> Self {
        Self {
            auth_service: services.auth_service.clone(),
            worker_service: services.worker_service.clone(),
            queue_service: services.queue_service.clone(),
            build_service: services.build_service.clone(),
        }
    }

    /// Register a worker
    ///
    /// Creates a new worker record and hands out its first session token.
    /// Worker names are not unique; re-registering always creates a new
    /// worker identity.
    #[oai(path = "/", method = "post", operation_id = "register_worker")]
    async fn register_worker(
        &self,
        request: Json<WorkerRegistrationRequest>,
        auth: AdminSecurity,
    ) -> ApiResult<Json<WorkerRegisteredResponse>> {
        let record = recorded_http_api_request!("register_worker", name = request.0.name);
        let response = {
            async {
                self.auth_service.authorize_admin(&auth.0).await?;
                let registered = self
                    .worker_service
                    .register(&request.0.name, &request.0.capabilities)
                    .await?;
                Ok(Json(registered))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// List workers
    #[oai(path = "/", method = "get", operation_id = "list_workers")]
    async fn list_workers(&self, auth: AdminSecurity) -> ApiResult<Json<Vec<WorkerView>>> {
        let record = recorded_http_api_request!("list_workers");
        let response = {
            async {
                self.auth_service.authorize_admin(&auth.0).await?;
                let workers = self.worker_service.list().await?;
                Ok(Json(workers.iter().map(WorkerView::from).collect()))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Worker poll
    ///
    /// The worker's combined heartbeat and job request. Every successful
    /// poll rotates the session token; the returned token replaces the
    /// presented one, which stops validating the moment this response is
    /// produced. An idle worker may additionally receive a job assignment
    /// with a single-use bootstrap OTP for its guest environment.
    #[oai(path = "/poll", method = "get", operation_id = "poll_worker")]
    async fn poll_worker(&self, auth: SessionSecurity) -> ApiResult<Json<PollResponse>> {
        let record = recorded_http_api_request!("poll_worker");
        let response = {
            async {
                let worker = self.auth_service.authorize_worker_session(&auth.0).await?;
                let session_token = self.worker_service.heartbeat(&worker, &auth.0).await?;

                let job = if worker.status == WorkerStatus::Idle {
                    match self.queue_service.try_assign_one(&worker.id).await {
                        Ok(job) => job,
                        Err(QueueServiceError::WorkerBusy) => {
                            // raced another poll for the same worker; the
                            // next poll reconciles
                            warn!(worker_id = %worker.id, "assignment skipped, worker no longer idle");
                            None
                        }
                        Err(err) => return Err(ApiError::from(err)),
                    }
                } else {
                    None
                };

                Ok(Json(PollResponse { session_token, job }))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Report a build outcome
    ///
    /// A multipart report of success (with the result artifact) or failure
    /// (with a failure message) for a build assigned to the calling worker.
    #[oai(path = "/result", method = "post", operation_id = "report_worker_result")]
    async fn report_worker_result(
        &self,
        payload: WorkerResultPayload,
        auth: SessionSecurity,
    ) -> ApiResult<Json<OutcomeResponse>> {
        let record = recorded_http_api_request!(
            "report_worker_result",
            build_id = payload.query.0.build_id.to_string(),
            success = payload.query.0.success
        );
        let response = {
            async {
                let worker = self.auth_service.authorize_worker_session(&auth.0).await?;
                let artifact = match payload.artifact {
                    Some(upload) => {
                        let stream: ArtifactStream = Box::pin(upload.into_async_read());
                        Some(stream)
                    }
                    None => None,
                };
                let build = self
                    .build_service
                    .report_outcome(
                        &worker,
                        &payload.query.0.build_id,
                        payload.query.0.success,
                        payload.query.0.failure.clone(),
                        artifact,
                    )
                    .await?;
                Ok(Json(OutcomeResponse {
                    build_id: build.id,
                    status: build.status,
                }))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Unregister a worker
    ///
    /// Graceful shutdown: releases the worker's in-progress builds back to
    /// the queue and retains the record for accounting.
    #[oai(
        path = "/:worker_id/unregister",
        method = "post",
        operation_id = "unregister_worker"
    )]
    async fn unregister_worker(
        &self,
        worker_id: Path<WorkerId>,
        auth: SessionSecurity,
    ) -> ApiResult<Json<UnregisterResponse>> {
        let record =
            recorded_http_api_request!("unregister_worker", worker_id = worker_id.0.to_string());
        let response = {
            async {
                let worker = self.auth_service.authorize_worker_session(&auth.0).await?;
                if worker.id != worker_id.0 {
                    return Err(ApiError::Forbidden(Json(
                        buildgrid_common::model::ErrorBody::new(
                            "Forbidden",
                            "Session token does not belong to this worker",
                        ),
                    )));
                }
                let released = self.worker_service.unregister(&worker.id).await?;
                Ok(Json(UnregisterResponse {
                    worker_id: worker.id,
                    released_builds: released,
                }))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }
}
