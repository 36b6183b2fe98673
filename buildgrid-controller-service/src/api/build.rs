use std::sync::Arc;

use buildgrid_common::model::BuildId;
use buildgrid_common::recorded_http_api_request;
use poem::Body;
use poem_openapi::param::{Path, Query};
use poem_openapi::payload::{Binary, Json};
use poem_openapi::types::multipart::{JsonField, Upload};
use poem_openapi::{ApiResponse, Multipart, OpenApi};
use tokio_util::io::ReaderStream;
use tracing::Instrument;

use crate::api::security::{AdminSecurity, SubmitterSecurity};
use crate::api::{ApiError, ApiResult, ApiTags};
use crate::model::{
    BuildCreatedResponse, BuildLogEntryView, BuildStatusResponse, BuildSubmitQuery,
};
use crate::service::auth::AuthService;
use crate::service::build::{ArtifactStream, BuildService};
use crate::service::Services;

#[derive(Multipart)]
pub struct BuildSubmitPayload {
    query: JsonField<BuildSubmitQuery>,
    source: Upload,
    credentials: Option<Upload>,
}

#[derive(ApiResponse)]
pub enum BuildCreated {
    #[oai(status = 201)]
    Created(Json<BuildCreatedResponse>),
}

const DEFAULT_LOG_LIMIT: i64 = 1000;
const DEFAULT_LIST_LIMIT: i64 = 100;

pub struct BuildApi {
    auth_service: Arc<dyn AuthService>,
    build_service: Arc<dyn BuildService>,
    chunk_size: usize,
}

#[OpenApi(prefix_path = "/v1/builds", tag = ApiTags::Build)]
impl BuildApi {
    pub fn new(services: &Services) -> Self {
        Self {
            auth_service: services.auth_service.clone(),
            build_service: services.build_service.clone(),
            chunk_size: services.artifact_store.chunk_size(),
        }
    }

    /// Submit a build
    ///
    /// Accepts a multipart submission holding the target platform, the
    /// source bundle and optionally a credential bundle. Returns the build
    /// id together with the build token used for all later submitter calls
    /// on this build; this is the only time the token is returned.
    #[oai(path = "/", method = "post", operation_id = "submit_build")]
    async fn submit_build(
        &self,
        payload: BuildSubmitPayload,
        auth: AdminSecurity,
    ) -> ApiResult<BuildCreated> {
        let record = recorded_http_api_request!(
            "submit_build",
            platform = payload.query.0.platform.to_string()
        );
        let response = {
            async {
                self.auth_service.authorize_admin(&auth.0).await?;
                let source: ArtifactStream = Box::pin(payload.source.into_async_read());
                let credentials = match payload.credentials {
                    Some(upload) => {
                        let stream: ArtifactStream = Box::pin(upload.into_async_read());
                        Some(stream)
                    }
                    None => None,
                };
                let created = self
                    .build_service
                    .submit(payload.query.0.platform, source, credentials)
                    .await?;
                Ok(BuildCreated::Created(Json(created)))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// List recent builds
    #[oai(path = "/", method = "get", operation_id = "list_builds")]
    async fn list_builds(
        &self,
        limit: Query<Option<i64>>,
        auth: AdminSecurity,
    ) -> ApiResult<Json<Vec<BuildStatusResponse>>> {
        let record = recorded_http_api_request!("list_builds");
        let response = {
            async {
                self.auth_service.authorize_admin(&auth.0).await?;
                let builds = self
                    .build_service
                    .list_recent(limit.0.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1000))
                    .await?;
                Ok(Json(builds.iter().map(BuildStatusResponse::from).collect()))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// List builds currently assigned or building
    #[oai(path = "/active", method = "get", operation_id = "list_active_builds")]
    async fn list_active_builds(
        &self,
        auth: AdminSecurity,
    ) -> ApiResult<Json<Vec<BuildStatusResponse>>> {
        let record = recorded_http_api_request!("list_active_builds");
        let response = {
            async {
                self.auth_service.authorize_admin(&auth.0).await?;
                let builds = self.build_service.list_active().await?;
                Ok(Json(builds.iter().map(BuildStatusResponse::from).collect()))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Build status
    #[oai(
        path = "/:build_id/status",
        method = "get",
        operation_id = "get_build_status"
    )]
    async fn get_build_status(
        &self,
        build_id: Path<BuildId>,
        auth: SubmitterSecurity,
    ) -> ApiResult<Json<BuildStatusResponse>> {
        let record =
            recorded_http_api_request!("get_build_status", build_id = build_id.0.to_string());
        let response = {
            async {
                self.auth_service
                    .authorize_build_access(&auth.to_auth(), &build_id.0)
                    .await?;
                let build = self.build_service.status(&build_id.0).await?;
                Ok(Json(BuildStatusResponse::from(&build)))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Build logs
    ///
    /// Returns the build's log entries in insertion order.
    #[oai(
        path = "/:build_id/logs",
        method = "get",
        operation_id = "get_build_logs"
    )]
    async fn get_build_logs(
        &self,
        build_id: Path<BuildId>,
        limit: Query<Option<i64>>,
        auth: SubmitterSecurity,
    ) -> ApiResult<Json<Vec<BuildLogEntryView>>> {
        let record =
            recorded_http_api_request!("get_build_logs", build_id = build_id.0.to_string());
        let response = {
            async {
                self.auth_service
                    .authorize_build_access(&auth.to_auth(), &build_id.0)
                    .await?;
                let entries = self
                    .build_service
                    .logs(
                        &build_id.0,
                        limit.0.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, 10_000),
                    )
                    .await?;
                Ok(Json(entries.iter().map(BuildLogEntryView::from).collect()))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Retry a failed build
    ///
    /// Creates a new pending build with the same source and credential bytes
    /// and a fresh build token. The failed original stays terminal; both
    /// builds gain cross-referencing log entries.
    #[oai(
        path = "/:build_id/retry",
        method = "post",
        operation_id = "retry_build"
    )]
    async fn retry_build(
        &self,
        build_id: Path<BuildId>,
        auth: SubmitterSecurity,
    ) -> ApiResult<BuildCreated> {
        let record = recorded_http_api_request!("retry_build", build_id = build_id.0.to_string());
        let response = {
            async {
                self.auth_service
                    .authorize_build_access(&auth.to_auth(), &build_id.0)
                    .await?;
                let created = self.build_service.retry(&build_id.0).await?;
                Ok(BuildCreated::Created(Json(created)))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Cancel a pending build
    #[oai(
        path = "/:build_id/cancel",
        method = "post",
        operation_id = "cancel_build"
    )]
    async fn cancel_build(
        &self,
        build_id: Path<BuildId>,
        auth: SubmitterSecurity,
    ) -> ApiResult<Json<BuildStatusResponse>> {
        let record = recorded_http_api_request!("cancel_build", build_id = build_id.0.to_string());
        let response = {
            async {
                self.auth_service
                    .authorize_build_access(&auth.to_auth(), &build_id.0)
                    .await?;
                let build = self.build_service.cancel(&build_id.0).await?;
                Ok(Json(BuildStatusResponse::from(&build)))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Download the build result
    ///
    /// Streams the result artifact in fixed-size chunks.
    #[oai(
        path = "/:build_id/result",
        method = "get",
        operation_id = "download_build_result"
    )]
    async fn download_build_result(
        &self,
        build_id: Path<BuildId>,
        auth: SubmitterSecurity,
    ) -> ApiResult<Binary<Body>> {
        let record =
            recorded_http_api_request!("download_build_result", build_id = build_id.0.to_string());
        let response = {
            async {
                self.auth_service
                    .authorize_build_access(&auth.to_auth(), &build_id.0)
                    .await?;
                let (file, _len) = self.build_service.open_result(&build_id.0).await?;
                let stream = ReaderStream::with_capacity(file, self.chunk_size);
                Ok::<_, ApiError>(Binary(Body::from_bytes_stream(stream)))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }
}
