use std::sync::Arc;

use buildgrid_common::model::BuildId;
use buildgrid_common::recorded_http_api_request;
use poem::Body;
use poem_openapi::param::Path;
use poem_openapi::payload::{Binary, Json};
use poem_openapi::OpenApi;
use tokio_util::io::ReaderStream;
use tracing::Instrument;

use crate::api::security::{AdminSecurity, BootstrapOtpSecurity, GuestTokenSecurity};
use crate::api::{ApiError, ApiResult, ApiTags};
use crate::model::{GuestTokenResponse, SecureCredentialsResponse};
use crate::service::auth::AuthService;
use crate::service::build::BuildService;
use crate::service::token::TokenService;
use crate::service::Services;

/// The in-guest surface: everything a build VM needs from the controller,
/// authenticated with the guest token it obtained through the bootstrap OTP
/// handshake.
pub struct GuestApi {
    auth_service: Arc<dyn AuthService>,
    token_service: Arc<dyn TokenService>,
    build_service: Arc<dyn BuildService>,
    chunk_size: usize,
}

#[OpenApi(prefix_path = "/v1/builds", tag = ApiTags::Guest)]
impl GuestApi {
    pub fn new(services: &Services) -> Self {
        Self {
            auth_service: services.auth_service.clone(),
            token_service: services.token_service.clone(),
            build_service: services.build_service.clone(),
            chunk_size: services.artifact_store.chunk_size(),
        }
    }

    /// Guest handshake
    ///
    /// Exchanges the single-use bootstrap OTP handed out at assignment for a
    /// longer-lived guest token. The OTP is consumed in the same commit that
    /// mints the guest token, so a second exchange attempt fails even when
    /// both arrive concurrently.
    #[oai(
        path = "/:build_id/authenticate",
        method = "post",
        operation_id = "authenticate_guest"
    )]
    async fn authenticate_guest(
        &self,
        build_id: Path<BuildId>,
        admin: AdminSecurity,
        otp: BootstrapOtpSecurity,
    ) -> ApiResult<Json<GuestTokenResponse>> {
        let record =
            recorded_http_api_request!("authenticate_guest", build_id = build_id.0.to_string());
        let response = {
            async {
                self.auth_service.authorize_admin(&admin.0).await?;
                let guest = self
                    .token_service
                    .exchange_bootstrap_otp(&otp.0, &build_id.0)
                    .await?;
                Ok(Json(guest))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Fetch the source bundle
    ///
    /// Streams the submitted source bytes into the guest. The first call
    /// moves the build from Assigned to Building.
    #[oai(
        path = "/:build_id/source",
        method = "get",
        operation_id = "download_build_source"
    )]
    async fn download_build_source(
        &self,
        build_id: Path<BuildId>,
        auth: GuestTokenSecurity,
    ) -> ApiResult<Binary<Body>> {
        let record =
            recorded_http_api_request!("download_build_source", build_id = build_id.0.to_string());
        let response = {
            async {
                self.auth_service
                    .authorize_guest(&auth.0, &build_id.0)
                    .await?;
                self.build_service.mark_building(&build_id.0).await?;
                let (file, _len) = self.build_service.open_source(&build_id.0).await?;
                let stream = ReaderStream::with_capacity(file, self.chunk_size);
                Ok::<_, ApiError>(Binary(Body::from_bytes_stream(stream)))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }

    /// Fetch decoded signing credentials
    ///
    /// Decodes the submitted credential bundle in memory and returns its
    /// fields, so the guest never handles the raw archive.
    #[oai(
        path = "/:build_id/certs-secure",
        method = "get",
        operation_id = "get_secure_credentials"
    )]
    async fn get_secure_credentials(
        &self,
        build_id: Path<BuildId>,
        auth: GuestTokenSecurity,
    ) -> ApiResult<Json<SecureCredentialsResponse>> {
        let record =
            recorded_http_api_request!("get_secure_credentials", build_id = build_id.0.to_string());
        let response = {
            async {
                self.auth_service
                    .authorize_guest(&auth.0, &build_id.0)
                    .await?;
                let credentials = self.build_service.secure_credentials(&build_id.0).await?;
                Ok(Json(credentials))
            }
            .instrument(record.span.clone())
            .await
        };
        record.result(response)
    }
}
