use buildgrid_common::metrics::api::TraceErrorKind;
use buildgrid_common::model::ErrorBody;
use buildgrid_common::SafeDisplay;
use poem::Route;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, OpenApiService, Tags};
use tracing::error;

use crate::repo::RepoError;
use crate::service::auth::AuthError;
use crate::service::build::BuildServiceError;
use crate::service::queue::QueueServiceError;
use crate::service::token::TokenServiceError;
use crate::service::worker::WorkerServiceError;
use crate::service::Services;
use crate::storage::StorageError;

pub mod build;
pub mod guest;
pub mod healthcheck;
pub mod middleware;
pub mod security;
pub mod worker;

#[derive(Tags)]
enum ApiTags {
    Build,
    Worker,
    Guest,
    HealthCheck,
}

#[derive(ApiResponse, Debug, Clone)]
pub enum ApiError {
    /// Malformed or invalid request
    #[oai(status = 400)]
    BadRequest(Json<ErrorBody>),
    /// Missing, malformed or expired credential
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    /// Valid credential with the wrong class or scope
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    /// Entity not found
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    /// Illegal state transition
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
    /// Payload exceeds the configured size cap
    #[oai(status = 413)]
    PayloadTooLarge(Json<ErrorBody>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
    /// Transient overload or store outage; retry with backoff
    #[oai(status = 503)]
    Unavailable(Json<ErrorBody>),
}

impl ApiError {
    fn body(code: &str, message: impl Into<String>) -> Json<ErrorBody> {
        Json(ErrorBody::new(code, message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::InternalError(Self::body("InternalError", message))
    }
}

impl TraceErrorKind for ApiError {
    fn trace_error_kind(&self) -> &'static str {
        match &self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Unauthorized(_) => "Unauthorized",
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::PayloadTooLarge(_) => "PayloadTooLarge",
            ApiError::InternalError(_) => "InternalError",
            ApiError::Unavailable(_) => "Unavailable",
        }
    }

    fn is_expected(&self) -> bool {
        !matches!(self, ApiError::InternalError(_))
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match &value {
            AuthError::Unauthenticated => {
                ApiError::Unauthorized(Self::body("Unauthenticated", value.to_safe_string()))
            }
            AuthError::TokenExpired => {
                ApiError::Unauthorized(Self::body("TokenExpired", value.to_safe_string()))
            }
            AuthError::Forbidden => {
                ApiError::Forbidden(Self::body("Forbidden", value.to_safe_string()))
            }
            AuthError::InternalRepoError(inner) => repo_error(inner),
        }
    }
}

impl From<TokenServiceError> for ApiError {
    fn from(value: TokenServiceError) -> Self {
        match &value {
            TokenServiceError::Consumed => {
                ApiError::Forbidden(Self::body("TokenConsumed", value.to_safe_string()))
            }
            TokenServiceError::Invalid => {
                ApiError::Unauthorized(Self::body("Unauthenticated", value.to_safe_string()))
            }
            TokenServiceError::InternalRepoError(inner) => repo_error(inner),
        }
    }
}

impl From<BuildServiceError> for ApiError {
    fn from(value: BuildServiceError) -> Self {
        match value {
            BuildServiceError::NotFound(_) => {
                ApiError::NotFound(Self::body("NotFound", value.to_safe_string()))
            }
            BuildServiceError::IllegalTransition { .. } => {
                ApiError::Conflict(Self::body("IllegalTransition", value.to_safe_string()))
            }
            BuildServiceError::Forbidden(_) => {
                ApiError::Forbidden(Self::body("Forbidden", value.to_safe_string()))
            }
            BuildServiceError::Validation(_) => {
                ApiError::BadRequest(Self::body("Validation", value.to_safe_string()))
            }
            BuildServiceError::Storage(inner) => inner.into(),
            BuildServiceError::InternalRepoError(inner) => repo_error(&inner),
            BuildServiceError::Internal(message) => {
                error!(detail = %message, "internal build service error");
                ApiError::internal("Internal error")
            }
        }
    }
}

impl From<QueueServiceError> for ApiError {
    fn from(value: QueueServiceError) -> Self {
        match &value {
            QueueServiceError::WorkerBusy => {
                ApiError::Conflict(Self::body("WorkerBusy", value.to_safe_string()))
            }
            QueueServiceError::Internal(message) => {
                error!(detail = %message, "internal queue service error");
                ApiError::internal("Internal error")
            }
            QueueServiceError::InternalRepoError(inner) => repo_error(inner),
        }
    }
}

impl From<WorkerServiceError> for ApiError {
    fn from(value: WorkerServiceError) -> Self {
        match &value {
            WorkerServiceError::NotFound(_) => {
                ApiError::NotFound(Self::body("NotFound", value.to_safe_string()))
            }
            WorkerServiceError::TokenExpired => {
                ApiError::Unauthorized(Self::body("TokenExpired", value.to_safe_string()))
            }
            WorkerServiceError::Validation(_) => {
                ApiError::BadRequest(Self::body("Validation", value.to_safe_string()))
            }
            WorkerServiceError::InternalRepoError(inner) => repo_error(inner),
            WorkerServiceError::Internal(message) => {
                error!(detail = %message, "internal worker service error");
                ApiError::internal("Internal error")
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(value: StorageError) -> Self {
        match &value {
            StorageError::PayloadTooLarge { .. } => {
                ApiError::PayloadTooLarge(Self::body("PayloadTooLarge", value.to_safe_string()))
            }
            StorageError::PathViolation { path } => {
                // a path violation is a bug in the caller, never user input
                error!(path = %path, "artifact path escaped the storage root");
                ApiError::internal("Internal error")
            }
            StorageError::NotFound { .. } => {
                ApiError::NotFound(Self::body("NotFound", value.to_safe_string()))
            }
            StorageError::InvalidBundle(_) => {
                ApiError::BadRequest(Self::body("Validation", value.to_safe_string()))
            }
            StorageError::Unavailable(_) => {
                ApiError::Unavailable(Self::body("StorageUnavailable", value.to_safe_string()))
            }
        }
    }
}

fn repo_error(value: &RepoError) -> ApiError {
    if value.is_unavailable() {
        ApiError::Unavailable(ApiError::body("StoreUnavailable", value.to_safe_string()))
    } else {
        error!(error = %value, "repository error");
        ApiError::InternalError(ApiError::body("InternalError", value.to_safe_string()))
    }
}

impl From<RepoError> for ApiError {
    fn from(value: RepoError) -> Self {
        repo_error(&value)
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub type Apis = (
    build::BuildApi,
    worker::WorkerApi,
    guest::GuestApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            build::BuildApi::new(services),
            worker::WorkerApi::new(services),
            guest::GuestApi::new(services),
            healthcheck::HealthcheckApi::new(services),
        ),
        "BuildGrid Controller API",
        "1.0",
    )
}

pub fn combined_routes(services: &Services) -> Route {
    let api_service = make_open_api_service(services);

    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
}
