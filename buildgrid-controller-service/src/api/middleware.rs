use std::sync::Arc;
use std::time::Duration;

use buildgrid_common::correlation;
use buildgrid_common::model::ErrorBody;
use poem::http::{HeaderValue, StatusCode};
use poem::{Endpoint, IntoResponse, Middleware, Request, Response};
use tokio::sync::Semaphore;
use tracing::Instrument;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Assigns every request a correlation id (or adopts the caller's), scopes
/// it onto the task so error bodies can embed it, and echoes it in the
/// response headers.
pub struct CorrelationIdMiddleware;

impl<E: Endpoint> Middleware<E> for CorrelationIdMiddleware {
    type Output = CorrelationIdEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        CorrelationIdEndpoint { inner: ep }
    }
}

pub struct CorrelationIdEndpoint<E> {
    inner: E,
}

impl<E: Endpoint> Endpoint for CorrelationIdEndpoint<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        let correlation_id = req
            .header(CORRELATION_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(correlation::new_correlation_id);

        let span = tracing::info_span!("request", correlation_id = %correlation_id);
        let result = correlation::scope(
            correlation_id.clone(),
            self.inner.call(req).instrument(span),
        )
        .await;

        let mut response = match result {
            Ok(output) => output.into_response(),
            Err(err) => err.into_response(),
        };
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response
                .headers_mut()
                .insert(CORRELATION_ID_HEADER, value);
        }
        Ok(response)
    }
}

/// Bounded concurrency plus a per-request deadline. Requests beyond the cap
/// are rejected with 503 instead of queueing unboundedly; a request that
/// outlives its deadline is abandoned, rolling back whatever store
/// transaction it held open.
pub struct RequestLimitsMiddleware {
    semaphore: Arc<Semaphore>,
    request_timeout: Duration,
}

impl RequestLimitsMiddleware {
    pub fn new(max_concurrent_requests: usize, request_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_requests)),
            request_timeout,
        }
    }
}

impl<E: Endpoint> Middleware<E> for RequestLimitsMiddleware {
    type Output = RequestLimitsEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        RequestLimitsEndpoint {
            inner: ep,
            semaphore: self.semaphore.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

pub struct RequestLimitsEndpoint<E> {
    inner: E,
    semaphore: Arc<Semaphore>,
    request_timeout: Duration,
}

impl<E: Endpoint> Endpoint for RequestLimitsEndpoint<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        let Ok(_permit) = self.semaphore.clone().try_acquire_owned() else {
            return Ok(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "ServiceUnavailable",
                "Request capacity exhausted, retry with backoff",
            ));
        };

        match tokio::time::timeout(self.request_timeout, self.inner.call(req)).await {
            Ok(Ok(output)) => Ok(output.into_response()),
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "ServiceUnavailable",
                "Request deadline exceeded",
            )),
        }
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = ErrorBody::new(code, message);
    let rendered = serde_json::to_string(&body)
        .unwrap_or_else(|_| format!("{{\"code\":\"{code}\",\"message\":\"{message}\"}}"));
    Response::builder()
        .status(status)
        .content_type("application/json")
        .body(rendered)
}
