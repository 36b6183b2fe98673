use ::tracing::Span;
use lazy_static::lazy_static;
use prometheus::{histogram_opts, HistogramVec, Registry};
use std::time::Instant;

lazy_static! {
    static ref API_SUCCESS_SECONDS: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "api_success_seconds",
            "Duration of successfully served HTTP API requests"
        ),
        &["api"],
    )
    .unwrap();
    static ref API_FAILURE_SECONDS: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "api_failure_seconds",
            "Duration of failed HTTP API requests"
        ),
        &["api", "error_kind"],
    )
    .unwrap();
}

pub fn register_api_metrics(registry: &Registry) {
    registry
        .register(Box::new(API_SUCCESS_SECONDS.clone()))
        .expect("API success metric registration");
    registry
        .register(Box::new(API_FAILURE_SECONDS.clone()))
        .expect("API failure metric registration");
}

/// Classifies an API error for metric labels and decides whether it is an
/// expected client-side outcome or something worth alerting on.
pub trait TraceErrorKind {
    fn trace_error_kind(&self) -> &'static str;

    fn is_expected(&self) -> bool {
        true
    }
}

/// One recorded HTTP API request: a span carrying the endpoint fields plus a
/// timer that lands in the success/failure histograms when `result` is
/// called.
pub struct RecordedHttpApiRequest {
    pub span: Span,
    api_name: &'static str,
    start: Instant,
}

impl RecordedHttpApiRequest {
    pub fn new(api_name: &'static str, span: Span) -> Self {
        Self {
            span,
            api_name,
            start: Instant::now(),
        }
    }

    pub fn result<T, E: TraceErrorKind>(self, result: Result<T, E>) -> Result<T, E> {
        let elapsed = self.start.elapsed().as_secs_f64();
        match &result {
            Ok(_) => {
                API_SUCCESS_SECONDS
                    .with_label_values(&[self.api_name])
                    .observe(elapsed);
                self.span
                    .in_scope(|| ::tracing::debug!(api = self.api_name, "API request succeeded"));
            }
            Err(error) => {
                let kind = error.trace_error_kind();
                API_FAILURE_SECONDS
                    .with_label_values(&[self.api_name, kind])
                    .observe(elapsed);
                self.span.in_scope(|| {
                    if error.is_expected() {
                        ::tracing::debug!(api = self.api_name, error_kind = kind, "API request failed");
                    } else {
                        ::tracing::error!(api = self.api_name, error_kind = kind, "API request failed");
                    }
                });
            }
        }
        result
    }
}

/// Opens a span for one HTTP API request and returns the recording handle;
/// finish with [`RecordedHttpApiRequest::result`].
#[macro_export]
macro_rules! recorded_http_api_request {
    ($api_name:expr $(, $field_name:ident = $field_value:expr)* $(,)?) => {{
        let span = ::tracing::info_span!(
            "api_request",
            api = $api_name
            $(, $field_name = ::tracing::field::debug(&$field_value))*
        );
        $crate::metrics::api::RecordedHttpApiRequest::new($api_name, span)
    }};
}
