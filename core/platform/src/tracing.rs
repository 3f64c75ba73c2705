use crate::errors::PlatformError;
use std::env;
use tracing::{info, info_span, Instrument, Span};
use uuid::Uuid;

/// Initialize logging and announce startup for the service.
pub fn init_tracing(service_name: &str) -> Result<(), PlatformError> {
    crate::logging::init_logging(service_name);

    let environment = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

    info!(
        service = %service_name,
        environment = %environment,
        event = "startup",
        "tracing initialized"
    );

    Ok(())
}

/// Span tying all work for one request together across the pipeline stages.
pub fn request_span(request_id: Uuid, operation: &str) -> Span {
    info_span!(
        "operation",
        %operation,
        request_id = %request_id,
    )
}

/// Run an async operation inside a request-scoped span.
pub async fn with_request_context<F, R>(request_id: Uuid, operation: &str, f: F) -> R
where
    F: std::future::Future<Output = R>,
{
    let span = request_span(request_id, operation);
    f.instrument(span).await
}
