use std::env;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};
use uuid::Uuid;

/// Field name carrying the request identifier on every per-request span.
pub const REQUEST_ID_FIELD: &str = "request_id";

/// Initialize structured logging for a service.
///
/// In `prod` and `staging` (selected by `APP_ENV`) logs are emitted as JSON
/// with span context; in development a human-readable formatter is used.
pub fn init_logging(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let environment = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

    if environment == "prod" || environment == "staging" {
        let json_layer = fmt::layer()
            .json()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .finish()
            .init();
    }

    tracing::info!(
        service = %service_name,
        environment = %environment,
        "logging initialized"
    );
}

/// Use the caller-provided id when present, otherwise mint a fresh one.
pub fn ensure_correlation_id(existing_id: Option<Uuid>) -> Uuid {
    existing_id.unwrap_or_else(Uuid::new_v4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_correlation_id_preserves_existing() {
        let id = Uuid::new_v4();
        assert_eq!(ensure_correlation_id(Some(id)), id);
    }

    #[test]
    fn ensure_correlation_id_mints_when_absent() {
        let a = ensure_correlation_id(None);
        let b = ensure_correlation_id(None);
        assert_ne!(a, b);
    }
}
