use std::net::SocketAddr;
use std::sync::Once;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::errors::{PlatformError, PlatformResult};

/// Ensure we only install a single global recorder even if `init_metrics`
/// is called multiple times.
static INIT: Once = Once::new();

/// Initialize metrics exporting using a Prometheus HTTP exporter.
///
/// Installs a global recorder backed by `metrics-exporter-prometheus` and
/// exposes a `/metrics` endpoint on `bind_addr`. Subsequent calls are
/// ignored after the first successful initialization.
pub fn init_metrics(bind_addr: SocketAddr) -> PlatformResult<()> {
    let mut init_result: PlatformResult<()> = Ok(());

    INIT.call_once(|| {
        let builder = PrometheusBuilder::new().with_http_listener(bind_addr);

        if let Err(err) = builder.install() {
            init_result = Err(PlatformError::Metrics(err.to_string()));
        }
    });

    init_result
}

/// Record a counter metric by name. The name must be a `'static` string;
/// all call sites use literals.
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a histogram observation (seconds unless the name says otherwise).
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}
