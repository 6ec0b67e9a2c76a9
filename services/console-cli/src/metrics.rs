//! Prometheus exposition for `--print-metrics`
//!
//! The client crates record through the `metrics` facade; this module only
//! installs the recorder and renders it.

use console_client::metrics::REQUEST_DURATION;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Covers a fast 2xx up to a fully retried call that hit its timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
}

/// Install the global recorder and return a handle for rendering.
///
/// The duration metric renders as a histogram with `_bucket` lines rather
/// than the default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}
