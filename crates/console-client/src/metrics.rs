//! Metric recording for API calls
//!
//! - `console_api_requests_total` (counter): labels `method`, `outcome`
//! - `console_api_request_duration_seconds` (histogram): label `outcome`
//! - `console_api_retries_total` (counter): label `kind`
//! - `console_api_uploads_total` (counter): label `outcome`
//!
//! `console_api_refresh_total` is recorded by the renewal coordinator. All
//! calls are no-ops until the binary installs a recorder.

use crate::error::ApiError;

/// Histogram name, exported so the binary can configure buckets for it.
pub const REQUEST_DURATION: &str = "console_api_request_duration_seconds";

/// `ok`, or the error kind label.
pub fn outcome<T>(result: &Result<T, ApiError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind().label(),
    }
}

/// Record a finished logical call (all attempts included).
pub fn record_request(method: &str, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("console_api_requests_total", "method" => method.to_string(), "outcome" => outcome)
        .increment(1);
    metrics::histogram!(REQUEST_DURATION, "outcome" => outcome).record(duration_secs);
}

/// Record one scheduled retry, labelled with the error that caused it.
pub fn record_retry(err: &ApiError) {
    metrics::counter!("console_api_retries_total", "kind" => err.kind().label()).increment(1);
}

pub fn record_upload(outcome: &'static str) {
    metrics::counter!("console_api_uploads_total", "outcome" => outcome).increment(1);
}
