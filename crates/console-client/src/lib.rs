//! Resilient client for the pentest console REST API
//!
//! `ApiClient` turns logical operations into authenticated, time-bounded and
//! retried HTTP exchanges. Failures come back as a single classified
//! `ApiError` once the retry budget is spent or the failure is not worth
//! retrying.
//!
//! Request flow:
//! 1. `RefreshCoordinator::ensure_fresh()` (from `console-auth`) renews the
//!    credential first when it is near expiry, shared across concurrent calls
//! 2. The attempt is sent with the bearer token and raced against its deadline
//! 3. `classify` maps the status and body onto `ApiError`
//! 4. `RetryPolicy` decides whether and when to try again
//!
//! Uploads are validated before any network activity and use their own,
//! smaller retry budget.

pub mod classify;
pub mod client;
pub mod download;
pub mod error;
pub mod metrics;
pub mod request;
pub mod retry;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use classify::{classify, classify_failure, classify_response};
pub use client::{ApiClient, ClientConfig, IDEMPOTENCY_KEY, RetryEvent, RetryHook};
pub use download::Download;
pub use error::{ApiError, ErrorKind, FieldErrors, Result};
pub use request::{RequestDescriptor, serialize_query};
pub use retry::{RetryDecision, RetryPolicy};
pub use upload::{
    ALLOWED_EXTENSIONS, MAX_UPLOAD_BYTES, ProgressCallback, UploadDescriptor, UploadFile,
    UploadPolicy,
};

pub use console_auth::{Credential, CredentialStore, FileBackend, MemoryBackend};
