//! Classified error taxonomy for API calls
//!
//! Every failed logical call surfaces as exactly one `ApiError`. Callers match
//! on the variant (or on `kind()`) instead of inspecting status codes.

use std::collections::BTreeMap;

/// Per-field validation messages, keyed by field name.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Field-less discriminant of `ApiError`, used for matching and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthenticationRequired,
    PermissionDenied,
    NotFound,
    ValidationFailed,
    RateLimited,
    ServerError,
    ServiceUnavailable,
    NetworkFailure,
    UploadRejected,
    ClientError,
    InvalidRequest,
    InvalidResponse,
}

impl ErrorKind {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::AuthenticationRequired => "authentication_required",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::UploadRejected => "upload_rejected",
            ErrorKind::ClientError => "client_error",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InvalidResponse => "invalid_response",
        }
    }

    /// Kinds worth another attempt: rate limits, 5xx and transport failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::ServiceUnavailable
                | ErrorKind::NetworkFailure
        )
    }
}

/// A classified failure of a logical API call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// 401, or a failed credential renewal. Clears the stored credential.
    #[error("authentication required: {message}")]
    AuthenticationRequired { message: String },

    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("validation failed: {message}")]
    ValidationFailed {
        message: String,
        field_errors: FieldErrors,
    },

    /// `retry_after` is the server-suggested delay in seconds.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Connection failures and attempt timeouts.
    #[error("network failure: {message}")]
    NetworkFailure { message: String },

    /// Client-side pre-flight rejection of an upload; no request was sent.
    #[error("upload rejected: {message}")]
    UploadRejected { message: String },

    /// Any other 4xx.
    #[error("request rejected ({status}): {message}")]
    ClientError { status: u16, message: String },

    /// The request could not be built (unserializable body, bad header).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// A success response whose body could not be decoded.
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::AuthenticationRequired { .. } => ErrorKind::AuthenticationRequired,
            ApiError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            ApiError::NotFound { .. } => ErrorKind::NotFound,
            ApiError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::ServerError { .. } => ErrorKind::ServerError,
            ApiError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            ApiError::NetworkFailure { .. } => ErrorKind::NetworkFailure,
            ApiError::UploadRejected { .. } => ErrorKind::UploadRejected,
            ApiError::ClientError { .. } => ErrorKind::ClientError,
            ApiError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            ApiError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
        }
    }

    /// Human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            ApiError::AuthenticationRequired { message }
            | ApiError::PermissionDenied { message }
            | ApiError::NotFound { message }
            | ApiError::ValidationFailed { message, .. }
            | ApiError::RateLimited { message, .. }
            | ApiError::ServerError { message, .. }
            | ApiError::ServiceUnavailable { message }
            | ApiError::NetworkFailure { message }
            | ApiError::UploadRejected { message }
            | ApiError::ClientError { message, .. }
            | ApiError::InvalidRequest { message }
            | ApiError::InvalidResponse { message } => message,
        }
    }

    /// Field-level messages, present only for `ValidationFailed`.
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            ApiError::ValidationFailed { field_errors, .. } => Some(field_errors),
            _ => None,
        }
    }

    /// Server-suggested delay in seconds, present only for `RateLimited`.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True for server-side 422s and client-side upload rejections alike.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ApiError::ValidationFailed { .. } | ApiError::UploadRejected { .. }
        )
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<console_auth::Error> for ApiError {
    fn from(err: console_auth::Error) -> Self {
        use console_auth::Error;
        match err {
            Error::Http(message) => ApiError::NetworkFailure { message },
            Error::InvalidCredentials(message) | Error::AuthenticationRequired(message) => {
                ApiError::AuthenticationRequired { message }
            }
            Error::Status { status, body } => crate::classify::classify_failure(status, &body, None),
            other => ApiError::InvalidResponse {
                message: other.to_string(),
            },
        }
    }
}

/// Result alias for API calls.
pub type Result<T> = std::result::Result<T, ApiError>;
