//! Error types for credential operations

/// Errors from login, renewal and credential persistence.
///
/// `Clone` so that one renewal outcome can be handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("auth endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
