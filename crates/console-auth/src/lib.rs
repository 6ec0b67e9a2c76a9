//! Credential management for the pentest console API
//!
//! Owns the single credential record (access token, refresh token, expiry),
//! its durable persistence, the login/renewal exchanges against the auth
//! endpoints, and the coordinator that keeps renewal single-flight across any
//! number of concurrent callers.
//!
//! Credential flow:
//! 1. `token::login()` exchanges username/password for a token pair
//! 2. The pair is stored via `CredentialStore::set()` and persisted by the backend
//! 3. Every request calls `RefreshCoordinator::ensure_fresh()` first
//! 4. Inside the near-expiry buffer the coordinator runs one `token::refresh_token()`
//!    exchange and shares its outcome with every caller that arrived meanwhile
//! 5. A failed renewal or a fatal 401 clears the store

pub mod constants;
pub mod credentials;
pub mod error;
pub mod refresh;
pub mod token;

pub use constants::*;
pub use credentials::{
    Credential, CredentialBackend, CredentialStore, FileBackend, MemoryBackend, now_millis,
};
pub use error::{Error, Result};
pub use refresh::RefreshCoordinator;
pub use token::{TokenResponse, endpoint, login, refresh_token};
