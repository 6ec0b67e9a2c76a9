//! Auth endpoint paths and timing constants
//!
//! Paths are relative to the API base URL configured at startup.

use std::time::Duration;

/// Renewal exchange endpoint
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Username/password login endpoint
pub const LOGIN_PATH: &str = "/auth/login";

/// Safety margin before expiry during which renewal is triggered proactively.
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(5 * 60);
