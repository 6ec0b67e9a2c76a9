//! Retry policy
//!
//! A pure function of (attempt number, classified error). It holds no state
//! and performs no I/O; the executor owns the attempt counter and the sleep.

use std::time::Duration;

use crate::error::ApiError;

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Bounded exponential backoff with server-directed delays for rate limits.
///
/// `max_retries` counts retries, not attempts: the default of 3 allows four
/// attempts in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Smaller budget for uploads, where every retry re-sends the payload.
    pub fn uploads() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    /// Decide whether attempt `attempt` (0-based) should be followed by another.
    ///
    /// Rules, in order: the budget is exhausted; the error is not transient
    /// (every 4xx except 429, auth, client-side rejections); a rate limit with
    /// a server hint waits exactly that long; everything else backs off
    /// exponentially.
    pub fn should_retry(&self, attempt: u32, err: &ApiError) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::stop();
        }
        if !err.is_transient() {
            return RetryDecision::stop();
        }
        if let ApiError::RateLimited {
            retry_after: Some(seconds),
            ..
        } = err
        {
            return RetryDecision::after(Duration::from_secs(*seconds));
        }
        RetryDecision::after(self.backoff(attempt))
    }

    /// `min(initial_delay * 2^attempt, max_delay)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldErrors;

    fn server_error() -> ApiError {
        ApiError::ServerError {
            status: 500,
            message: "boom".into(),
        }
    }

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(10_000));
        assert_eq!(RetryPolicy::uploads().max_retries, 1);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff(4), Duration::from_millis(10_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(10_000));
    }

    #[test]
    fn budget_allows_four_attempts() {
        let policy = RetryPolicy::default();
        let err = server_error();
        let attempts = (0..)
            .take_while(|attempt| policy.should_retry(*attempt, &err).retry)
            .count()
            + 1;
        assert_eq!(attempts, 4);
        assert!(!policy.should_retry(3, &err).retry);
    }

    #[test]
    fn transient_kinds_back_off() {
        let policy = RetryPolicy::default();
        for err in [
            server_error(),
            ApiError::ServiceUnavailable {
                message: "maintenance".into(),
            },
            ApiError::NetworkFailure {
                message: "timed out".into(),
            },
            ApiError::RateLimited {
                message: "slow".into(),
                retry_after: None,
            },
        ] {
            let decision = policy.should_retry(1, &err);
            assert!(decision.retry, "{err:?} should retry");
            assert_eq!(decision.delay, Duration::from_millis(2000));
        }
    }

    #[test]
    fn client_errors_never_retry() {
        let policy = RetryPolicy::default();
        for err in [
            ApiError::NotFound {
                message: "gone".into(),
            },
            ApiError::ValidationFailed {
                message: "bad".into(),
                field_errors: FieldErrors::new(),
            },
            ApiError::PermissionDenied {
                message: "no".into(),
            },
            ApiError::ClientError {
                status: 400,
                message: "bad request".into(),
            },
            ApiError::AuthenticationRequired {
                message: "expired".into(),
            },
            ApiError::UploadRejected {
                message: "too big".into(),
            },
        ] {
            assert!(!policy.should_retry(0, &err).retry, "{err:?} must not retry");
        }
    }

    #[test]
    fn rate_limit_uses_server_delay() {
        let policy = RetryPolicy::default();
        let err = ApiError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(7),
        };
        let decision = policy.should_retry(0, &err);
        assert!(decision.retry);
        assert_eq!(decision.delay, Duration::from_millis(7000));

        // Not capped by max_delay either
        let err = ApiError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(60),
        };
        assert_eq!(policy.should_retry(2, &err).delay, Duration::from_secs(60));
    }

    #[test]
    fn rate_limit_still_bounded_by_budget() {
        let policy = RetryPolicy::default();
        let err = ApiError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(1),
        };
        assert!(!policy.should_retry(3, &err).retry);
    }
}
