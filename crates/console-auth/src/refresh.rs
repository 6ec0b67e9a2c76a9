//! Single-flight credential renewal
//!
//! Any number of requests may discover at the same moment that the access
//! token is inside the expiry buffer. Only the first one starts a renewal
//! exchange; it parks a shared future in the in-flight slot and every later
//! caller awaits a clone of that same future. When the exchange finishes the
//! future empties the slot and resolves, so all of its holders observe one
//! outcome, the new credential or the same failure.
//!
//! The number of renewal exchanges is therefore bounded by the number of
//! expiry windows, not by the number of concurrent requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore, now_millis};
use crate::error::{Error, Result};
use crate::token;

type Renewal = Shared<BoxFuture<'static, Result<Credential>>>;

/// Coordinates renewal of the shared credential.
///
/// Cheap to clone; clones share the in-flight slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CredentialStore>,
    http_client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    in_flight: Mutex<Option<Renewal>>,
    exchanges: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                http_client,
                base_url: base_url.into(),
                timeout,
                in_flight: Mutex::new(None),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// The store this coordinator renews.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    /// Number of renewal exchanges issued so far.
    pub fn exchanges(&self) -> u64 {
        self.inner.exchanges.load(Ordering::Relaxed)
    }

    /// Return a credential that is not inside the expiry buffer.
    ///
    /// Returns the stored credential untouched (possibly `None` when signed
    /// out) unless it is near expiry. Otherwise joins the in-flight renewal or
    /// starts one. A failed renewal clears the store and yields
    /// `AuthenticationRequired` to every caller that joined it.
    pub async fn ensure_fresh(&self) -> Result<Option<Credential>> {
        if !self.inner.store.is_near_expiry().await {
            return Ok(self.inner.store.get().await);
        }

        let renewal = {
            let mut slot = self.inner.in_flight.lock().await;
            match slot.as_ref() {
                Some(renewal) => {
                    debug!("renewal already in flight, waiting for it");
                    renewal.clone()
                }
                None => {
                    // A renewal may have completed between the first check and
                    // taking the slot.
                    if !self.inner.store.is_near_expiry().await {
                        return Ok(self.inner.store.get().await);
                    }
                    let renewal = Inner::renew(self.inner.clone()).boxed().shared();
                    *slot = Some(renewal.clone());
                    renewal
                }
            }
        };

        renewal.await.map(Some)
    }
}

impl Inner {
    /// Run one exchange, then empty the slot before any holder sees the result.
    async fn renew(self: Arc<Self>) -> Result<Credential> {
        let outcome = self.exchange().await;
        *self.in_flight.lock().await = None;
        outcome
    }

    async fn exchange(&self) -> Result<Credential> {
        let Some(current) = self.store.get().await else {
            return Err(Error::AuthenticationRequired(
                "no credential stored to renew".into(),
            ));
        };

        self.exchanges.fetch_add(1, Ordering::Relaxed);
        debug!("access token near expiry, renewing");

        match token::refresh_token(
            &self.http_client,
            &self.base_url,
            current.refresh_token.expose(),
            self.timeout,
        )
        .await
        {
            Ok(response) => {
                let refresh = response.refresh_token.unwrap_or(current.refresh_token);
                let renewed = Credential::with_ttl(
                    response.access_token,
                    refresh,
                    response.expires_in,
                    now_millis(),
                );
                self.store.replace(renewed.clone()).await;
                metrics::counter!("console_api_refresh_total", "outcome" => "success")
                    .increment(1);
                info!(expires_at = ?renewed.expires_at, "credential renewed");
                Ok(renewed)
            }
            Err(e) => {
                warn!(error = %e, "credential renewal failed, signing out");
                self.store.clear().await;
                metrics::counter!("console_api_refresh_total", "outcome" => "failure")
                    .increment(1);
                Err(Error::AuthenticationRequired(format!(
                    "credential renewal failed: {e}"
                )))
            }
        }
    }
}
