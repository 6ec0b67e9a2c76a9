//! Request executor
//!
//! Turns a `RequestDescriptor` into an authenticated, time-bounded and retried
//! exchange. One logical call runs its attempts strictly in sequence:
//!
//! 1. `RefreshCoordinator::ensure_fresh()`, then attach the bearer token
//! 2. Send, racing the attempt deadline (expiry counts as a network failure)
//! 3. Classify the response
//! 4. 2xx returns the payload; 401 clears the store and returns at once
//! 5. Otherwise ask the `RetryPolicy`, sleep and start again from step 1,
//!    since the credential may have changed in the meantime

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use console_auth::{Credential, CredentialStore, RefreshCoordinator, endpoint, now_millis};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::classify::{ensure_success, parse_payload};
use crate::error::{ApiError, Result};
use crate::metrics;
use crate::request::RequestDescriptor;
use crate::retry::RetryPolicy;
use crate::upload::UploadPolicy;

/// Sent on POST and PATCH, identical across every retry of one logical call.
pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

const JSON: &str = "application/json";

/// Executor configuration. Defaults: 30 second attempt timeout, the default
/// retry policy and the default upload policy.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// All request paths are relative to this URL.
    pub base_url: String,
    /// Per-attempt deadline.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub upload: UploadPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            upload: UploadPolicy::default(),
        }
    }
}

/// Passed to the retry hook before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub method: Method,
    pub path: String,
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub error: ApiError,
    pub delay: Duration,
}

pub type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Undecoded successful response.
pub(crate) struct RawResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Client for the console API.
///
/// Cheap to clone; clones share the credential store, the renewal
/// coordinator and the connection pool.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    coordinator: RefreshCoordinator,
    retry_hook: Option<RetryHook>,
}

impl ApiClient {
    pub fn new(config: ClientConfig, store: Arc<CredentialStore>) -> Self {
        Self::with_http_client(config, store, reqwest::Client::new())
    }

    pub fn with_http_client(
        config: ClientConfig,
        store: Arc<CredentialStore>,
        http: reqwest::Client,
    ) -> Self {
        let coordinator =
            RefreshCoordinator::new(store, http.clone(), config.base_url.clone(), config.timeout);
        Self {
            http,
            config: Arc::new(config),
            coordinator,
            retry_hook: None,
        }
    }

    /// Observe every retry before its delay starts.
    pub fn with_retry_hook(mut self, hook: impl Fn(&RetryEvent) + Send + Sync + 'static) -> Self {
        self.retry_hook = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Exchange a username and password for a token pair and store it.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let token = console_auth::login(
            &self.http,
            &self.config.base_url,
            username,
            password,
            self.config.timeout,
        )
        .await?;
        let Some(refresh) = token.refresh_token else {
            return Err(ApiError::InvalidResponse {
                message: "login response did not include a refresh token".into(),
            });
        };
        self.store()
            .replace(Credential::with_ttl(
                token.access_token,
                refresh,
                token.expires_in,
                now_millis(),
            ))
            .await;
        info!(username, "logged in");
        Ok(())
    }

    /// Forget the stored credential.
    pub async fn logout(&self) {
        self.store().clear().await;
        info!("logged out");
    }

    /// Run one logical call and return its JSON payload.
    ///
    /// Empty success bodies yield `Value::Null`; non-JSON bodies a string.
    #[instrument(skip_all, fields(method = %descriptor.method, path = %descriptor.path))]
    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<Value> {
        let started = Instant::now();
        let result = self
            .execute_raw(&descriptor)
            .await
            .map(|raw| parse_payload(&String::from_utf8_lossy(&raw.body)));
        metrics::record_request(
            descriptor.method.as_str(),
            metrics::outcome(&result),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Run one logical call and decode its payload into `T`.
    pub async fn execute_json<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T> {
        decode(self.execute(descriptor).await?)
    }

    pub async fn get(&self, path: &str, params: Option<&Value>) -> Result<Value> {
        let mut descriptor = RequestDescriptor::get(path);
        if let Some(params) = params {
            descriptor = descriptor.query(params);
        }
        self.execute(descriptor).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.execute(RequestDescriptor::post(path).body(encode(body)?))
            .await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.execute(RequestDescriptor::put(path).body(encode(body)?))
            .await
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.execute(RequestDescriptor::patch(path).body(encode(body)?))
            .await
    }

    /// DELETE, optionally with a body (bulk deletes send the ids this way).
    pub async fn delete(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        let mut descriptor = RequestDescriptor::delete(path);
        if let Some(body) = body {
            descriptor = descriptor.body(body.clone());
        }
        self.execute(descriptor).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, params: Option<&Value>) -> Result<T> {
        decode(self.get(path, params).await?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        decode(self.post(path, body).await?)
    }

    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        decode(self.put(path, body).await?)
    }

    pub async fn patch_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        decode(self.patch(path, body).await?)
    }

    /// Shared by `execute` and `download`: descriptor in, undecoded 2xx out.
    pub(crate) async fn execute_raw(&self, descriptor: &RequestDescriptor) -> Result<RawResponse> {
        let mut headers = descriptor.headers.clone();
        if headers.remove(AUTHORIZATION).is_some() {
            warn!("refusing to overwrite authorization header");
        }
        if !descriptor.is_idempotent() && !headers.contains_key(IDEMPOTENCY_KEY) {
            let key = HeaderValue::from_str(&Uuid::new_v4().to_string()).map_err(|e| {
                ApiError::InvalidRequest {
                    message: format!("idempotency key: {e}"),
                }
            })?;
            headers.insert(IDEMPOTENCY_KEY, key);
        }

        let timeout = descriptor.timeout.unwrap_or(self.config.timeout);
        self.dispatch(
            &descriptor.method,
            &descriptor.path,
            &self.config.retry,
            timeout,
            |request| {
                let mut request = request
                    .header(CONTENT_TYPE, JSON)
                    .headers(headers.clone());
                if !descriptor.query.is_empty() {
                    request = request.query(&descriptor.query);
                }
                if let Some(body) = &descriptor.body {
                    request = request.json(body);
                }
                Ok(request)
            },
        )
        .await
    }

    /// The attempt loop.
    ///
    /// `build` finishes each attempt's request after the bearer and `Accept`
    /// headers are set; it runs once per attempt so bodies that cannot be
    /// cloned (multipart streams) are rebuilt every time.
    pub(crate) async fn dispatch<F>(
        &self,
        method: &Method,
        path: &str,
        policy: &RetryPolicy,
        timeout: Duration,
        mut build: F,
    ) -> Result<RawResponse>
    where
        F: FnMut(RequestBuilder) -> Result<RequestBuilder>,
    {
        let url = endpoint(&self.config.base_url, path);
        let mut attempt = 0u32;

        loop {
            // A failed renewal has already cleared the store
            let credential = self.coordinator.ensure_fresh().await?;

            let err = match self
                .attempt(method, &url, timeout, credential.as_ref(), &mut build)
                .await
            {
                Ok(raw) => return Ok(raw),
                Err(e) => e,
            };

            if let ApiError::AuthenticationRequired { .. } = err {
                // Server-side 401: never retried, and the credential is gone for every caller
                self.store().clear().await;
                return Err(err);
            }

            let decision = policy.should_retry(attempt, &err);
            if !decision.retry {
                debug!(attempt = attempt + 1, kind = err.kind().label(), "giving up");
                return Err(err);
            }

            attempt += 1;
            warn!(
                %method,
                path,
                attempt,
                kind = err.kind().label(),
                delay_ms = decision.delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            metrics::record_retry(&err);
            if let Some(hook) = &self.retry_hook {
                hook(&RetryEvent {
                    method: method.clone(),
                    path: path.to_string(),
                    attempt,
                    error: err,
                    delay: decision.delay,
                });
            }
            tokio::time::sleep(decision.delay).await;
        }
    }

    async fn attempt<F>(
        &self,
        method: &Method,
        url: &str,
        timeout: Duration,
        credential: Option<&Credential>,
        build: &mut F,
    ) -> Result<RawResponse>
    where
        F: FnMut(RequestBuilder) -> Result<RequestBuilder>,
    {
        let mut request = self.http.request(method.clone(), url).header(ACCEPT, JSON);
        if let Some(credential) = credential {
            request = request.bearer_auth(credential.access_token.expose());
        }
        let request = build(request)?;

        let exchange = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        // The timer is dropped with the future on either path.
        let (status, headers, body) = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => {
                return Err(ApiError::NetworkFailure {
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ApiError::NetworkFailure {
                    message: format!("no response within {}ms", timeout.as_millis()),
                });
            }
        };

        debug!(status, bytes = body.len(), "attempt completed");
        ensure_success(status, &headers, &body)?;
        Ok(RawResponse { headers, body })
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Value> {
    serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest {
        message: format!("request body: {e}"),
    })
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| ApiError::InvalidResponse {
        message: format!("unexpected payload: {e}"),
    })
}
