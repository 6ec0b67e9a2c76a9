//! Login and renewal exchanges against the auth endpoints
//!
//! Both POST a JSON body and receive the same token response shape. They go
//! straight to the transport: no credential is attached and no retry policy
//! applies. Renewal concurrency is the coordinator's concern, not this
//! module's.

use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::constants::{LOGIN_PATH, REFRESH_PATH};
use crate::error::{Error, Result};

/// Response from the login and refresh endpoints.
///
/// `expires_in` is a delta in seconds; the store converts it to an absolute
/// expiry. `refresh_token` is always present on login and present on renewal
/// only when the server rotates it.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "bearer".into()
}

/// Join the configured base URL and an endpoint path.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Exchange a username and password for a token pair.
pub async fn login(
    client: &reqwest::Client,
    base_url: &str,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint(base_url, LOGIN_PATH))
        .json(&serde_json::json!({
            "username": username,
            "password": password,
        }))
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    let token = read_token_response(response, "login").await?;
    if token.refresh_token.is_none() {
        return Err(Error::TokenExchange(
            "login response did not include a refresh token".into(),
        ));
    }
    Ok(token)
}

/// Obtain a new access token using the stored refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint(base_url, REFRESH_PATH))
        .json(&serde_json::json!({ "refresh_token": refresh }))
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    read_token_response(response, "token refresh").await
}

async fn read_token_response(response: reqwest::Response, what: &str) -> Result<TokenResponse> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 401/403 means the password or refresh token was rejected
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "{what} rejected ({status}): {body}"
            )));
        }

        return Err(Error::Status {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid {what} response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::post;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn start_server(router: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn token_response_deserializes_full() {
        let json = r#"{"access_token":"at_abc","token_type":"bearer","refresh_token":"rt_def","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token.expose(), "at_abc");
        assert_eq!(token.refresh_token.unwrap().expose(), "rt_def");
        assert_eq!(token.expires_in, Some(3600));
    }

    #[test]
    fn token_response_optional_fields_default() {
        let json = r#"{"access_token":"at_only"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.token_type, "bearer");
        assert!(token.refresh_token.is_none());
        assert!(token.expires_in.is_none());
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("https://console.test/api/v1/", "/auth/refresh"),
            "https://console.test/api/v1/auth/refresh"
        );
        assert_eq!(
            endpoint("https://console.test/api/v1", "findings"),
            "https://console.test/api/v1/findings"
        );
    }

    #[tokio::test]
    async fn refresh_posts_refresh_token_as_json() {
        let router = axum::Router::new().route(
            "/auth/refresh",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["refresh_token"], "rt_current");
                Json(serde_json::json!({
                    "access_token": "at_new",
                    "token_type": "bearer",
                    "expires_in": 900,
                }))
            }),
        );
        let base = start_server(router).await;

        let token = refresh_token(&reqwest::Client::new(), &base, "rt_current", TIMEOUT)
            .await
            .unwrap();
        assert_eq!(token.access_token.expose(), "at_new");
        assert_eq!(token.expires_in, Some(900));
    }

    #[tokio::test]
    async fn refresh_401_is_invalid_credentials() {
        let router = axum::Router::new().route(
            "/auth/refresh",
            post(|| async { (StatusCode::UNAUTHORIZED, "refresh token revoked") }),
        );
        let base = start_server(router).await;

        let err = refresh_token(&reqwest::Client::new(), &base, "rt_revoked", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn refresh_500_keeps_status_and_body() {
        let router = axum::Router::new().route(
            "/auth/refresh",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = start_server(router).await;

        let err = refresh_token(&reqwest::Client::new(), &base, "rt", TIMEOUT)
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Status { status: 500, ref body } if body == "boom"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn refresh_against_dead_server_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = refresh_token(
            &reqwest::Client::new(),
            &format!("http://{addr}"),
            "rt",
            TIMEOUT,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn login_requires_refresh_token() {
        let router = axum::Router::new().route(
            "/auth/login",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["username"], "analyst");
                assert_eq!(body["password"], "hunter2");
                Json(serde_json::json!({ "access_token": "at_only" }))
            }),
        );
        let base = start_server(router).await;

        let err = login(&reqwest::Client::new(), &base, "analyst", "hunter2", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExchange(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn login_returns_token_pair() {
        let router = axum::Router::new().route(
            "/auth/login",
            post(|| async {
                Json(serde_json::json!({
                    "access_token": "A1",
                    "refresh_token": "R1",
                    "token_type": "bearer",
                    "expires_in": 3600,
                }))
            }),
        );
        let base = start_server(router).await;

        let token = login(&reqwest::Client::new(), &base, "analyst", "pw", TIMEOUT)
            .await
            .unwrap();
        assert_eq!(token.access_token.expose(), "A1");
        assert_eq!(token.refresh_token.unwrap().expose(), "R1");
    }
}
