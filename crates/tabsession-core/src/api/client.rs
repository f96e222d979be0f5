//! Client for the authentication endpoints.
//!
//! The server issues an access/refresh pair from `POST /auth/token/` and a
//! fresh access token from `POST /auth/token/refresh/`. Token issuance itself
//! is the server's business; this client only carries the pair home.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ApiError, HttpTransport};
use crate::auth::CredentialPair;

// ============================================================================
// Constants
// ============================================================================

const TOKEN_PATH: &str = "/auth/token/";
const REFRESH_PATH: &str = "/auth/token/refresh/";
const REGISTER_PATH: &str = "/users/register/";

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenPairResponse {
    access: String,
    refresh: String,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    username: &'a str,
    email: Option<&'a str>,
    password: &'a str,
}

/// The two endpoints the session core needs from the authentication server.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange a username and password for a credential pair.
    async fn login(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<String, ApiError>;
}

/// API client for the authentication server.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    base_url: String,
}

impl AuthClient {
    /// Create a new client for the API rooted at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// A transport for protected requests, sharing this client's connection pool.
    pub fn transport(&self) -> HttpTransport {
        HttpTransport::new(self.client.clone(), self.base_url.clone())
    }

    /// Create an account. Registration does not log in.
    pub async fn register(
        &self,
        username: &str,
        email: Option<&str>,
        password: &str,
    ) -> Result<Value, ApiError> {
        let body = RegisterRequest {
            username,
            email,
            password,
        };
        let response = self
            .client
            .post(self.url(REGISTER_PATH))
            .json(&body)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        Ok(response.json().await?)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status.as_u16(), &body))
        }
    }
}

#[async_trait]
impl AuthBackend for AuthClient {
    async fn login(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError> {
        let response = self
            .client
            .post(self.url(TOKEN_PATH))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let response = Self::check_response(response).await.map_err(|e| {
            warn!(error = %e, "Authentication rejected");
            e
        })?;

        let tokens: TokenPairResponse = response.json().await?;
        if tokens.access.is_empty() || tokens.refresh.is_empty() {
            return Err(ApiError::InvalidResponse("Login returned an empty token".to_string()));
        }
        debug!("Authentication succeeded");
        Ok(CredentialPair::new(tokens.access, tokens.refresh))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, ApiError> {
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let refreshed: RefreshResponse = response.json().await?;
        if refreshed.access.is_empty() {
            return Err(ApiError::InvalidResponse("Refresh returned an empty access token".to_string()));
        }
        Ok(refreshed.access)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::Server) -> AuthClient {
        AuthClient::new(server.url(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_login_returns_pair() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/token/")
            .match_body(Matcher::Json(serde_json::json!({
                "username": "alice",
                "password": "hunter2"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access":"a1","refresh":"r1"}"#)
            .create_async()
            .await;

        let pair = client_for(&server).login("alice", "hunter2").await.unwrap();

        mock.assert_async().await;
        assert_eq!(pair, CredentialPair::new("a1", "r1"));
    }

    #[tokio::test]
    async fn test_login_rejected_maps_to_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/token/")
            .with_status(401)
            .with_body(r#"{"detail":"No active account found with the given credentials"}"#)
            .create_async()
            .await;

        let err = client_for(&server).login("alice", "wrong").await.unwrap_err();
        assert_eq!(err, ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn test_login_with_empty_token_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/token/")
            .with_status(200)
            .with_body(r#"{"access":"","refresh":"r1"}"#)
            .create_async()
            .await;

        let err = client_for(&server).login("alice", "hunter2").await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_refresh_returns_access_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/token/refresh/")
            .match_body(Matcher::Json(serde_json::json!({"refresh": "r1"})))
            .with_status(200)
            .with_body(r#"{"access":"a2"}"#)
            .create_async()
            .await;

        let access = client_for(&server).refresh("r1").await.unwrap();
        assert_eq!(access, "a2");
    }

    #[tokio::test]
    async fn test_refresh_with_expired_token_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/token/refresh/")
            .with_status(401)
            .with_body(r#"{"detail":"Token is invalid or expired","code":"token_not_valid"}"#)
            .create_async()
            .await;

        let err = client_for(&server).refresh("stale").await.unwrap_err();
        assert_eq!(err, ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn test_register_surfaces_validation_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/users/register/")
            .with_status(400)
            .with_body(r#"{"username":["A user with that username already exists."]}"#)
            .create_async()
            .await;

        let err = client_for(&server)
            .register("alice", None, "hunter2")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(body) if body.contains("already exists")));
    }
}
