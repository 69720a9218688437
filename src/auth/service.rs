//! Remote auth service client.
//!
//! # Responsibilities
//! - Exchange a refresh token for a fresh credential
//! - Map HTTP and transport failures onto `{name, message}` errors so they
//!   classify the same way as the service's own error bodies

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::auth::types::{AuthServiceError, Credential};
use crate::clock::epoch_millis;
use crate::config::AuthConfig;

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthServiceError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    client_id: &'a str,
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    expires_at: Option<u64>,
    /// Seconds from now; used when `expires_at` is absent.
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "__type")]
    type_name: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// JSON-over-HTTP refresh endpoint.
#[derive(Debug, Clone)]
pub struct HttpAuthService {
    client: reqwest::Client,
    refresh_url: String,
    client_id: String,
}

impl HttpAuthService {
    pub fn new(config: &AuthConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            refresh_url: config.refresh_url.clone(),
            client_id: config.client_id.clone(),
        })
    }
}

fn status_error_name(status: StatusCode) -> &'static str {
    match status {
        StatusCode::TOO_MANY_REQUESTS => "TooManyRequestsException",
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "NotAuthorizedException",
        StatusCode::NOT_FOUND => "ResourceNotFoundException",
        s if s.is_server_error() => "InternalErrorException",
        _ => "HttpError",
    }
}

fn transport_error(e: reqwest::Error) -> AuthServiceError {
    if e.is_timeout() {
        AuthServiceError::new("TimeoutError", e.to_string())
    } else {
        AuthServiceError::new("NetworkError", e.to_string())
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthServiceError> {
        let response = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest {
                client_id: &self.client_id,
                refresh_token,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            let name = body
                .name
                .or(body.type_name)
                .unwrap_or_else(|| status_error_name(status).to_string());
            let message = body
                .message
                .unwrap_or_else(|| format!("refresh failed with status {status}"));
            tracing::warn!(status = %status, error = %name, "Token refresh rejected");
            return Err(AuthServiceError::new(name, message));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthServiceError::new("InvalidResponse", e.to_string()))?;

        let expires_at = body
            .expires_at
            .or_else(|| body.expires_in.map(|secs| epoch_millis() + secs * 1000))
            .ok_or_else(|| AuthServiceError::new("InvalidResponse", "response carries no expiry"))?;

        Ok(Credential {
            access_token: body.access_token,
            id_token: body.id_token,
            // Services that do not rotate refresh tokens omit it.
            refresh_token: body.refresh_token.or_else(|| Some(refresh_token.to_string())),
            expires_at,
        })
    }
}
