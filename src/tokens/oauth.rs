//! OAuth token endpoint client.
//!
//! Handles `grant_type=refresh_token` and `grant_type=authorization_code`
//! requests. Failures keep the HTTP status and the OAuth `error` code so the
//! token manager can classify them without parsing message text.

use crate::config::{ClientAuthStyle, GridlinkConfig, ProviderSettings};
use crate::error::is_reauth_failure;
use crate::provider::Provider;
use crate::retry::{RetryClass, Retryable};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Tokens issued by a provider's token endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present only when the provider issued (or rotated) a refresh token.
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
}

impl TokenGrant {
    /// Absolute expiry, or `None` when the provider did not say.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in.map(|secs| now + Duration::seconds(secs))
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(r: TokenResponse) -> Self {
        Self {
            access_token: r.access_token,
            refresh_token: r.refresh_token,
            expires_in: r.expires_in,
            scope: r.scope,
        }
    }
}

/// A failed token endpoint call.
///
/// `status` is `None` for transport failures (timeouts, connection errors).
#[derive(Clone, Debug, Error)]
#[error("{description}")]
pub struct RefreshFailure {
    pub status: Option<u16>,
    /// OAuth `error` field, e.g. `invalid_grant`.
    pub error_code: Option<String>,
    pub description: String,
}

impl RefreshFailure {
    pub fn transport(description: impl Into<String>) -> Self {
        Self {
            status: None,
            error_code: None,
            description: description.into(),
        }
    }

    /// Builds a failure from an error response body.
    pub fn from_response(status: u16, body: &str) -> Self {
        let (error_code, detail) = parse_error_body(body);
        let description = match (&error_code, detail) {
            (Some(code), Some(detail)) => format!("{}: {}", code, detail),
            (Some(code), None) => code.clone(),
            (None, Some(detail)) => detail,
            (None, None) => format!("token endpoint returned status {}", status),
        };
        Self {
            status: Some(status),
            error_code,
            description,
        }
    }

    /// True if the refresh token is permanently unusable.
    pub fn requires_reauth(&self) -> bool {
        is_reauth_failure(self.status, self.error_code.as_deref())
    }
}

impl Retryable for RefreshFailure {
    fn retry_class(&self) -> RetryClass {
        if self.requires_reauth() {
            RetryClass::Auth
        } else {
            RetryClass::Retry
        }
    }
}

/// Extracts the OAuth error code and description.
///
/// Handles both `{"error": "invalid_grant", "error_description": "..."}` and
/// `{"error": {"status": "...", "message": "..."}}`.
fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        let trimmed = body.trim();
        return (None, (!trimmed.is_empty()).then(|| trimmed.to_string()));
    };

    match value.get("error") {
        Some(serde_json::Value::String(code)) => {
            let description = value
                .get("error_description")
                .and_then(|d| d.as_str())
                .map(str::to_string);
            (Some(code.clone()), description)
        }
        Some(serde_json::Value::Object(obj)) => {
            let code = obj
                .get("status")
                .or_else(|| obj.get("type"))
                .and_then(|c| c.as_str())
                .map(str::to_string);
            let message = obj.get("message").and_then(|m| m.as_str()).map(str::to_string);
            (code, message)
        }
        _ => (None, None),
    }
}

/// Talks to provider token endpoints.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchanges a refresh token for a new access token.
    async fn refresh(&self, provider: Provider, refresh_token: &str) -> Result<TokenGrant, RefreshFailure>;

    /// Exchanges an authorization code from the consent redirect.
    async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, RefreshFailure>;
}

/// [`TokenRefresher`] over HTTP.
pub struct OAuthClient {
    http_client: reqwest::Client,
    providers: HashMap<Provider, ProviderSettings>,
}

impl OAuthClient {
    pub fn new(config: &GridlinkConfig) -> crate::Result<Self> {
        let providers = Provider::ALL
            .into_iter()
            .map(|p| (p, config.provider(p)))
            .collect();
        Self::with_settings(providers)
    }

    /// Creates a client with explicit per-provider settings (e.g. a mock token URL).
    pub fn with_settings(providers: HashMap<Provider, ProviderSettings>) -> crate::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self {
            http_client,
            providers,
        })
    }

    async fn request_token(
        &self,
        provider: Provider,
        mut form: Vec<(&str, String)>,
    ) -> Result<TokenGrant, RefreshFailure> {
        let settings = self.providers.get(&provider).ok_or_else(|| {
            RefreshFailure::transport(format!("no OAuth settings for {}", provider))
        })?;

        let mut request = self
            .http_client
            .post(&settings.token_url)
            .header("Accept", "application/json");

        match settings.client_auth {
            ClientAuthStyle::RequestBody => {
                form.push(("client_id", settings.client_id.clone()));
                form.push(("client_secret", settings.client_secret.clone()));
            }
            ClientAuthStyle::BasicAuth => {
                request = request.basic_auth(&settings.client_id, Some(&settings.client_secret));
            }
        }

        debug!(provider = %provider, token_url = %settings.token_url, "Calling token endpoint");

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshFailure::transport(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(RefreshFailure::from_response(status.as_u16(), &body));
        }

        let token_response: TokenResponse = response.json().await.map_err(|e| {
            RefreshFailure::transport(format!("failed to parse token response: {}", e))
        })?;

        debug!(
            provider = %provider,
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token endpoint call succeeded"
        );

        Ok(token_response.into())
    }
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(&self, provider: Provider, refresh_token: &str) -> Result<TokenGrant, RefreshFailure> {
        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        self.request_token(provider, form).await
    }

    async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, RefreshFailure> {
        let form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
        ];
        self.request_token(provider, form).await
    }
}
