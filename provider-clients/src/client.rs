//! Shared request pipeline for provider data APIs.
//!
//! Every call resolves a Bearer token through the [`TokenManager`], then sends
//! the request through the provider's [`RateLimiter`](gridlink::RateLimiter).
//! The whole sequence is one attempt of the [`RetryPolicy`], so a backoff
//! sleep never holds a place in the dispatch queue.

use gridlink::error::classify;
use gridlink::{
    Error, GridlinkConfig, Provider, ProviderApiError, RateLimiterRegistry, Result, RetryPolicy,
    TokenManager,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// One page of a cursor-paginated listing.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page; `None` on the last page.
    pub next: Option<String>,
}

/// Fetches pages until the cursor runs out or `max_results` items are collected.
///
/// `fetch_page` receives `None` for the first page and the previous page's
/// cursor afterwards.
pub async fn paginate<T, F, Fut>(max_results: Option<usize>, mut fetch_page: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut cursor = None;

    loop {
        let page = fetch_page(cursor.take()).await?;
        items.extend(page.items);

        if let Some(max) = max_results {
            if items.len() >= max {
                items.truncate(max);
                break;
            }
        }

        match page.next {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }

    Ok(items)
}

/// Authenticated, rate-limited, retried HTTP client for one provider.
pub struct ApiClient {
    provider: Provider,
    api_base_url: String,
    list_base_url: String,
    http_client: Client,
    tokens: Arc<TokenManager>,
    limiters: Arc<RateLimiterRegistry>,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        provider: Provider,
        tokens: Arc<TokenManager>,
        limiters: Arc<RateLimiterRegistry>,
        config: &GridlinkConfig,
    ) -> Result<Self> {
        let settings = config.provider(provider);
        let http_client = Client::builder()
            .user_agent("gridlink/0.1")
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Backend(e.into()))?;

        Ok(Self {
            provider,
            api_base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            list_base_url: settings.list_base_url.trim_end_matches('/').to_string(),
            http_client,
            tokens,
            limiters,
            retry: RetryPolicy::from_config(&config.retry),
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// `path` appended to the data API base URL.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }

    /// `path` appended to the listing/metadata base URL.
    pub fn list_url(&self, path: &str) -> String {
        format!("{}{}", self.list_base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, user_id: &str, url: &str) -> Result<T> {
        self.request(user_id, Method::GET, url, None).await
    }

    pub async fn post<T: DeserializeOwned>(&self, user_id: &str, url: &str, body: Value) -> Result<T> {
        self.request(user_id, Method::POST, url, Some(body)).await
    }

    pub async fn put<T: DeserializeOwned>(&self, user_id: &str, url: &str, body: Value) -> Result<T> {
        self.request(user_id, Method::PUT, url, Some(body)).await
    }

    pub async fn patch<T: DeserializeOwned>(&self, user_id: &str, url: &str, body: Value) -> Result<T> {
        self.request(user_id, Method::PATCH, url, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, user_id: &str, url: &str) -> Result<T> {
        self.request(user_id, Method::DELETE, url, None).await
    }

    /// Sends one logical request, retrying transient and quota failures.
    pub async fn request<T: DeserializeOwned>(
        &self,
        user_id: &str,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let provider = self.provider;
        let method = &method;
        let body = body.as_ref();

        let text = self
            .retry
            .run(|| async move {
                let token = self.tokens.get_valid_token(user_id, provider).await?;
                let mut request = self
                    .http_client
                    .request(method.clone(), url)
                    .bearer_auth(token)
                    .header("Accept", "application/json");
                if let Some(body) = body {
                    request = request.json(body);
                }

                debug!(provider = %provider, method = %method, url = %url, "Dispatching API request");
                self.limiters
                    .get(provider)
                    .execute(dispatch(provider, request))
                    .await
            })
            .await?;

        decode_body(provider, &text)
    }
}

/// Sends the request and returns the success body, or a classified error.
async fn dispatch(provider: Provider, request: RequestBuilder) -> Result<String> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderApiError::network(provider, format!("request failed: {}", e)))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ProviderApiError::network(provider, format!("failed to read body: {}", e)))?;

    if status.is_success() {
        Ok(text)
    } else {
        Err(Error::ProviderApi(decode_error(provider, status.as_u16(), text)))
    }
}

fn decode_body<T: DeserializeOwned>(provider: Provider, text: &str) -> Result<T> {
    let body = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(body).map_err(|e| {
        Error::ProviderApi(ProviderApiError::from_response(
            provider,
            200,
            Some("INVALID_RESPONSE".to_string()),
            format!("failed to decode response: {}", e),
            text.to_string(),
        ))
    })
}

/// Extracts the provider error code and message from an error body.
///
/// Handles Google's `{"error": {"code", "status", "message", "errors": [{"reason"}]}}`
/// and Airtable's `{"error": {"type", "message"}}` / `{"error": "NOT_FOUND"}`.
pub(crate) fn decode_error(provider: Provider, status: u16, raw_body: String) -> ProviderApiError {
    let parsed: Option<Value> = serde_json::from_str(&raw_body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let (code, message) = match error {
        Some(Value::String(code)) => (Some(code.clone()), None),
        Some(Value::Object(obj)) => {
            let code = obj
                .get("status")
                .or_else(|| obj.get("type"))
                .and_then(Value::as_str)
                .or_else(|| error.and_then(google_reason))
                .map(str::to_string);
            let message = obj.get("message").and_then(Value::as_str).map(str::to_string);
            (code, message)
        }
        _ => (None, None),
    };

    // Google 403s report quota exhaustion as PERMISSION_DENIED with a quota reason.
    let code = match error.and_then(google_reason) {
        Some(reason) if classify(None, Some(reason)).quota_error => Some(reason.to_string()),
        _ => code,
    };

    let message = message.unwrap_or_else(|| match &code {
        Some(code) => code.clone(),
        None => format!("request failed with status {}", status),
    });

    ProviderApiError::from_response(provider, status, code, message, raw_body)
}

fn google_reason(error: &Value) -> Option<&str> {
    error
        .get("errors")
        .and_then(|e| e.get(0))
        .and_then(|e| e.get("reason"))
        .and_then(Value::as_str)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{Duration, Utc};
    use gridlink::config::RateLimitConfig;
    use gridlink::credentials::Connection;
    use gridlink::{AesGcmCipher, Cipher, MemoryConnectionStore, OAuthClient};

    pub const USER: &str = "u1";
    pub const TOKEN: &str = "access-1";

    /// Config pointing both providers at `base_url` with fast retries.
    pub fn config(base_url: &str) -> GridlinkConfig {
        let mut config = GridlinkConfig::default();
        for provider in [&mut config.providers.google_sheets, &mut config.providers.airtable] {
            provider.api_base_url = Some(base_url.to_string());
            provider.list_base_url = Some(base_url.to_string());
        }
        config.retry.base_delay_ms = 10;
        config.retry.max_jitter_ms = 0;
        let fast = RateLimitConfig {
            requests_per_second: 1000,
            ..RateLimitConfig::default()
        };
        config.rate_limits.google_sheets = fast.clone();
        config.rate_limits.airtable = fast;
        config
    }

    /// Token manager holding a long-lived token for [`USER`] on `provider`.
    pub async fn tokens(config: &GridlinkConfig, provider: Provider) -> Arc<TokenManager> {
        let store = Arc::new(MemoryConnectionStore::new());
        let cipher = Arc::new(AesGcmCipher::from_bytes(&[3u8; 32]).unwrap());
        store
            .insert(Connection {
                user_id: USER.to_string(),
                provider,
                encrypted_access_token: cipher.encrypt(TOKEN).unwrap(),
                encrypted_refresh_token: Some(cipher.encrypt("refresh-1").unwrap()),
                expires_at: Some(Utc::now() + Duration::days(1)),
                needs_reauth: false,
                last_error: None,
                last_attempt_at: None,
            })
            .await;
        Arc::new(TokenManager::new(
            store,
            cipher,
            Arc::new(OAuthClient::new(config).unwrap()),
            config,
        ))
    }

    pub async fn client(base_url: &str, provider: Provider) -> ApiClient {
        let config = config(base_url);
        let tokens = tokens(&config, provider).await;
        let limiters = Arc::new(RateLimiterRegistry::new(config.rate_limits.clone()));
        ApiClient::new(provider, tokens, limiters, &config).unwrap()
    }
}
