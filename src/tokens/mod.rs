//! Token lifecycle: expiry checks, proactive refresh and the reauthorization state machine.
//!
//! ```text
//!            refresh ok
//!          ┌────────────┐
//!          ▼            │
//!      ┌────────┐ ──────┘       ┌─────────────┐
//!      │ Active │ ─────────────▶│ NeedsReauth │
//!      └────────┘  reauth error │             │
//!          ▲       or N × other └─────────────┘
//!          │                          │
//!          └──── connect / store_grant┘
//! ```
//!
//! `NeedsReauth` is terminal for this module: only a new consent (a fresh
//! grant written through [`TokenManager::connect`] or
//! [`TokenManager::store_grant`]) returns a connection to `Active`.

mod lock;
mod oauth;

pub use lock::{KeyedGuard, KeyedLock};
pub use oauth::{OAuthClient, RefreshFailure, TokenGrant, TokenRefresher};

use crate::config::{GridlinkConfig, ProviderSettings, TokenConfig};
use crate::credentials::{Cipher, Connection, ConnectionStore, ConnectionUpdate};
use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Reauthorization state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    NeedsReauth,
    Disconnected,
}

/// Snapshot of a connection for status displays. Never includes tokens.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub provider: Provider,
    pub state: ConnectionState,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Retry options for [`TokenManager::with_token`].
#[derive(Clone, Debug)]
pub struct WithTokenOptions {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub retry_delay: std::time::Duration,
    pub exponential_backoff: bool,
}

impl Default for WithTokenOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: std::time::Duration::from_millis(1000),
            exponential_backoff: true,
        }
    }
}

/// Keeps each user's provider credentials valid.
///
/// Concurrent refreshes of one (user, provider) pair are serialized; the
/// second caller re-reads the connection and reuses the refreshed token.
pub struct TokenManager {
    store: Arc<dyn ConnectionStore>,
    cipher: Arc<dyn Cipher>,
    refresher: Arc<dyn TokenRefresher>,
    providers: HashMap<Provider, ProviderSettings>,
    refresh_window: Duration,
    refresh_policy: RetryPolicy,
    locks: KeyedLock<(String, Provider)>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        cipher: Arc<dyn Cipher>,
        refresher: Arc<dyn TokenRefresher>,
        config: &GridlinkConfig,
    ) -> Self {
        let providers = Provider::ALL
            .into_iter()
            .map(|p| (p, config.provider(p)))
            .collect();
        Self {
            store,
            cipher,
            refresher,
            providers,
            refresh_window: Duration::seconds(config.tokens.refresh_window_secs as i64),
            refresh_policy: refresh_policy(&config.tokens),
            locks: KeyedLock::new(),
        }
    }

    /// Returns a usable access token, refreshing it first if it expires soon.
    ///
    /// # Errors
    /// * [`Error::ConnectionNotFound`] - no stored connection
    /// * [`Error::ReauthRequired`] - the connection needs a new consent
    /// * [`Error::RefreshFailed`] - transient refresh failures exhausted the attempt budget
    pub async fn get_valid_token(&self, user_id: &str, provider: Provider) -> Result<String> {
        let conn = self.load(user_id, provider).await?;
        if !conn.expires_within(self.refresh_window, Utc::now()) {
            return self.decrypt_access(&conn);
        }

        let _guard = self.locks.lock((user_id.to_string(), provider)).await;

        // Another caller may have refreshed while we waited for the lock.
        let conn = self.load(user_id, provider).await?;
        if !conn.expires_within(self.refresh_window, Utc::now()) {
            debug!(user_id = %user_id, provider = %provider, "Token refreshed by concurrent caller");
            return self.decrypt_access(&conn);
        }

        self.refresh(conn).await
    }

    /// Resolves a token and runs `api_call` with it under a retry policy.
    ///
    /// The token is resolved again before every attempt. Token errors are
    /// never retried.
    pub async fn with_token<F, Fut, T>(
        &self,
        user_id: &str,
        provider: Provider,
        api_call: F,
        options: WithTokenOptions,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = RetryPolicy::new(options.max_retries, options.retry_delay)
            .with_exponential(options.exponential_backoff);
        let api_call = &api_call;

        policy
            .run(|| async move {
                let token = self.get_valid_token(user_id, provider).await?;
                api_call(token).await
            })
            .await
    }

    /// Exchanges an authorization code and stores a fresh, active connection.
    pub async fn connect(
        &self,
        user_id: &str,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<()> {
        let grant = self
            .refresher
            .exchange_code(provider, code, redirect_uri)
            .await
            .map_err(|failure| Error::ReauthRequired {
                provider,
                reason: failure.to_string(),
            })?;
        self.store_grant(user_id, provider, grant).await
    }

    /// Stores tokens from a completed OAuth exchange, making the connection active.
    ///
    /// A grant without a refresh token keeps the previously stored one.
    pub async fn store_grant(&self, user_id: &str, provider: Provider, grant: TokenGrant) -> Result<()> {
        let _guard = self.locks.lock((user_id.to_string(), provider)).await;
        let update = self.grant_update(&grant, Utc::now())?;
        self.store.upsert(user_id, provider, update).await?;
        info!(user_id = %user_id, provider = %provider, "Connection stored");
        Ok(())
    }

    /// Consent URL to show when a connection needs reauthorization.
    pub fn authorization_url(&self, provider: Provider, state: &str, redirect_uri: &str) -> String {
        match self.providers.get(&provider) {
            Some(settings) => settings.build_auth_url(state, redirect_uri),
            None => ProviderSettings::defaults(provider).build_auth_url(state, redirect_uri),
        }
    }

    /// Deletes the connection. Returns false if there was none.
    pub async fn disconnect(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let key = (user_id.to_string(), provider);
        let deleted = {
            let _guard = self.locks.lock(key.clone()).await;
            self.store.delete(user_id, provider).await?
        };
        self.locks.forget(&key);
        if deleted {
            info!(user_id = %user_id, provider = %provider, "Connection deleted");
        }
        Ok(deleted)
    }

    pub async fn status(&self, user_id: &str, provider: Provider) -> Result<ConnectionStatus> {
        let status = match self.store.find(user_id, provider).await? {
            Some(conn) => ConnectionStatus {
                provider,
                state: if conn.needs_reauth {
                    ConnectionState::NeedsReauth
                } else {
                    ConnectionState::Active
                },
                expires_at: conn.expires_at,
                last_error: conn.last_error,
                last_attempt_at: conn.last_attempt_at,
            },
            None => ConnectionStatus {
                provider,
                state: ConnectionState::Disconnected,
                expires_at: None,
                last_error: None,
                last_attempt_at: None,
            },
        };
        Ok(status)
    }

    /// Status of every provider for a user, in [`Provider::ALL`] order.
    pub async fn statuses(&self, user_id: &str) -> Result<Vec<ConnectionStatus>> {
        let mut statuses = Vec::with_capacity(Provider::ALL.len());
        for provider in Provider::ALL {
            statuses.push(self.status(user_id, provider).await?);
        }
        Ok(statuses)
    }

    async fn load(&self, user_id: &str, provider: Provider) -> Result<Connection> {
        let conn = self
            .store
            .find(user_id, provider)
            .await?
            .ok_or_else(|| Error::ConnectionNotFound {
                user_id: user_id.to_string(),
                provider,
            })?;

        if conn.needs_reauth {
            return Err(Error::ReauthRequired {
                provider,
                reason: conn
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "reauthorization required".to_string()),
            });
        }
        Ok(conn)
    }

    fn decrypt_access(&self, conn: &Connection) -> Result<String> {
        Ok(self.cipher.decrypt(&conn.encrypted_access_token)?)
    }

    fn grant_update(&self, grant: &TokenGrant, now: DateTime<Utc>) -> Result<ConnectionUpdate> {
        let mut update = ConnectionUpdate::default()
            .access_token(self.cipher.encrypt(&grant.access_token)?)
            .expires_at(grant.expires_at(now))
            .needs_reauth(false)
            .last_error(None)
            .attempted_at(now);
        if let Some(refresh_token) = &grant.refresh_token {
            update = update.refresh_token(self.cipher.encrypt(refresh_token)?);
        }
        Ok(update)
    }

    /// Flips the connection to `NeedsReauth`, recording why.
    async fn mark_reauth(&self, user_id: &str, provider: Provider, reason: &str) -> Result<()> {
        warn!(user_id = %user_id, provider = %provider, reason = %reason, "Connection needs reauthorization");
        let update = ConnectionUpdate::default()
            .needs_reauth(true)
            .last_error(Some(reason.to_string()))
            .attempted_at(Utc::now());
        self.store.upsert(user_id, provider, update).await?;
        Ok(())
    }

    async fn refresh(&self, conn: Connection) -> Result<String> {
        let user_id = conn.user_id.as_str();
        let provider = conn.provider;

        let Some(encrypted_refresh) = conn.encrypted_refresh_token.as_deref() else {
            let reason = "access token expired and no refresh token is stored".to_string();
            self.mark_reauth(user_id, provider, &reason).await?;
            return Err(Error::ReauthRequired { provider, reason });
        };

        let refresh_token = match self.cipher.decrypt(encrypted_refresh) {
            Ok(token) => token,
            Err(e) => {
                let reason = format!("stored refresh token is unreadable: {}", e);
                self.mark_reauth(user_id, provider, &reason).await?;
                return Err(Error::ReauthRequired { provider, reason });
            }
        };

        info!(user_id = %user_id, provider = %provider, "Refreshing OAuth token");

        let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let mut attempts = 0u32;
        let outcome = self
            .refresh_policy
            .run(|| {
                attempts += 1;
                let refresh_token = refresh_token.as_str();
                let failures = &failures;
                async move {
                    let result = self.refresher.refresh(provider, refresh_token).await;
                    if let Err(failure) = &result {
                        if let Ok(mut seen) = failures.lock() {
                            seen.push(failure.to_string());
                        }
                        self.record_failed_attempt(user_id, provider, failure).await;
                    }
                    result
                }
            })
            .await;

        match outcome {
            Ok(grant) => {
                let update = self.grant_update(&grant, Utc::now())?;
                self.store.upsert(user_id, provider, update).await?;
                info!(
                    user_id = %user_id,
                    provider = %provider,
                    attempts = attempts,
                    rotated_refresh_token = grant.refresh_token.is_some(),
                    "OAuth token refreshed successfully"
                );
                Ok(grant.access_token)
            }
            Err(failure) if failure.requires_reauth() => {
                let reason = failure.to_string();
                self.mark_reauth(user_id, provider, &reason).await?;
                Err(Error::ReauthRequired { provider, reason })
            }
            Err(failure) => {
                let history = failures
                    .lock()
                    .map(|seen| seen.join("; "))
                    .unwrap_or_else(|_| failure.to_string());
                let reason = format!("refresh failed after {} attempts: {}", attempts, history);
                self.mark_reauth(user_id, provider, &reason).await?;
                Err(Error::RefreshFailed {
                    provider,
                    reason: failure.to_string(),
                    attempts,
                })
            }
        }
    }

    /// Records a failed refresh attempt; bookkeeping errors are logged, not raised.
    async fn record_failed_attempt(&self, user_id: &str, provider: Provider, failure: &RefreshFailure) {
        let update = ConnectionUpdate::default()
            .last_error(Some(failure.to_string()))
            .attempted_at(Utc::now());
        if let Err(e) = self.store.upsert(user_id, provider, update).await {
            warn!(user_id = %user_id, provider = %provider, error = %e, "Failed to record refresh attempt");
        }
    }
}

fn refresh_policy(config: &TokenConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.max_refresh_attempts,
        std::time::Duration::from_millis(config.refresh_base_delay_ms),
    )
    .with_jitter(std::time::Duration::from_millis(config.refresh_max_jitter_ms))
}
