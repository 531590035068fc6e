//! gridlink configuration.
//!
//! Loaded from TOML; every section is optional and falls back to defaults.
//! OAuth client credentials can also come from the environment:
//! `GRIDLINK_OAUTH_<PROVIDER>_CLIENT_ID` / `GRIDLINK_OAUTH_<PROVIDER>_CLIENT_SECRET`.

mod providers;

pub use providers::{ClientAuthStyle, ProviderOverrides, ProviderSettings};

use crate::error::{Error, Result};
use crate::provider::Provider;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable holding the base64-encoded 32-byte encryption key.
pub const ENCRYPTION_KEY_ENV: &str = "GRIDLINK_ENCRYPTION_KEY";

/// Complete gridlink configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GridlinkConfig {
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl GridlinkConfig {
    /// Loads and validates a TOML config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates TOML config text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: GridlinkConfig =
            toml::from_str(raw).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides OAuth client credentials from `GRIDLINK_OAUTH_*` environment variables.
    pub fn apply_env(&mut self) {
        for provider in Provider::ALL {
            let prefix = provider.env_prefix();
            let overrides = self.providers.get_mut(provider);
            if let Ok(id) = std::env::var(format!("GRIDLINK_OAUTH_{}_CLIENT_ID", prefix)) {
                overrides.client_id = Some(id);
            }
            if let Ok(secret) = std::env::var(format!("GRIDLINK_OAUTH_{}_CLIENT_SECRET", prefix)) {
                overrides.client_secret = Some(secret);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.tokens.max_refresh_attempts == 0 {
            return Err(Error::Config(
                "tokens.max_refresh_attempts must be at least 1".into(),
            ));
        }
        for provider in Provider::ALL {
            let limits = self.rate_limits.get(provider);
            if limits.requests_per_second == 0 {
                return Err(Error::Config(format!(
                    "rate_limits.{}.requests_per_second must be positive",
                    provider
                )));
            }
            if limits.queue_capacity == 0 {
                return Err(Error::Config(format!(
                    "rate_limits.{}.queue_capacity must be positive",
                    provider
                )));
            }
        }
        Ok(())
    }

    /// Effective OAuth/API settings for a provider (defaults merged with overrides).
    pub fn provider(&self, provider: Provider) -> ProviderSettings {
        ProviderSettings::resolve(provider, self.providers.get(provider))
    }
}

/// Reads the encryption key from [`ENCRYPTION_KEY_ENV`].
pub fn encryption_key_from_env() -> Result<String> {
    std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| {
        Error::Config(format!(
            "{} is required (base64-encoded 32-byte key)",
            ENCRYPTION_KEY_ENV
        ))
    })
}

/// Token lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Refresh when the token expires within this many seconds.
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: u64,
    /// Total refresh attempts before giving up.
    #[serde(default = "default_max_refresh_attempts")]
    pub max_refresh_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub refresh_base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub refresh_max_jitter_ms: u64,
}

fn default_refresh_window() -> u64 {
    300
}

fn default_max_refresh_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    1000
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_window_secs: default_refresh_window(),
            max_refresh_attempts: default_max_refresh_attempts(),
            refresh_base_delay_ms: default_base_delay_ms(),
            refresh_max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

/// Retry policy for data API calls
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_quota_multiplier")]
    pub quota_multiplier: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_quota_multiplier() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            quota_multiplier: default_quota_multiplier(),
        }
    }
}

/// Dispatch limits for one provider
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Maximum number of queued, not yet dispatched tasks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-task timeout; `None` disables it.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: Option<u64>,
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_task_timeout() -> Option<u64> {
    Some(120)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            queue_capacity: default_queue_capacity(),
            task_timeout_secs: default_task_timeout(),
        }
    }
}

impl RateLimitConfig {
    /// Minimum spacing between dispatches: `1000ms / requests_per_second`.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.requests_per_second.max(1)))
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub google_sheets: RateLimitConfig,
    #[serde(default)]
    pub airtable: RateLimitConfig,
}

impl RateLimitsConfig {
    pub fn get(&self, provider: Provider) -> &RateLimitConfig {
        match provider {
            Provider::GoogleSheets => &self.google_sheets,
            Provider::Airtable => &self.airtable,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub google_sheets: ProviderOverrides,
    #[serde(default)]
    pub airtable: ProviderOverrides,
}

impl ProvidersConfig {
    pub fn get(&self, provider: Provider) -> &ProviderOverrides {
        match provider {
            Provider::GoogleSheets => &self.google_sheets,
            Provider::Airtable => &self.airtable,
        }
    }

    fn get_mut(&mut self, provider: Provider) -> &mut ProviderOverrides {
        match provider {
            Provider::GoogleSheets => &mut self.google_sheets,
            Provider::Airtable => &mut self.airtable,
        }
    }
}
