// Provider identifiers
pub mod provider;

// Error taxonomy and upstream failure classification
pub mod error;

// TOML and environment configuration
pub mod config;

// Encrypted connection storage
pub mod credentials;

// Per-provider dispatch queues
pub mod rate_limit;

// Backoff policy
pub mod retry;

// OAuth token lifecycle
pub mod tokens;

// Tracing setup
pub mod logging;

pub use config::GridlinkConfig;
pub use credentials::{AesGcmCipher, Cipher, ConnectionStore, MemoryConnectionStore, SqliteConnectionStore};
pub use error::{Error, ProviderApiError, Result, UserAction};
pub use provider::Provider;
pub use rate_limit::{RateLimiter, RateLimiterRegistry};
pub use retry::{RetryClass, RetryPolicy, Retryable};
pub use tokens::{ConnectionState, ConnectionStatus, OAuthClient, TokenManager, WithTokenOptions};
