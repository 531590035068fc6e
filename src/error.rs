//! Error taxonomy and structured error classification.
//!
//! Upstream failures are never classified by searching message text. Each
//! failure carries its HTTP status (if any) and the provider's machine-readable
//! error code, and [`classify`] / [`is_reauth_failure`] map those fields to a
//! decision.

use crate::provider::Provider;
use crate::retry::{RetryClass, Retryable};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by gridlink.
#[derive(Debug, Error)]
pub enum Error {
    /// The user never connected this provider (or disconnected it).
    #[error("no {provider} connection for user '{user_id}'")]
    ConnectionNotFound { user_id: String, provider: Provider },

    /// The stored credential is unusable; the user must repeat the OAuth consent flow.
    #[error("{provider} connection needs reauthorization: {reason}")]
    ReauthRequired { provider: Provider, reason: String },

    /// Token refresh kept failing with transient errors until the attempt budget ran out.
    #[error("{provider} token refresh failed after {attempts} attempts: {reason}")]
    RefreshFailed {
        provider: Provider,
        reason: String,
        attempts: u32,
    },

    /// A data API call failed.
    #[error(transparent)]
    ProviderApi(#[from] ProviderApiError),

    /// The provider's dispatch queue is at capacity.
    #[error("{provider} request queue is full ({capacity} pending)")]
    QueueFull { provider: Provider, capacity: usize },

    /// A queued task ran longer than the limiter's per-task timeout.
    #[error("{provider} request timed out after {timeout:?}")]
    TaskTimeout { provider: Provider, timeout: Duration },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential store or cipher failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Result type used throughout gridlink.
pub type Result<T> = std::result::Result<T, Error>;

/// What a caller should ask the end user to do about an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserAction {
    /// "Reconnect your account"
    Reconnect,
    /// "Try again later"
    TryLater,
    /// Generic retry prompt
    Retry,
}

impl Error {
    /// Maps the error to the prompt callers show the end user.
    pub fn user_action(&self) -> UserAction {
        match self {
            Error::ConnectionNotFound { .. } | Error::ReauthRequired { .. } => {
                UserAction::Reconnect
            }
            Error::ProviderApi(e) if e.is_quota_error => UserAction::TryLater,
            Error::QueueFull { .. } => UserAction::TryLater,
            _ => UserAction::Retry,
        }
    }

    /// True if this is a classified upstream auth failure (401/403 and equivalents).
    pub fn is_auth_error(&self) -> bool {
        match self {
            Error::ProviderApi(e) => e.is_auth_error,
            Error::ReauthRequired { .. } => true,
            _ => false,
        }
    }

    /// True if this is a classified upstream quota failure (429 and equivalents).
    pub fn is_quota_error(&self) -> bool {
        match self {
            Error::ProviderApi(e) => e.is_quota_error,
            Error::QueueFull { .. } => true,
            _ => false,
        }
    }
}

impl Retryable for Error {
    fn retry_class(&self) -> RetryClass {
        match self {
            Error::ProviderApi(e) => e.retry_class(),
            Error::QueueFull { .. } => RetryClass::RetryQuota,
            Error::TaskTimeout { .. } => RetryClass::Retry,
            Error::ConnectionNotFound { .. } | Error::ReauthRequired { .. } => RetryClass::Auth,
            Error::RefreshFailed { .. } | Error::Config(_) | Error::Backend(_) => {
                RetryClass::Fatal
            }
        }
    }
}

/// A failed call to a provider's data API.
///
/// `status` is `None` when the request never produced an HTTP response
/// (connection refused, reset, DNS failure, ...).
#[derive(Debug, Clone, Error)]
#[error("{provider} API error ({}): {message}", status_label(.status))]
pub struct ProviderApiError {
    pub provider: Provider,
    pub status: Option<u16>,
    /// Provider error code, e.g. `RESOURCE_EXHAUSTED` or `INVALID_PERMISSIONS`.
    pub code: Option<String>,
    pub message: String,
    pub raw_body: String,
    pub is_auth_error: bool,
    pub is_quota_error: bool,
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!("status {}", s),
        None => "network".to_string(),
    }
}

impl ProviderApiError {
    /// Builds a classified error from a non-success HTTP response.
    pub fn from_response(
        provider: Provider,
        status: u16,
        code: Option<String>,
        message: String,
        raw_body: String,
    ) -> Self {
        let class = classify(Some(status), code.as_deref());
        Self {
            provider,
            status: Some(status),
            code,
            message,
            raw_body,
            is_auth_error: class.auth_error,
            is_quota_error: class.quota_error,
        }
    }

    /// Builds an error for a request that failed before a response arrived.
    pub fn network(provider: Provider, message: String) -> Self {
        Self {
            provider,
            status: None,
            code: None,
            message,
            raw_body: String::new(),
            is_auth_error: false,
            is_quota_error: false,
        }
    }

    /// Full classification of this error.
    pub fn classification(&self) -> Classification {
        classify(self.status, self.code.as_deref())
    }

    fn retry_class(&self) -> RetryClass {
        let class = self.classification();
        if class.quota_error {
            RetryClass::RetryQuota
        } else if class.auth_error {
            RetryClass::Auth
        } else if class.retryable {
            RetryClass::Retry
        } else {
            RetryClass::Fatal
        }
    }
}

/// Classification of an upstream failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub auth_error: bool,
    pub quota_error: bool,
    pub retryable: bool,
}

const QUOTA_CODES: &[&str] = &[
    "RESOURCE_EXHAUSTED",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "RATE_LIMIT_REACHED",
    "TOO_MANY_REQUESTS",
];

const AUTH_CODES: &[&str] = &[
    "UNAUTHENTICATED",
    "PERMISSION_DENIED",
    "AUTHENTICATION_REQUIRED",
    "INVALID_PERMISSIONS",
    "INVALID_PERMISSIONS_OR_MODEL_NOT_FOUND",
    "INVALID_AUTHORIZATION",
];

/// Classifies a data-API failure from its status and provider error code.
///
/// A 403 carrying a quota code is a quota error, not an auth error.
pub fn classify(status: Option<u16>, code: Option<&str>) -> Classification {
    let quota_error =
        status == Some(429) || code.is_some_and(|c| QUOTA_CODES.contains(&c));
    let auth_error = !quota_error
        && (matches!(status, Some(401) | Some(403))
            || code.is_some_and(|c| AUTH_CODES.contains(&c)));
    let retryable = match status {
        None => true,
        Some(s) => s >= 500 || quota_error,
    };
    Classification {
        auth_error,
        quota_error,
        retryable: retryable && !auth_error,
    }
}

const REAUTH_CODES: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "unauthorized",
    "revoked",
    "token_revoked",
    "expired_token",
    "token_expired",
];

/// True if a token-endpoint failure means the refresh token can never work again.
///
/// Matches the OAuth `error` code (case-insensitive) against the known reauth
/// codes; a 401 from the token endpoint also counts.
pub fn is_reauth_failure(status: Option<u16>, oauth_error_code: Option<&str>) -> bool {
    if status == Some(401) {
        return true;
    }
    oauth_error_code.is_some_and(|code| {
        let code = code.to_ascii_lowercase();
        REAUTH_CODES.contains(&code.as_str())
    })
}
