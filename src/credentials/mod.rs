//! Connection records and the adapters that persist them.
//!
//! A [`Connection`] is the stored OAuth credential scoping one user to one
//! provider. Tokens are encrypted by a [`Cipher`] before they reach a
//! [`ConnectionStore`], so stores only ever see ciphertext.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenManager                       │
//! │  - encrypts before write                 │
//! │  - decrypts after read                   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!   (ConnectionUpdate)     (Connection)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       ConnectionStore                    │
//! │  - SqliteConnectionStore (durable)       │
//! │  - MemoryConnectionStore (tests)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use gridlink::credentials::{AesGcmCipher, Cipher, ConnectionStore, ConnectionUpdate, SqliteConnectionStore};
//! use gridlink::Provider;
//! use chrono::{Duration, Utc};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let cipher = AesGcmCipher::new(&std::env::var("GRIDLINK_ENCRYPTION_KEY")?)?;
//! let store = SqliteConnectionStore::new("connections.db")?;
//!
//! let update = ConnectionUpdate::default()
//!     .access_token(cipher.encrypt("access")?)
//!     .refresh_token(cipher.encrypt("refresh")?)
//!     .expires_at(Some(Utc::now() + Duration::hours(1)));
//! store.upsert("user1", Provider::Airtable, update).await?;
//!
//! if let Some(conn) = store.find("user1", Provider::Airtable).await? {
//!     let token = cipher.decrypt(&conn.encrypted_access_token)?;
//!     println!("{} chars", token.len());
//! }
//! # Ok(())
//! # }
//! ```

use crate::provider::Provider;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod encryption;
mod memory;
mod storage;

pub use encryption::{validate_key, AesGcmCipher};
pub use memory::MemoryConnectionStore;
pub use storage::SqliteConnectionStore;

/// Symmetric encryption of token strings.
///
/// `decrypt(encrypt(x)) == x`; `encrypt` is randomized, so two encryptions of
/// the same plaintext differ. Malformed ciphertext is an error, never garbage.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Stored OAuth credential for one (user, provider) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub user_id: String,
    pub provider: Provider,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: Option<String>,
    /// `None` means the expiry is unknown and is treated as already expired.
    pub expires_at: Option<DateTime<Utc>>,
    pub needs_reauth: bool,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Connection {
    /// True if the access token expires at or before `now + window`.
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + window,
            None => true,
        }
    }
}

/// Partial update of a [`Connection`]; unset fields are left untouched.
///
/// Creating a connection that does not exist yet requires an access token.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionUpdate {
    pub encrypted_access_token: Option<String>,
    /// Only ever replaces; an absent value keeps the stored refresh token.
    pub encrypted_refresh_token: Option<String>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub needs_reauth: Option<bool>,
    pub last_error: Option<Option<String>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl ConnectionUpdate {
    pub fn access_token(mut self, encrypted: String) -> Self {
        self.encrypted_access_token = Some(encrypted);
        self
    }

    pub fn refresh_token(mut self, encrypted: String) -> Self {
        self.encrypted_refresh_token = Some(encrypted);
        self
    }

    pub fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn needs_reauth(mut self, needs_reauth: bool) -> Self {
        self.needs_reauth = Some(needs_reauth);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn attempted_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_attempt_at = Some(at);
        self
    }

    /// Applies the set fields to an existing connection.
    pub fn apply_to(self, conn: &mut Connection) {
        if let Some(v) = self.encrypted_access_token {
            conn.encrypted_access_token = v;
        }
        if let Some(v) = self.encrypted_refresh_token {
            conn.encrypted_refresh_token = Some(v);
        }
        if let Some(v) = self.expires_at {
            conn.expires_at = v;
        }
        if let Some(v) = self.needs_reauth {
            conn.needs_reauth = v;
        }
        if let Some(v) = self.last_error {
            conn.last_error = v;
        }
        if let Some(v) = self.last_attempt_at {
            conn.last_attempt_at = Some(v);
        }
    }

    /// Builds a new connection from this update.
    pub fn into_connection(self, user_id: &str, provider: Provider) -> Result<Connection> {
        let encrypted_access_token = self.encrypted_access_token.ok_or_else(|| {
            anyhow!(
                "cannot create {} connection for '{}' without an access token",
                provider,
                user_id
            )
        })?;
        Ok(Connection {
            user_id: user_id.to_string(),
            provider,
            encrypted_access_token,
            encrypted_refresh_token: self.encrypted_refresh_token,
            expires_at: self.expires_at.flatten(),
            needs_reauth: self.needs_reauth.unwrap_or(false),
            last_error: self.last_error.flatten(),
            last_attempt_at: self.last_attempt_at,
        })
    }
}

/// Durable store of connections, at most one per (user, provider).
///
/// Writes are last-writer-wins.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn find(&self, user_id: &str, provider: Provider) -> Result<Option<Connection>>;

    /// Inserts or partially updates the connection.
    async fn upsert(&self, user_id: &str, provider: Provider, update: ConnectionUpdate) -> Result<()>;

    /// Returns true if a connection was deleted.
    async fn delete(&self, user_id: &str, provider: Provider) -> Result<bool>;

    /// Providers the user has a stored connection for.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Provider>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(expires_at: Option<DateTime<Utc>>) -> Connection {
        Connection {
            user_id: "u1".to_string(),
            provider: Provider::Airtable,
            encrypted_access_token: "a".to_string(),
            encrypted_refresh_token: Some("r".to_string()),
            expires_at,
            needs_reauth: false,
            last_error: None,
            last_attempt_at: None,
        }
    }

    #[test]
    fn test_expires_within() {
        let now = Utc::now();
        let window = Duration::minutes(5);
        assert!(connection(Some(now + Duration::minutes(2))).expires_within(window, now));
        assert!(connection(Some(now + Duration::minutes(5))).expires_within(window, now));
        assert!(!connection(Some(now + Duration::minutes(6))).expires_within(window, now));
        assert!(connection(None).expires_within(window, now));
    }

    #[test]
    fn test_apply_keeps_unset_fields() {
        let mut conn = connection(None);
        ConnectionUpdate::default()
            .access_token("a2".to_string())
            .last_error(Some("boom".to_string()))
            .apply_to(&mut conn);

        assert_eq!(conn.encrypted_access_token, "a2");
        assert_eq!(conn.encrypted_refresh_token.as_deref(), Some("r"));
        assert_eq!(conn.last_error.as_deref(), Some("boom"));

        ConnectionUpdate::default().last_error(None).apply_to(&mut conn);
        assert!(conn.last_error.is_none());
    }

    #[test]
    fn test_into_connection_requires_access_token() {
        let err = ConnectionUpdate::default()
            .needs_reauth(true)
            .into_connection("u1", Provider::GoogleSheets);
        assert!(err.is_err());

        let conn = ConnectionUpdate::default()
            .access_token("a".to_string())
            .into_connection("u1", Provider::GoogleSheets)
            .unwrap();
        assert!(!conn.needs_reauth);
        assert!(conn.expires_at.is_none());
    }
}
