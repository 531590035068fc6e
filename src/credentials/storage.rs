//! Connection storage using SQLite.
//!
//! Rows hold ciphertext only; encryption happens before tokens reach the store.

use super::{Connection, ConnectionStore, ConnectionUpdate};
use crate::provider::Provider;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Connection store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE connections (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token TEXT NOT NULL,   -- Encrypted
///     refresh_token TEXT,           -- Encrypted (optional)
///     expires_at TEXT,              -- RFC 3339 (optional)
///     needs_reauth INTEGER NOT NULL,
///     last_error TEXT,
///     last_attempt_at TEXT,         -- RFC 3339 (optional)
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, provider)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - Each upsert reads and writes inside one transaction
pub struct SqliteConnectionStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteConnectionStore {
    /// Creates or opens a store (`":memory:"` for an in-memory database).
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT,
                needs_reauth INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_attempt_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, provider)
            )
            "#,
            [],
        )
        .context("Failed to create connections table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("connection store mutex poisoned"))
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT user_id, provider, access_token, refresh_token, expires_at,
           needs_reauth, last_error, last_attempt_at
    FROM connections
"#;

fn parse_timestamp(value: Option<String>, column: &str) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .with_context(|| format!("Failed to parse {} timestamp", column))
}

fn read_row(row: &Row<'_>) -> Result<Connection> {
    let provider: String = row.get(1)?;
    let provider: Provider = provider
        .parse()
        .map_err(|_| anyhow!("unknown provider '{}' in connections table", provider))?;
    let needs_reauth: i64 = row.get(5)?;

    Ok(Connection {
        user_id: row.get(0)?,
        provider,
        encrypted_access_token: row.get(2)?,
        encrypted_refresh_token: row.get(3)?,
        expires_at: parse_timestamp(row.get(4)?, "expires_at")?,
        needs_reauth: needs_reauth != 0,
        last_error: row.get(6)?,
        last_attempt_at: parse_timestamp(row.get(7)?, "last_attempt_at")?,
    })
}

fn find_locked(
    conn: &rusqlite::Connection,
    user_id: &str,
    provider: Provider,
) -> Result<Option<Connection>> {
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE user_id = ?1 AND provider = ?2",
            SELECT_COLUMNS
        ))
        .context("Failed to prepare query")?;

    let mut rows = stmt
        .query(params![user_id, provider.as_str()])
        .context("Failed to execute query")?;

    match rows.next().context("Failed to read row")? {
        Some(row) => Ok(Some(read_row(row)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl ConnectionStore for SqliteConnectionStore {
    async fn find(&self, user_id: &str, provider: Provider) -> Result<Option<Connection>> {
        let conn = self.lock()?;
        find_locked(&conn, user_id, provider)
    }

    async fn upsert(&self, user_id: &str, provider: Provider, update: ConnectionUpdate) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let merged = match find_locked(&tx, user_id, provider)? {
            Some(mut existing) => {
                update.apply_to(&mut existing);
                existing
            }
            None => update.into_connection(user_id, provider)?,
        };

        let now = Utc::now().to_rfc3339();
        tx.execute(
            r#"
            INSERT INTO connections (
                user_id, provider, access_token, refresh_token, expires_at,
                needs_reauth, last_error, last_attempt_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                needs_reauth = excluded.needs_reauth,
                last_error = excluded.last_error,
                last_attempt_at = excluded.last_attempt_at,
                updated_at = excluded.updated_at
            "#,
            params![
                merged.user_id,
                merged.provider.as_str(),
                merged.encrypted_access_token,
                merged.encrypted_refresh_token,
                merged.expires_at.map(|dt| dt.to_rfc3339()),
                merged.needs_reauth as i64,
                merged.last_error,
                merged.last_attempt_at.map(|dt| dt.to_rfc3339()),
                now,
            ],
        )
        .context("Failed to store connection")?;

        tx.commit().context("Failed to commit connection")?;
        Ok(())
    }

    async fn delete(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let rows_affected = self
            .lock()?
            .execute(
                "DELETE FROM connections WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
            )
            .context("Failed to delete connection")?;

        Ok(rows_affected > 0)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Provider>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT provider FROM connections WHERE user_id = ?1 ORDER BY provider")
            .context("Failed to prepare query")?;

        let names = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        names
            .into_iter()
            .map(|name| {
                name.parse()
                    .map_err(|_| anyhow!("unknown provider '{}' in connections table", name))
            })
            .collect()
    }
}

impl SqliteConnectionStore {
    /// Number of rows for a (user, provider) pair; used to check uniqueness.
    pub fn count(&self, user_id: &str, provider: Provider) -> Result<u64> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM connections WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to count connections")?
            .unwrap_or(0);
        Ok(count as u64)
    }
}
