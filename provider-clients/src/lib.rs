//! Typed clients for the provider data APIs.
//!
//! ```text
//!   SheetsClient / AirtableClient
//!              ↓
//!   ┌─────────────────────────────┐
//!   │ ApiClient                   │
//!   │  RetryPolicy                │
//!   │   └ TokenManager (Bearer)   │
//!   │   └ RateLimiter (dispatch)  │
//!   └─────────────────────────────┘
//!              ↓
//!   Google Sheets v4 / Drive v3, Airtable REST / metadata API
//! ```
//!
//! Failures surface as [`gridlink::Error`]; data-API failures carry a
//! classified [`gridlink::ProviderApiError`].
//!
//! # Example
//!
//! ```no_run
//! use gridlink::{
//!     AesGcmCipher, GridlinkConfig, OAuthClient, RateLimiterRegistry, SqliteConnectionStore,
//!     TokenManager,
//! };
//! use provider_clients::SheetsClient;
//! use std::sync::Arc;
//!
//! # async fn run() -> gridlink::Result<()> {
//! let mut config = GridlinkConfig::from_file("gridlink.toml")?;
//! config.apply_env();
//!
//! let store = Arc::new(SqliteConnectionStore::new("connections.db")?);
//! let cipher = Arc::new(AesGcmCipher::new(&gridlink::config::encryption_key_from_env()?)?);
//! let tokens = Arc::new(TokenManager::new(
//!     store,
//!     cipher,
//!     Arc::new(OAuthClient::new(&config)?),
//!     &config,
//! ));
//! let limiters = Arc::new(RateLimiterRegistry::new(config.rate_limits.clone()));
//!
//! let sheets = SheetsClient::new(tokens, limiters, &config)?;
//! let values = sheets.read_range("user-1", "spreadsheet-id", "Sheet1!A1:D10").await?;
//! println!("{} rows", values.values.len());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod airtable;
pub mod sheets;

pub use airtable::{AirtableClient, FieldSpec, ListRecordsOptions, RecordUpdate};
pub use client::{paginate, ApiClient, Page};
pub use sheets::{GridRange, SheetMutation, SheetsClient, ValidationRule};
