//! Upstream providers supported by gridlink.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An upstream API a user can connect.
///
/// Each provider has its own OAuth endpoints, its own rate limiter and its
/// own typed client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Spreadsheet-style tabular service (Google Sheets).
    GoogleSheets,
    /// Relational-record service (Airtable).
    Airtable,
}

impl Provider {
    /// All supported providers.
    pub const ALL: [Provider; 2] = [Provider::GoogleSheets, Provider::Airtable];

    /// Stable identifier used in storage, configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GoogleSheets => "google_sheets",
            Provider::Airtable => "airtable",
        }
    }

    /// Prefix for environment variables (e.g. `GRIDLINK_OAUTH_AIRTABLE_CLIENT_ID`).
    pub fn env_prefix(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google_sheets" => Ok(Provider::GoogleSheets),
            "airtable" => Ok(Provider::Airtable),
            other => Err(crate::Error::Config(format!("unknown provider '{}'", other))),
        }
    }
}
