//! Per-provider OAuth and API endpoint settings.

use crate::provider::Provider;
use serde::{Deserialize, Serialize};

/// How client credentials are presented to the token endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthStyle {
    /// `client_id` / `client_secret` as form fields
    RequestBody,
    /// HTTP Basic `Authorization` header
    BasicAuth,
}

/// Optional overrides from the `[providers.<name>]` config section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderOverrides {
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub api_base_url: Option<String>,
    pub list_base_url: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_auth: Option<ClientAuthStyle>,
}

/// Effective settings for one provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// OAuth authorization endpoint URL
    pub auth_url: String,
    /// OAuth token endpoint URL (code exchange and refresh)
    pub token_url: String,
    /// Data API base URL
    pub api_base_url: String,
    /// Base URL for listing the user's documents
    /// (Drive for Google Sheets, the metadata API for Airtable)
    pub list_base_url: String,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub client_secret: String,
    pub client_auth: ClientAuthStyle,
}

impl ProviderSettings {
    /// Built-in settings for a provider, without client credentials.
    pub fn defaults(provider: Provider) -> Self {
        let (auth_url, token_url, api_base_url, list_base_url, scopes, client_auth) =
            match provider {
                Provider::GoogleSheets => (
                    "https://accounts.google.com/o/oauth2/v2/auth",
                    "https://oauth2.googleapis.com/token",
                    "https://sheets.googleapis.com/v4",
                    "https://www.googleapis.com/drive/v3",
                    vec![
                        "https://www.googleapis.com/auth/spreadsheets",
                        "https://www.googleapis.com/auth/drive.metadata.readonly",
                    ],
                    ClientAuthStyle::RequestBody,
                ),
                Provider::Airtable => (
                    "https://airtable.com/oauth2/v1/authorize",
                    "https://airtable.com/oauth2/v1/token",
                    "https://api.airtable.com/v0",
                    "https://api.airtable.com/v0/meta",
                    vec![
                        "data.records:read",
                        "data.records:write",
                        "schema.bases:read",
                        "schema.bases:write",
                    ],
                    ClientAuthStyle::BasicAuth,
                ),
            };

        Self {
            auth_url: auth_url.to_string(),
            token_url: token_url.to_string(),
            api_base_url: api_base_url.to_string(),
            list_base_url: list_base_url.to_string(),
            scopes: scopes.into_iter().map(|s| s.to_string()).collect(),
            client_id: String::new(),
            client_secret: String::new(),
            client_auth,
        }
    }

    /// Merges config overrides onto the built-in defaults.
    pub fn resolve(provider: Provider, overrides: &ProviderOverrides) -> Self {
        let mut settings = Self::defaults(provider);
        let o = overrides.clone();
        if let Some(v) = o.auth_url {
            settings.auth_url = v;
        }
        if let Some(v) = o.token_url {
            settings.token_url = v;
        }
        if let Some(v) = o.api_base_url {
            settings.api_base_url = v;
        }
        if let Some(v) = o.list_base_url {
            settings.list_base_url = v;
        }
        if let Some(v) = o.scopes {
            settings.scopes = v;
        }
        if let Some(v) = o.client_id {
            settings.client_id = v;
        }
        if let Some(v) = o.client_secret {
            settings.client_secret = v;
        }
        if let Some(v) = o.client_auth {
            settings.client_auth = v;
        }
        settings
    }

    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code&access_type=offline&prompt=consent",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }
}
