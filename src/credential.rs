//! Credential record handed in by the caller.
//!
//! `attributes` hold static settings (`api_key`, `base_url`, `header:<Name>`
//! custom headers); `metadata` holds OAuth state (`access_token`,
//! `refresh_token`, `account_id`, `expired`, `email`, ...). The executor only
//! mutates `metadata`, and only during refresh.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const CUSTOM_HEADER_PREFIX: &str = "header:";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Credential {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Bearer token and base URL. A static `api_key` attribute wins over the
    /// OAuth `access_token`; the base URL is empty when unset.
    pub fn codex_creds(&self) -> (String, String) {
        let mut token = self.attributes.get("api_key").cloned().unwrap_or_default();
        let base_url = self.attributes.get("base_url").cloned().unwrap_or_default();
        if token.is_empty() {
            token = self.metadata_str("access_token").unwrap_or_default().to_string();
        }
        (token, base_url)
    }

    /// True when authenticating with a static API key rather than OAuth.
    pub fn is_api_key(&self) -> bool {
        self.attributes
            .get("api_key")
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.metadata_str("account_id")
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.metadata_str("refresh_token").filter(|v| !v.is_empty())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Custom headers configured as `header:<Name>` attributes, sorted by name
    /// so application order is stable.
    pub fn custom_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .attributes
            .iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(CUSTOM_HEADER_PREFIX)?.trim();
                let value = value.trim();
                if name.is_empty() || value.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        headers.sort();
        headers
    }
}
