use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
pub const DEFAULT_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
pub const DEFAULT_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Resolved configuration handed to the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub model_mapping: ModelMappingConfig,
    #[serde(default)]
    pub params: ParamsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_openai_beta")]
    pub openai_beta: String,
    #[serde(default = "default_originator")]
    pub originator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

/// Overrides for the built-in Claude -> Codex model fallback table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMappingConfig {
    #[serde(default)]
    pub claude_to_codex: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_codex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsConfig {
    #[serde(default = "default_drop_params")]
    pub drop: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            version: default_version(),
            openai_beta: default_openai_beta(),
            originator: default_originator(),
        }
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            client_id: default_client_id(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            drop: default_drop_params(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_version() -> String {
    "0.21.0".to_string()
}

fn default_openai_beta() -> String {
    "responses=experimental".to_string()
}

fn default_originator() -> String {
    "codex_cli_rs".to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_line_bytes() -> usize {
    20_971_520
}

fn default_drop_params() -> Vec<String> {
    vec![
        "previous_response_id".to_string(),
        "max_output_tokens".to_string(),
        "max_completion_tokens".to_string(),
        "temperature".to_string(),
        "top_p".to_string(),
        "stream_options".to_string(),
        "service_tier".to_string(),
        "user".to_string(),
    ]
}

impl BridgeConfig {
    /// Load config from a TOML file. Missing sections take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: explicit path > CWD > XDG config > home dir.
    /// Falls back to the built-in defaults when nothing is found.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream.channel_capacity == 0 {
            return Err(BridgeError::config("stream.channel_capacity must be at least 1"));
        }
        if self.stream.max_line_bytes == 0 {
            return Err(BridgeError::config("stream.max_line_bytes must be at least 1"));
        }
        if self.oauth.max_attempts == 0 {
            return Err(BridgeError::config("oauth.max_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("codex-bridge.toml")];

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("codex-bridge").join("config.toml"));
    }
    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join("codex-bridge").join("config.toml"));
        paths.push(home.join(".codex-bridge.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
[upstream]
base_url = "http://localhost:9000/codex"

[cache]
ttl_secs = 60

[model_mapping]
default_codex = "gpt-5.1"

[model_mapping.claude_to_codex]
"claude-sonnet-4-20250514" = "gpt-5-codex-high"

[params]
drop = ["previous_response_id"]
"#
        )
        .unwrap();

        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.upstream.base_url, "http://localhost:9000/codex");
        assert_eq!(config.upstream.version, "0.21.0");
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(
            config.model_mapping.claude_to_codex.get("claude-sonnet-4-20250514"),
            Some(&"gpt-5-codex-high".to_string())
        );
        assert_eq!(config.model_mapping.default_codex.as_deref(), Some("gpt-5.1"));
        assert_eq!(config.params.drop, vec!["previous_response_id".to_string()]);
        assert_eq!(config.oauth.max_attempts, 3);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let f = NamedTempFile::new().unwrap();
        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.upstream.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.stream.max_line_bytes, 20_971_520);
        assert!(config.params.drop.contains(&"previous_response_id".to_string()));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[stream]\nchannel_capacity = 0").unwrap();
        let err = BridgeConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[test]
    fn test_explicit_missing_path_errors() {
        let err = BridgeConfig::find_and_load(Some(Path::new("/nonexistent/codex-bridge.toml")))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
