//! Error types for the bridge.
//!
//! Only transport, refresh and configuration failures surface as `Err`.
//! Upstream application errors are turned into client-format payloads by the
//! executor and returned as successful results.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Token refresh failed: {message}")]
    Refresh { message: String },

    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("Stream error: {message}")]
    Stream { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn refresh(msg: impl Into<String>) -> Self {
        Self::Refresh {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream {
            message: msg.into(),
        }
    }

    /// Whether this error came from the HTTP transport rather than from
    /// anything the upstream said.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
