//! Configuration data model.
//!
//! Every section derives `Deserialize` with `#[serde(default)]`, so a partial
//! `chatrelay.toml` only overrides the keys it names.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::defaults::{
    DEFAULT_API_BASE_URL, DEFAULT_API_TIMEOUT_SECS, DEFAULT_BIND_ADDR, DEFAULT_GUEST_MODE_LIMIT,
    DEFAULT_MAX_TOKENS, DEFAULT_MODEL_ID, DEFAULT_RELAY_URL, DEFAULT_SYSTEM_PROMPT,
    DEFAULT_TEMPERATURE,
};
use super::sources::ConfigSource;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub access: AccessConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

/// Provider connection and sampling settings used by the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Server-held key used for guest-mode requests. Never sent to clients.
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Empty disables the system message.
    pub system_prompt: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.into(),
            api_key: String::new(),
            model: DEFAULT_MODEL_ID.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Credential policy: who may send, and how much guest usage is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub require_user_api_key: bool,
    pub allow_guest_mode: bool,
    pub guest_mode_limit: u32,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            require_user_api_key: false,
            allow_guest_mode: false,
            guest_mode_limit: DEFAULT_GUEST_MODE_LIMIT,
        }
    }
}

/// Relay server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND_ADDR.into(),
        }
    }
}

/// Terminal chat client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub relay_url: String,
    /// Ask the relay for a streamed response.
    pub stream: bool,
    /// Override for the persisted client-state directory.
    pub state_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.into(),
            stream: true,
            state_dir: None,
        }
    }
}

/// Loaded config plus where it came from, for startup logging.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: ConfigSource,
}
