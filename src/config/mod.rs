//! Configuration loading from TOML files and environment variables.
//!
//! Config is loaded in this order of precedence (highest wins):
//! 1. Environment variables (`CHATRELAY_*`), read once at start
//! 2. TOML file given via `--config`
//! 3. `./chatrelay.toml`
//! 4. `$XDG_CONFIG_HOME/chatrelay/chatrelay.toml` (or `~/.config/...`)
//! 5. Built-in defaults

use std::path::PathBuf;

mod defaults;
mod env;
mod loader;
mod sources;
mod types;

pub use loader::load_config;
pub use sources::ConfigSource;
pub use types::{AccessConfig, ClientConfig, Config, LoadedConfig, ServerConfig, UpstreamConfig};

/// Root directory for per-user config and client state.
pub fn config_root_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .or_else(dirs::config_dir)
}
