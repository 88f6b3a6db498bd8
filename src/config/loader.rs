//! Top-level config loading pipeline.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::env::apply_env_overrides;
use super::sources::read_config_text_with_sources;
use super::{config_root_dir, Config, LoadedConfig};

/// Load configuration from disk and environment.
///
/// `path_override` is an explicit config file path (from `--config`).
pub fn load_config(path_override: Option<&str>) -> Result<LoadedConfig, ConfigError> {
    load_config_from_sources(
        path_override,
        |path| std::fs::read_to_string(path),
        |name| std::env::var(name).ok(),
        config_root_dir,
    )
}

pub(super) fn load_config_from_sources<FRead, FEnv, FRoot>(
    path_override: Option<&str>,
    read_file: FRead,
    env_lookup: FEnv,
    config_root: FRoot,
) -> Result<LoadedConfig, ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FEnv: Fn(&str) -> Option<String>,
    FRoot: Fn() -> Option<PathBuf>,
{
    let (config_text, source) =
        read_config_text_with_sources(path_override, &read_file, &config_root)?;
    let mut config: Config = toml::from_str(&config_text)?;
    apply_env_overrides(&mut config, &env_lookup)?;
    validate(&config)?;
    Ok(LoadedConfig { config, source })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.upstream.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "upstream.base_url must not be empty".to_string(),
        ));
    }
    if config.upstream.model.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "upstream.model must not be empty".to_string(),
        ));
    }
    if !(0.0..=2.0).contains(&config.upstream.temperature) {
        return Err(ConfigError::Invalid(format!(
            "upstream.temperature {} is outside 0.0..=2.0",
            config.upstream.temperature
        )));
    }
    if config.upstream.max_tokens == 0 {
        return Err(ConfigError::Invalid(
            "upstream.max_tokens must be positive".to_string(),
        ));
    }
    Ok(())
}
