//! Environment overrides, applied on top of the file config.
//!
//! Booleans are true only for the literal `true`; anything else, including
//! `1` or `TRUE`, reads as false.

use crate::error::ConfigError;

use super::defaults::DEFAULT_GUEST_MODE_LIMIT;
use super::Config;

pub(super) fn apply_env_overrides<FEnv>(
    config: &mut Config,
    env_lookup: &FEnv,
) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(key) = env_lookup("CHATRELAY_API_KEY") {
        config.upstream.api_key = key.trim().to_string();
    }
    if let Some(url) = non_empty(env_lookup("CHATRELAY_BASE_URL")) {
        config.upstream.base_url = url;
    }
    if let Some(model) = non_empty(env_lookup("CHATRELAY_MODEL")) {
        config.upstream.model = model;
    }
    if let Some(prompt) = env_lookup("CHATRELAY_SYSTEM_PROMPT") {
        config.upstream.system_prompt = prompt;
    }
    if let Some(timeout) = env_lookup("CHATRELAY_API_TIMEOUT_SECS") {
        let parsed = timeout.trim().parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid CHATRELAY_API_TIMEOUT_SECS value `{timeout}`: expected positive integer seconds"
            ))
        })?;
        // Zero would disable the timeout entirely.
        config.upstream.timeout_secs = parsed.max(1);
    }

    if let Some(value) = env_lookup("CHATRELAY_REQUIRE_USER_API_KEY") {
        config.access.require_user_api_key = is_true(&value);
    }
    if let Some(value) = env_lookup("CHATRELAY_ALLOW_GUEST_MODE") {
        config.access.allow_guest_mode = is_true(&value);
    }
    if let Some(value) = env_lookup("CHATRELAY_GUEST_MODE_LIMIT") {
        config.access.guest_mode_limit = parse_guest_limit(&value);
    }

    if let Some(bind) = non_empty(env_lookup("CHATRELAY_BIND")) {
        config.server.bind = bind;
    }
    if let Some(url) = non_empty(env_lookup("CHATRELAY_RELAY_URL")) {
        config.client.relay_url = url;
    }
    Ok(())
}

fn is_true(value: &str) -> bool {
    value == "true"
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Unparseable or zero limits fall back to the default quota.
fn parse_guest_limit(value: &str) -> u32 {
    match value.trim().parse::<u32>() {
        Ok(0) | Err(_) => DEFAULT_GUEST_MODE_LIMIT,
        Ok(limit) => limit,
    }
}
