//! Credential resolution, key validation, and persisted client state.
//!
//! Resolution order for one send:
//! 1. `require_user_api_key` set and no user key: fail (checked first).
//! 2. A stored user key wins, regardless of guest quota.
//! 3. Guest mode enabled and usage below quota: guest credential.
//! 4. Otherwise: no credential.
//!
//! Resolution is a pure read. Counting guest usage is the caller's job after
//! a successful send.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::AccessConfig;
use crate::error::CredentialError;

mod crypto;
mod error;
mod manager;
mod store;

pub use error::StoreError;
pub use manager::CredentialManager;
pub use store::{FileStore, KeyValueStore, MemoryStore, CLIENT_STATE_FILE};

/// Shortest user key accepted by [`validate_api_key`].
pub const MIN_API_KEY_LEN: usize = 10;

/// Where a credential's key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    UserSupplied,
    GuestQuota,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserSupplied => write!(f, "user-supplied"),
            Self::GuestQuota => write!(f, "guest-quota"),
        }
    }
}

/// A user-supplied key as persisted client-side.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserKeyRecord {
    pub api_key: String,
    pub base_url: String,
    /// Save time in Unix epoch milliseconds.
    pub timestamp: u64,
}

impl fmt::Debug for UserKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserKeyRecord")
            .field("api_key", &key_fingerprint(&self.api_key))
            .field("base_url", &self.base_url)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Outcome of resolution. Guest resolution carries no key: the guest key
/// lives with the relay and never reaches the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    User(UserKeyRecord),
    Guest,
}

impl Resolution {
    pub fn source(&self) -> CredentialSource {
        match self {
            Self::User(_) => CredentialSource::UserSupplied,
            Self::Guest => CredentialSource::GuestQuota,
        }
    }
}

/// Resolve which credential a send would use. Total over all inputs.
pub fn resolve_credential(
    policy: &AccessConfig,
    user: Option<&UserKeyRecord>,
    usage_count: u32,
) -> Result<Resolution, CredentialError> {
    let user = user.filter(|record| !record.api_key.trim().is_empty());
    if policy.require_user_api_key && user.is_none() {
        return Err(CredentialError::UserKeyRequired);
    }
    if let Some(record) = user {
        return Ok(Resolution::User(record.clone()));
    }
    if policy.allow_guest_mode && usage_count < policy.guest_mode_limit {
        return Ok(Resolution::Guest);
    }
    Err(CredentialError::NoCredential)
}

/// Guest sends left, or 0 when guest mode is off.
pub fn remaining_guest_messages(policy: &AccessConfig, usage_count: u32) -> u32 {
    if !policy.allow_guest_mode {
        return 0;
    }
    policy.guest_mode_limit.saturating_sub(usage_count)
}

/// Basic format check for a user-submitted key.
pub fn validate_api_key(candidate: &str) -> Result<(), CredentialError> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err(CredentialError::InvalidFormat(
            "API key is required".to_string(),
        ));
    }
    if trimmed.chars().count() < MIN_API_KEY_LEN {
        return Err(CredentialError::InvalidFormat(
            "API key appears to be too short".to_string(),
        ));
    }
    Ok(())
}

/// Concrete key + endpoint used for one upstream call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub api_key: String,
    pub base_url: String,
    pub source: CredentialSource,
}

impl Credential {
    /// Materialize a resolution on the relay side, where the guest key lives.
    ///
    /// `default_base_url` fills in user records saved without one.
    pub fn materialize(
        resolution: Resolution,
        default_base_url: &str,
        guest_api_key: &str,
    ) -> Result<Self, CredentialError> {
        match resolution {
            Resolution::User(record) => {
                let base_url = if record.base_url.trim().is_empty() {
                    default_base_url.to_string()
                } else {
                    record.base_url
                };
                Ok(Self {
                    api_key: record.api_key,
                    base_url,
                    source: CredentialSource::UserSupplied,
                })
            }
            Resolution::Guest => {
                if guest_api_key.trim().is_empty() {
                    return Err(CredentialError::GuestKeyMissing);
                }
                Ok(Self {
                    api_key: guest_api_key.to_string(),
                    base_url: default_base_url.to_string(),
                    source: CredentialSource::GuestQuota,
                })
            }
        }
    }

    /// Short, non-reversible tag suitable for logs.
    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.api_key)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &self.fingerprint())
            .field("base_url", &self.base_url)
            .field("source", &self.source)
            .finish()
    }
}

/// First 8 hex digits of the key's SHA-256.
pub fn key_fingerprint(api_key: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(api_key.as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("sha256:{hex}")
}
