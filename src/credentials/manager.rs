//! Client-side credential context: user key record plus guest usage counter.
//!
//! One manager is built at startup and handed to the chat session, so every
//! component that needs credential resolution or usage tracking reads the
//! same store and policy.

use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use super::crypto::{open_record, seal_record, SealedRecord};
use super::error::StoreError;
use super::store::KeyValueStore;
use super::{remaining_guest_messages, resolve_credential, validate_api_key};
use super::{Resolution, UserKeyRecord};
use crate::config::AccessConfig;
use crate::error::CredentialError;

/// Fixed store key holding the sealed user key record.
pub const USER_API_KEY_STORAGE_KEY: &str = "chatrelay_user_api_key";
/// Fixed store key holding the guest usage counter.
pub const USAGE_COUNT_STORAGE_KEY: &str = "chatrelay_usage_count";

/// Credential policy bound to a persisted store.
#[derive(Debug)]
pub struct CredentialManager<S: KeyValueStore> {
    policy: AccessConfig,
    default_base_url: String,
    store: S,
}

impl<S: KeyValueStore> CredentialManager<S> {
    pub fn new(policy: AccessConfig, default_base_url: impl Into<String>, store: S) -> Self {
        Self {
            policy,
            default_base_url: default_base_url.into(),
            store,
        }
    }

    pub fn policy(&self) -> &AccessConfig {
        &self.policy
    }

    /// Which credential the next send would use.
    pub fn resolve(&mut self) -> Result<Resolution, CredentialError> {
        let user = self.user_api_key()?;
        let usage = self.usage_count()?;
        resolve_credential(&self.policy, user.as_ref(), usage)
    }

    /// True iff [`Self::resolve`] would currently succeed.
    pub fn can_send(&mut self) -> bool {
        self.resolve().is_ok()
    }

    /// Validate and persist a user key. `base_url` defaults to the
    /// configured upstream base URL.
    pub fn set_user_api_key(
        &mut self,
        api_key: &str,
        base_url: Option<&str>,
    ) -> Result<UserKeyRecord, CredentialError> {
        validate_api_key(api_key)?;
        let base_url = base_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.default_base_url)
            .trim_end_matches('/')
            .to_string();
        let record = UserKeyRecord {
            api_key: api_key.trim().to_string(),
            base_url,
            timestamp: now_millis(),
        };
        let sealed = seal_record(&record)?;
        self.store.set(
            USER_API_KEY_STORAGE_KEY,
            serde_json::to_value(sealed).map_err(StoreError::from)?,
        )?;
        tracing::info!(
            key = %super::key_fingerprint(&record.api_key),
            base_url = %record.base_url,
            "stored user api key"
        );
        Ok(record)
    }

    /// The stored user key, if any. An undecodable record is cleared.
    pub fn user_api_key(&mut self) -> Result<Option<UserKeyRecord>, CredentialError> {
        let Some(value) = self.store.get(USER_API_KEY_STORAGE_KEY)? else {
            return Ok(None);
        };
        let opened = serde_json::from_value::<SealedRecord>(value)
            .map_err(StoreError::from)
            .and_then(|sealed| open_record(&sealed));
        match opened {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!(error = %err, "discarding unreadable user api key record");
                self.store.remove(USER_API_KEY_STORAGE_KEY)?;
                Ok(None)
            }
        }
    }

    pub fn has_user_api_key(&mut self) -> bool {
        matches!(self.user_api_key(), Ok(Some(record)) if !record.api_key.is_empty())
    }

    pub fn clear_user_api_key(&mut self) -> Result<(), CredentialError> {
        self.store.remove(USER_API_KEY_STORAGE_KEY)?;
        Ok(())
    }

    /// Guest sends consumed so far. Unparseable values read as 0.
    pub fn usage_count(&self) -> Result<u32, CredentialError> {
        let count = self
            .store
            .get(USAGE_COUNT_STORAGE_KEY)?
            .and_then(|value| match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            })
            .unwrap_or(0);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Record one successful guest send and return the new count.
    pub fn increment_usage(&mut self) -> Result<u32, CredentialError> {
        let next = self.usage_count()?.saturating_add(1);
        self.store.set(USAGE_COUNT_STORAGE_KEY, Value::from(next))?;
        Ok(next)
    }

    pub fn reset_usage(&mut self) -> Result<(), CredentialError> {
        self.store.remove(USAGE_COUNT_STORAGE_KEY)?;
        Ok(())
    }

    pub fn remaining_guest_messages(&self) -> Result<u32, CredentialError> {
        Ok(remaining_guest_messages(&self.policy, self.usage_count()?))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
