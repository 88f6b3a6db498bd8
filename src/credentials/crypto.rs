//! Machine-bound encryption-at-rest for the stored user key record.
//!
//! The record is sealed with AES-256-GCM-SIV under a key derived (scrypt)
//! from host/user/machine-id material and a per-record random salt. Copying
//! the state file to another machine therefore yields an unreadable record,
//! which the manager treats the same as a corrupt one: cleared and absent.

use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use scrypt::{scrypt, Params as ScryptParams};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::StoreError;
use super::UserKeyRecord;

const SEALED_RECORD_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const MACHINE_KEY_CONTEXT: &str = "chatrelay-user-key-v1";

#[cfg(not(test))]
const SCRYPT_LOG_N: u8 = 15;
#[cfg(test)]
const SCRYPT_LOG_N: u8 = 4;

/// On-disk form of an encrypted [`UserKeyRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SealedRecord {
    pub(crate) version: u32,
    pub(crate) salt: String,
    pub(crate) nonce: String,
    pub(crate) ciphertext: String,
}

pub(crate) fn seal_record(record: &UserKeyRecord) -> Result<SealedRecord, StoreError> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = derive_machine_key(&salt)?;

    let plaintext = serde_json::to_vec(record)?;
    let cipher = Aes256GcmSiv::new_from_slice(&key)
        .map_err(|_| StoreError::Invalid("invalid encryption key length".to_string()))?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| StoreError::Invalid("failed to encrypt user key record".to_string()))?;

    Ok(SealedRecord {
        version: SEALED_RECORD_VERSION,
        salt: B64.encode(salt),
        nonce: B64.encode(nonce),
        ciphertext: B64.encode(ciphertext),
    })
}

pub(crate) fn open_record(sealed: &SealedRecord) -> Result<UserKeyRecord, StoreError> {
    if sealed.version != SEALED_RECORD_VERSION {
        return Err(StoreError::Invalid(format!(
            "unsupported user key record version {}",
            sealed.version
        )));
    }
    let salt = decode_fixed::<SALT_LEN>(&sealed.salt, "salt")?;
    let nonce = decode_fixed::<NONCE_LEN>(&sealed.nonce, "nonce")?;
    let ciphertext = B64
        .decode(&sealed.ciphertext)
        .map_err(|err| StoreError::Invalid(format!("failed to decode ciphertext: {err}")))?;

    let key = derive_machine_key(&salt)?;
    let cipher = Aes256GcmSiv::new_from_slice(&key)
        .map_err(|_| StoreError::Invalid("invalid encryption key length".to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| {
            StoreError::Invalid(
                "failed to decrypt user key record (machine identity may have changed)"
                    .to_string(),
            )
        })?;
    Ok(serde_json::from_slice(&plaintext)?)
}

fn derive_machine_key(salt: &[u8; SALT_LEN]) -> Result<[u8; KEY_LEN], StoreError> {
    let mut hashed = Sha256::new();
    hashed.update(MACHINE_KEY_CONTEXT.as_bytes());
    hashed.update(machine_secret_material());
    hashed.update(salt);
    let seed = hashed.finalize();

    let params = ScryptParams::new(SCRYPT_LOG_N, 8, 1, KEY_LEN)
        .map_err(|err| StoreError::Invalid(format!("invalid scrypt parameters: {err}")))?;
    let mut key = [0u8; KEY_LEN];
    scrypt(&seed, salt, &params, &mut key)
        .map_err(|err| StoreError::Invalid(format!("failed to derive machine key: {err}")))?;
    Ok(key)
}

fn machine_secret_material() -> Vec<u8> {
    let hostname = hostname::get()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".to_string());
    let home = dirs::home_dir()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let machine_id = ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .find_map(|path| {
            std::fs::read_to_string(path)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_default();
    format!(
        "os={}|host={hostname}|user={username}|home={home}|machine_id={machine_id}",
        std::env::consts::OS
    )
    .into_bytes()
}

fn decode_fixed<const N: usize>(value: &str, field: &str) -> Result<[u8; N], StoreError> {
    let bytes = B64
        .decode(value)
        .map_err(|err| StoreError::Invalid(format!("failed to decode `{field}`: {err}")))?;
    if bytes.len() != N {
        return Err(StoreError::Invalid(format!(
            "invalid `{field}` length: expected {N}, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}
