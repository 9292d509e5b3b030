//! AES-256-GCM encryption of individual tree values.
//!
//! Every scalar in the tree is encrypted separately under the file's data
//! key, with the value's tree path as additional authenticated data. The
//! wire form is a self-describing token:
//!
//! ```text
//! ENC[AES256_GCM,data:<b64>,iv:<b64>,tag:<b64>,type:<t>]
//! ```

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;

use crate::error::{Result, SopsGitError};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Symmetric key protecting all values of one file.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey {
    key: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(SopsGitError::Crypto("invalid data key length".into()));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataKey(..)")
    }
}

static RE_ENC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ENC\[AES256_GCM,data:([^,]*),iv:([^,]*),tag:([^,]*),type:([a-z]+)\]$").unwrap()
});

/// Check whether a scalar carries the encrypted-value wire form.
pub fn is_encrypted_value(s: &str) -> bool {
    RE_ENC.is_match(s)
}

pub fn encrypt_value(key: &DataKey, plaintext: &[u8], value_type: &str, aad: &str) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| SopsGitError::Crypto(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| SopsGitError::Crypto(e.to_string()))?;
    let (data, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

    Ok(format!(
        "ENC[AES256_GCM,data:{},iv:{},tag:{},type:{}]",
        B64.encode(data),
        B64.encode(nonce_bytes),
        B64.encode(tag),
        value_type
    ))
}

pub fn decrypt_value(key: &DataKey, token: &str, aad: &str) -> Result<(Vec<u8>, String)> {
    let caps = RE_ENC
        .captures(token)
        .ok_or_else(|| SopsGitError::Crypto(format!("invalid encrypted value {token:?}")))?;
    let bad = |e| SopsGitError::Crypto(format!("invalid base64 in encrypted value: {e}"));
    let data = B64.decode(&caps[1]).map_err(bad)?;
    let iv = B64.decode(&caps[2]).map_err(bad)?;
    let tag = B64.decode(&caps[3]).map_err(bad)?;
    let value_type = caps[4].to_string();

    if iv.len() != NONCE_SIZE {
        return Err(SopsGitError::Crypto("invalid nonce length".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| SopsGitError::Crypto(e.to_string()))?;
    let mut sealed = data;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| SopsGitError::Crypto(format!("decryption failed: {e}")))?;
    Ok((plaintext, value_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = DataKey::generate();
        let token = encrypt_value(&key, b"hunter2", "str", "db:password:").unwrap();
        assert!(is_encrypted_value(&token));
        let (plain, ty) = decrypt_value(&key, &token, "db:password:").unwrap();
        assert_eq!(plain, b"hunter2");
        assert_eq!(ty, "str");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = DataKey::generate();
        let token = encrypt_value(&key, b"v", "str", "a:").unwrap();
        assert!(decrypt_value(&key, &token, "b:").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let key = DataKey::generate();
        let other = DataKey::generate();
        let token = encrypt_value(&key, b"v", "str", "a:").unwrap();
        assert!(decrypt_value(&other, &token, "a:").is_err());
    }

    #[test]
    fn plain_scalar_is_not_encrypted_value() {
        assert!(!is_encrypted_value("hello"));
        assert!(!is_encrypted_value("ENC[AES256_GCM,data:x]"));
    }
}
