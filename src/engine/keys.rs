//! Data-key wrapping with age recipients.
//!
//! The per-file data key is encrypted once per recipient and the results
//! are stored in the file's metadata block. Decryption tries every local
//! identity against every stored entry until one unwraps.

use std::io::{Cursor, Read, Write};
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::error::{Result, SopsGitError};

use super::cipher::DataKey;

pub const ENV_AGE_KEY_FILE: &str = "SOPS_AGE_KEY_FILE";

/// One wrapped copy of the data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGroupEntry {
    pub recipient: String,
    pub enc: String,
}

/// Local source of age identities used to unwrap data keys.
#[derive(Debug, Clone, Default)]
pub struct KeySources {
    pub key_file: Option<PathBuf>,
}

impl KeySources {
    pub fn from_env() -> Self {
        Self {
            key_file: std::env::var_os(ENV_AGE_KEY_FILE).map(PathBuf::from),
        }
    }

    fn key_file_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.key_file {
            return Ok(path.clone());
        }
        let conf = dirs::config_dir()
            .ok_or_else(|| SopsGitError::Other("cannot determine user config directory".into()))?;
        Ok(conf.join("sops").join("age").join("keys.txt"))
    }

    pub fn identities(&self) -> Result<Vec<age::x25519::Identity>> {
        let path = self.key_file_path()?;
        let data = std::fs::read_to_string(&path)
            .map_err(|e| SopsGitError::Other(format!("failed to open file {}: {e}", path.display())))?;
        let mut ids = Vec::new();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Ok(id) = line.parse::<age::x25519::Identity>() {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return Err(SopsGitError::Other(format!(
                "no age identities found in {}",
                path.display()
            )));
        }
        Ok(ids)
    }

    /// The recipient string must occur in the key file, customarily as a
    /// `# public key: age1...` comment written by age-keygen.
    pub fn validate_recipients(&self, recipients: &str) -> Result<()> {
        if recipients.is_empty() {
            return Err(SopsGitError::InvalidRecipients);
        }
        let path = self.key_file_path()?;
        let data = std::fs::read_to_string(&path)
            .map_err(|e| SopsGitError::Other(format!("failed to open file {}: {e}", path.display())))?;
        for recipient in split_recipients(recipients) {
            if !data.contains(recipient) {
                return Err(SopsGitError::InvalidRecipients);
            }
        }
        Ok(())
    }
}

pub fn split_recipients(recipients: &str) -> impl Iterator<Item = &str> {
    recipients
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Encrypt the data key for every recipient in the comma-separated list.
pub fn wrap_data_key(key: &DataKey, recipients: &str) -> Result<Vec<KeyGroupEntry>> {
    let mut entries = Vec::new();
    for spec in split_recipients(recipients) {
        let recipient: age::x25519::Recipient = spec
            .parse()
            .map_err(|e| SopsGitError::Crypto(format!("invalid age recipient {spec:?}: {e}")))?;

        let encryptor = age::Encryptor::with_recipients(std::iter::once(&recipient as _))
            .map_err(|e| SopsGitError::Crypto(format!("age encryption failed: {e}")))?;
        let mut ciphertext = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut ciphertext)
            .map_err(|e| SopsGitError::Crypto(format!("age encryption failed: {e}")))?;
        writer.write_all(key.as_bytes())?;
        writer
            .finish()
            .map_err(|e| SopsGitError::Crypto(format!("age encryption failed: {e}")))?;

        entries.push(KeyGroupEntry {
            recipient: spec.to_string(),
            enc: B64.encode(&ciphertext),
        });
    }
    if entries.is_empty() {
        return Err(SopsGitError::InvalidRecipients);
    }
    Ok(entries)
}

/// Try to unwrap the data key from any entry with any local identity.
pub fn unwrap_data_key(entries: &[KeyGroupEntry], sources: &KeySources) -> Result<DataKey> {
    let identities = sources.identities()?;
    for entry in entries {
        let Ok(ciphertext) = B64.decode(&entry.enc) else {
            continue;
        };
        let Ok(decryptor) = age::Decryptor::new_buffered(Cursor::new(&ciphertext)) else {
            continue;
        };
        let ids = identities.iter().map(|id| id as &dyn age::Identity);
        let Ok(mut reader) = decryptor.decrypt(ids) else {
            continue;
        };
        let mut plaintext = Vec::new();
        if reader.read_to_end(&mut plaintext).is_ok() {
            if let Ok(key) = DataKey::from_bytes(&plaintext) {
                return Ok(key);
            }
        }
    }
    Err(SopsGitError::NoDataKey)
}
