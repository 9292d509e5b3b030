//! Cryptographic tree engine.
//!
//! Three operations make up the public surface: [`encrypt_tree`],
//! [`decrypt_tree`] and [`extract_metadata`]. Callers hand over raw bytes,
//! the engine parses them with its own store, encrypts or decrypts every
//! scalar under the file's data key, and serializes back. The store is not
//! surface-preserving; the mangler owns that concern.

pub mod cipher;
pub mod keys;
pub mod store;

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, SopsGitError};

pub use cipher::DataKey;
pub use keys::{KeyGroupEntry, KeySources};
pub use store::{Branch, Item, Node, Scalar};

/// Top-level key reserved for the metadata block.
pub const METADATA_KEY: &str = "sops";

/// Comments carrying this suffix are encrypted along with the values.
pub const ENCRYPTED_COMMENT_TAG: &str = "∉∌";

/// File metadata: the data key, its wrapped copies, and bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub data_key: Option<DataKey>,
    pub key_groups: Vec<KeyGroupEntry>,
    pub last_modified: Option<DateTime<Utc>>,
    pub shamir_threshold: u32,
    pub version: String,
    /// Raw encrypted MAC token as read from the file.
    pub mac_token: Option<String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }
}

/// Serialize and encrypt a plaintext tree. `meta.data_key` and
/// `meta.key_groups` must be populated by the caller.
pub fn encrypt_tree(mut branch: Branch, meta: &Metadata, indent: usize) -> Result<Vec<u8>> {
    let key = meta
        .data_key
        .as_ref()
        .ok_or_else(|| SopsGitError::Crypto("no data key to encrypt with".into()))?;

    let mut mac = Sha256::new();
    encrypt_branch(&mut branch, key, &mut Vec::new(), &mut mac)?;

    let mac_hex = format!("{:x}", mac.finalize());
    let mac_token = cipher::encrypt_value(key, mac_hex.as_bytes(), "str", "")?;
    branch.push(Item::Pair {
        key: METADATA_KEY.to_string(),
        value: metadata_node(meta, &mac_token),
    });

    Ok(store::emit(&branch, indent).into_bytes())
}

/// Parse and decrypt an encrypted tree, returning the plaintext branch and
/// the recovered metadata (data key unwrapped).
pub fn decrypt_tree(
    input: &[u8],
    sources: &KeySources,
    ignore_mac: bool,
) -> Result<(Branch, Metadata)> {
    let text = String::from_utf8_lossy(input);
    let mut branch = parse_for_metadata(&text)?;
    let meta = take_metadata(&mut branch, sources)?;
    let key = meta.data_key.as_ref().expect("unwrapped above");

    let mut mac = Sha256::new();
    decrypt_branch(&mut branch, key, &mut Vec::new(), &mut mac)?;

    if !ignore_mac {
        let (stored_mac, _) = cipher::decrypt_value(key, &meta_mac(&meta), "")?;
        let computed = format!("{:x}", mac.finalize());
        if !stored_mac.eq_ignore_ascii_case(computed.as_bytes()) {
            return Err(SopsGitError::MacMismatch);
        }
    }

    Ok((branch, meta))
}

/// Read the metadata block of an encrypted file and unwrap its data key.
/// Returns `MetadataNotFound` when the file carries no metadata.
pub fn extract_metadata(input: &[u8], sources: &KeySources) -> Result<Metadata> {
    let text = String::from_utf8_lossy(input);
    let mut branch = parse_for_metadata(&text)?;
    take_metadata(&mut branch, sources)
}

/// Documents that parse but cannot hold a metadata block (non-mapping
/// roots) count as plaintext rather than as parse failures.
fn parse_for_metadata(text: &str) -> Result<Branch> {
    match store::parse(text) {
        Ok(branch) => Ok(branch),
        Err(SopsGitError::Yaml(msg)) if msg.contains("top-level") => {
            Err(SopsGitError::MetadataNotFound)
        }
        Err(e) => Err(e),
    }
}

/// Check whether a parsed branch already carries a metadata block.
pub fn has_metadata(branch: &Branch) -> bool {
    branch
        .iter()
        .any(|item| matches!(item, Item::Pair { key, .. } if key == METADATA_KEY))
}

// stash of the raw mac token so decrypt_tree can verify after walking
fn meta_mac(meta: &Metadata) -> String {
    meta.mac_token.clone().unwrap_or_default()
}

fn encrypt_branch(
    branch: &mut Branch,
    key: &DataKey,
    path: &mut Vec<String>,
    mac: &mut Sha256,
) -> Result<()> {
    for item in branch.iter_mut() {
        match item {
            Item::Comment(text) => {
                if text.ends_with(ENCRYPTED_COMMENT_TAG) {
                    let token = cipher::encrypt_value(key, text.as_bytes(), "comment", &aad(path))?;
                    *text = token;
                }
            }
            Item::Pair { key: k, value } => {
                path.push(k.clone());
                encrypt_node(value, key, path, mac)?;
                path.pop();
            }
        }
    }
    Ok(())
}

fn encrypt_node(
    node: &mut Node,
    key: &DataKey,
    path: &mut Vec<String>,
    mac: &mut Sha256,
) -> Result<()> {
    match node {
        // nulls stay in the clear: the bare-key and tilde surface forms
        // are re-derived from the emitted file on the next mangle pass
        Node::Scalar(Scalar::Null) => {}
        Node::Scalar(s) => {
            let (bytes, ty) = scalar_wire(s);
            mac.update(&bytes);
            let token = cipher::encrypt_value(key, &bytes, ty, &aad(path))?;
            *node = Node::Scalar(Scalar::Str(token));
        }
        Node::Map(branch) => encrypt_branch(branch, key, path, mac)?,
        Node::Seq(items) => {
            for item in items.iter_mut() {
                if let Node::Comment(text) = item {
                    if text.ends_with(ENCRYPTED_COMMENT_TAG) {
                        let token =
                            cipher::encrypt_value(key, text.as_bytes(), "comment", &aad(path))?;
                        *text = token;
                    }
                    continue;
                }
                encrypt_node(item, key, path, mac)?;
            }
        }
        Node::Comment(_) => {}
    }
    Ok(())
}

fn decrypt_branch(
    branch: &mut Branch,
    key: &DataKey,
    path: &mut Vec<String>,
    mac: &mut Sha256,
) -> Result<()> {
    for item in branch.iter_mut() {
        match item {
            Item::Comment(text) => {
                if cipher::is_encrypted_value(text) {
                    let (plain, _) = cipher::decrypt_value(key, text, &aad(path))?;
                    *text = String::from_utf8_lossy(&plain).into_owned();
                }
            }
            Item::Pair { key: k, value } => {
                path.push(k.clone());
                decrypt_node(value, key, path, mac)?;
                path.pop();
            }
        }
    }
    Ok(())
}

fn decrypt_node(
    node: &mut Node,
    key: &DataKey,
    path: &mut Vec<String>,
    mac: &mut Sha256,
) -> Result<()> {
    match node {
        Node::Scalar(Scalar::Str(s)) if cipher::is_encrypted_value(s) => {
            let (plain, ty) = cipher::decrypt_value(key, s, &aad(path))?;
            mac.update(&plain);
            *node = Node::Scalar(scalar_from_wire(&plain, &ty)?);
        }
        Node::Scalar(s) => {
            // value left plaintext by a partial encryption; still MACed
            let (bytes, _) = scalar_wire(s);
            mac.update(&bytes);
        }
        Node::Map(branch) => decrypt_branch(branch, key, path, mac)?,
        Node::Seq(items) => {
            for item in items.iter_mut() {
                if let Node::Comment(text) = item {
                    if cipher::is_encrypted_value(text) {
                        let (plain, _) = cipher::decrypt_value(key, text, &aad(path))?;
                        *text = String::from_utf8_lossy(&plain).into_owned();
                    }
                    continue;
                }
                decrypt_node(item, key, path, mac)?;
            }
        }
        Node::Comment(_) => {}
    }
    Ok(())
}

fn aad(path: &[String]) -> String {
    let mut s = path.join(":");
    if !s.is_empty() {
        s.push(':');
    }
    s
}

fn scalar_wire(s: &Scalar) -> (Vec<u8>, &'static str) {
    match s {
        Scalar::Null => (Vec::new(), "null"),
        Scalar::Bool(b) => (b.to_string().into_bytes(), "bool"),
        Scalar::Int(n) => (n.to_string().into_bytes(), "int"),
        Scalar::Float(f) => (f.to_string().into_bytes(), "float"),
        Scalar::Str(v) => (v.clone().into_bytes(), "str"),
    }
}

fn scalar_from_wire(bytes: &[u8], ty: &str) -> Result<Scalar> {
    let text = String::from_utf8_lossy(bytes);
    Ok(match ty {
        "null" => Scalar::Null,
        "bool" => Scalar::Bool(text == "true"),
        "int" => Scalar::Int(
            text.parse()
                .map_err(|e| SopsGitError::Crypto(format!("invalid int value: {e}")))?,
        ),
        "float" => Scalar::Float(
            text.parse()
                .map_err(|e| SopsGitError::Crypto(format!("invalid float value: {e}")))?,
        ),
        "str" | "comment" => Scalar::Str(text.into_owned()),
        other => {
            return Err(SopsGitError::Crypto(format!("unknown value type {other:?}")));
        }
    })
}

// ---------------------------------------------------------------------------
// metadata block

fn metadata_node(meta: &Metadata, mac_token: &str) -> Node {
    let mut branch = Vec::new();

    let mut age_items = Vec::new();
    for entry in &meta.key_groups {
        age_items.push(Node::Map(vec![
            Item::Pair {
                key: "recipient".into(),
                value: Node::Scalar(Scalar::Str(entry.recipient.clone())),
            },
            Item::Pair {
                key: "enc".into(),
                value: Node::Scalar(Scalar::Str(entry.enc.clone())),
            },
        ]));
    }
    branch.push(Item::Pair {
        key: "age".into(),
        value: Node::Seq(age_items),
    });

    if let Some(when) = meta.last_modified {
        branch.push(Item::Pair {
            key: "lastmodified".into(),
            value: Node::Scalar(Scalar::Str(
                when.to_rfc3339_opts(SecondsFormat::Secs, true),
            )),
        });
    }
    branch.push(Item::Pair {
        key: "mac".into(),
        value: Node::Scalar(Scalar::Str(mac_token.to_string())),
    });
    if meta.shamir_threshold > 0 {
        branch.push(Item::Pair {
            key: "shamir_threshold".into(),
            value: Node::Scalar(Scalar::Int(meta.shamir_threshold as i64)),
        });
    }
    branch.push(Item::Pair {
        key: "version".into(),
        value: Node::Scalar(Scalar::Str(meta.version.clone())),
    });

    Node::Map(branch)
}

fn take_metadata(branch: &mut Branch, sources: &KeySources) -> Result<Metadata> {
    let idx = branch
        .iter()
        .position(|item| matches!(item, Item::Pair { key, .. } if key == METADATA_KEY))
        .ok_or(SopsGitError::MetadataNotFound)?;
    let Item::Pair { value, .. } = branch.remove(idx) else {
        unreachable!()
    };
    let Node::Map(fields) = value else {
        return Err(SopsGitError::Yaml("metadata block must be a mapping".into()));
    };

    let mut meta = Metadata::new();
    for item in fields {
        let Item::Pair { key, value } = item else {
            continue;
        };
        match (key.as_str(), value) {
            ("age", Node::Seq(items)) => {
                for entry in items {
                    let Node::Map(pairs) = entry else { continue };
                    let mut recipient = String::new();
                    let mut enc = String::new();
                    for pair in pairs {
                        if let Item::Pair {
                            key,
                            value: Node::Scalar(Scalar::Str(v)),
                        } = pair
                        {
                            match key.as_str() {
                                "recipient" => recipient = v,
                                "enc" => enc = v,
                                _ => {}
                            }
                        }
                    }
                    meta.key_groups.push(KeyGroupEntry { recipient, enc });
                }
            }
            ("lastmodified", Node::Scalar(Scalar::Str(v))) => {
                meta.last_modified = DateTime::parse_from_rfc3339(&v)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            }
            ("mac", Node::Scalar(Scalar::Str(v))) => meta.mac_token = Some(v),
            ("shamir_threshold", Node::Scalar(Scalar::Int(v))) => {
                meta.shamir_threshold = v.max(0) as u32;
            }
            ("version", Node::Scalar(Scalar::Str(v))) => meta.version = v,
            _ => {}
        }
    }

    let data_key = keys::unwrap_data_key(&meta.key_groups, sources)?;
    debug!(recipients = meta.key_groups.len(), "unwrapped data key");
    meta.data_key = Some(data_key);
    Ok(meta)
}

// ---------------------------------------------------------------------------
// key renaming

/// Apply a `{from -> to}` rename map to every string key in the tree.
/// Comment items are left alone. Idempotent when no `from` key remains.
pub fn rename_keys(branch: &mut Branch, renames: &HashMap<String, String>) {
    if renames.is_empty() {
        return;
    }
    let mut count = 0usize;
    rename_branch(branch, renames, &mut count);
    if count > 0 {
        debug!(count, "renamed tree keys");
    }
}

fn rename_branch(branch: &mut Branch, renames: &HashMap<String, String>, count: &mut usize) {
    for item in branch.iter_mut() {
        if let Item::Pair { key, value } = item {
            if let Some(new_key) = renames.get(key) {
                *key = new_key.clone();
                *count += 1;
            }
            rename_node(value, renames, count);
        }
    }
}

fn rename_node(node: &mut Node, renames: &HashMap<String, String>, count: &mut usize) {
    match node {
        Node::Map(branch) => rename_branch(branch, renames, count),
        Node::Seq(items) => {
            for item in items.iter_mut() {
                rename_node(item, renames, count);
            }
        }
        _ => {}
    }
}
