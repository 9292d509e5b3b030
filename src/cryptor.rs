//! Per-file encryption and decryption around the tree engine, wrapped by
//! the mangler on both sides.
//!
//! "Already encrypted" and "already plaintext" are flow signals, not
//! errors: callers get an [`Outcome`] and decide what passing the bytes
//! through means for them.

use tracing::debug;

use crate::config::FileOptions;
use crate::engine::{self, keys, DataKey, Metadata};
use crate::error::{Result, SopsGitError};

/// Result of a per-file transform.
pub enum Outcome {
    /// The engine produced new bytes.
    Transformed(Vec<u8>),
    /// The file was already in the requested state; echo the input.
    PassThrough,
}

impl Outcome {
    /// The transformed bytes, or the input when passed through.
    pub fn into_bytes(self, input: &[u8]) -> Vec<u8> {
        match self {
            Outcome::Transformed(bytes) => bytes,
            Outcome::PassThrough => input.to_vec(),
        }
    }
}

/// Encrypt one file. Reuses `fopts.meta.data_key` when the caller supplied
/// parent metadata; otherwise generates a fresh key and wraps it for the
/// configured recipients.
pub fn encrypt_file(fopts: &mut FileOptions, input: &[u8]) -> Result<Outcome> {
    let opts = &fopts.opts;
    let mangled = opts.mangle.mangle(input, &fopts.path, true);
    let text = String::from_utf8_lossy(&mangled);
    let mut branch = engine::store::parse(&text)?;

    // ensure no metadata
    if engine::has_metadata(&branch) {
        return Ok(Outcome::PassThrough);
    }

    engine::rename_keys(&mut branch, &opts.rename_keys);

    // reuse or generate the data key
    if fopts.meta.data_key.is_none() {
        if opts.age_recipients.is_empty() {
            return Err(SopsGitError::InvalidRecipients);
        }
        let data_key = DataKey::generate();
        fopts.meta.key_groups = keys::wrap_data_key(&data_key, &opts.age_recipients)?;
        fopts.meta.data_key = Some(data_key);
        debug!(path = %fopts.path, "generated data key");
    }

    let output = engine::encrypt_tree(branch, &fopts.meta, opts.indent)?;
    let output = opts.mangle.demangle(&output, &fopts.path, true)?;
    Ok(Outcome::Transformed(output))
}

/// Decrypt one file. A file without a metadata block is already plaintext
/// and passes through. On success the recovered metadata lands in
/// `fopts.meta` so callers can reuse the data key.
pub fn decrypt_file(fopts: &mut FileOptions, input: &[u8]) -> Result<Outcome> {
    let opts = &fopts.opts;
    let mangled = opts.mangle.mangle(input, &fopts.path, false);
    let (mut branch, meta) =
        match engine::decrypt_tree(&mangled, &opts.key_sources, opts.ignore_mac) {
            Ok(done) => done,
            Err(SopsGitError::MetadataNotFound) => return Ok(Outcome::PassThrough),
            Err(e) => return Err(e),
        };

    engine::rename_keys(&mut branch, &opts.rename_keys);
    let output = engine::store::emit(&branch, opts.indent).into_bytes();
    let output = opts.mangle.demangle(&output, &fopts.path, false)?;
    fopts.meta = meta;
    Ok(Outcome::Transformed(output))
}

/// Read the metadata of an encrypted file, unwrapping its data key.
pub fn extract_metadata(fopts: &FileOptions, data: &[u8]) -> Result<Metadata> {
    engine::extract_metadata(data, &fopts.opts.key_sources)
}

/// An unresolved three-way merge leaves conflict markers that no YAML
/// parser accepts; such input passes through untouched.
pub fn is_merge_conflict(err: &SopsGitError, input: &[u8]) -> bool {
    if !matches!(err, SopsGitError::Yaml(_)) {
        return false;
    }
    let contains = |needle: &[u8]| input.windows(needle.len()).any(|w| w == needle);
    contains(b"<<<<<<< CURRENT") && contains(b">>>>>>> OTHER")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::engine::KeySources;
    use crate::mangle::MangleOptions;
    use std::collections::HashMap;
    use std::io::Write as _;

    fn age_setup() -> (tempfile::TempDir, KeySources, String) {
        use age::secrecy::ExposeSecret;
        let identity = age::x25519::Identity::generate();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keys.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "# public key: {}", identity.to_public()).unwrap();
        writeln!(f, "{}", identity.to_string().expose_secret()).unwrap();
        let sources = KeySources {
            key_file: Some(path),
        };
        (dir, sources, identity.to_public().to_string())
    }

    fn options(sources: KeySources, recipient: &str, mangle: &str) -> Options {
        Options {
            age_recipients: recipient.to_string(),
            indent: 2,
            ignore_mac: false,
            file_modtime: false,
            shamir_threshold: 0,
            rename_keys: HashMap::new(),
            rename_keys_raw: String::new(),
            mangle: MangleOptions::new(mangle, "", "").unwrap(),
            key_sources: sources,
        }
    }

    #[test]
    fn encrypt_then_decrypt_restores_surface_form() {
        let (_dir, sources, recipient) = age_setup();
        let opts = options(sources, &recipient, "true");
        let doc = "---\nuser: admin\npass: \"secret value\"\nport: 0123\nempty:\n";

        let mut fopts = opts.for_path("conf.yaml");
        let encrypted = match encrypt_file(&mut fopts, doc.as_bytes()).unwrap() {
            Outcome::Transformed(bytes) => bytes,
            Outcome::PassThrough => panic!("should have encrypted"),
        };
        let text = String::from_utf8_lossy(&encrypted);
        assert!(text.starts_with("---\n"));
        assert!(text.contains("ENC[AES256_GCM,"));
        assert!(!text.contains("secret value"));

        let mut fopts = opts.for_path("conf.yaml");
        let decrypted = match decrypt_file(&mut fopts, &encrypted).unwrap() {
            Outcome::Transformed(bytes) => bytes,
            Outcome::PassThrough => panic!("should have decrypted"),
        };
        assert_eq!(String::from_utf8_lossy(&decrypted), doc);
        assert!(fopts.meta.data_key.is_some());
    }

    #[test]
    fn double_encrypt_passes_through() {
        let (_dir, sources, recipient) = age_setup();
        let opts = options(sources, &recipient, "true");
        let mut fopts = opts.for_path("conf.yaml");
        let encrypted = encrypt_file(&mut fopts, b"a: 1\n")
            .unwrap()
            .into_bytes(b"a: 1\n");

        let mut fopts = opts.for_path("conf.yaml");
        assert!(matches!(
            encrypt_file(&mut fopts, &encrypted).unwrap(),
            Outcome::PassThrough
        ));
    }

    #[test]
    fn decrypt_of_plaintext_passes_through() {
        let (_dir, sources, recipient) = age_setup();
        let opts = options(sources, &recipient, "true");
        let mut fopts = opts.for_path("conf.yaml");
        assert!(matches!(
            decrypt_file(&mut fopts, b"a: 1\n").unwrap(),
            Outcome::PassThrough
        ));
    }

    #[test]
    fn reused_parent_key_survives_round_trip() {
        let (_dir, sources, recipient) = age_setup();
        let opts = options(sources, &recipient, "true");

        let mut first = opts.for_path("conf.yaml");
        let encrypted = encrypt_file(&mut first, b"a: 1\n")
            .unwrap()
            .into_bytes(b"a: 1\n");
        let parent_meta = extract_metadata(&first, &encrypted).unwrap();

        let mut second = opts.for_path("conf.yaml");
        second.reuse_parent(&parent_meta);
        let again = encrypt_file(&mut second, b"a: 2\n")
            .unwrap()
            .into_bytes(b"a: 2\n");

        let child_meta = extract_metadata(&second, &again).unwrap();
        assert_eq!(
            parent_meta.data_key.unwrap().as_bytes(),
            child_meta.data_key.unwrap().as_bytes()
        );
    }

    #[test]
    fn missing_recipients_is_fatal() {
        let (_dir, sources, _) = age_setup();
        let opts = options(sources, "", "true");
        let mut fopts = opts.for_path("conf.yaml");
        assert!(matches!(
            encrypt_file(&mut fopts, b"a: 1\n"),
            Err(SopsGitError::InvalidRecipients)
        ));
    }

    #[test]
    fn merge_conflict_detection() {
        let input = b"<<<<<<< CURRENT\na: 1\n=======\na: 2\n>>>>>>> OTHER\n";
        let err = SopsGitError::Yaml("bad".into());
        assert!(is_merge_conflict(&err, input));
        assert!(!is_merge_conflict(&err, b"a: 1\n"));
        let other = SopsGitError::Other("x".into());
        assert!(!is_merge_conflict(&other, input));
    }

    #[test]
    fn rename_keys_apply_on_encrypt_and_decrypt() {
        let (_dir, sources, recipient) = age_setup();
        let mut opts = options(sources, &recipient, "true");
        opts.rename_keys = HashMap::from([("old".to_string(), "new".to_string())]);

        let mut fopts = opts.for_path("conf.yaml");
        let encrypted = encrypt_file(&mut fopts, b"old: 1\n")
            .unwrap()
            .into_bytes(b"old: 1\n");
        assert!(String::from_utf8_lossy(&encrypted).contains("new:"));

        // reverse map on the way back
        let mut opts2 = fopts.opts.clone();
        opts2.rename_keys = HashMap::from([("new".to_string(), "old".to_string())]);
        let mut fopts2 = opts2.for_path("conf.yaml");
        let decrypted = decrypt_file(&mut fopts2, &encrypted)
            .unwrap()
            .into_bytes(&encrypted);
        assert_eq!(String::from_utf8_lossy(&decrypted), "old: 1\n");
    }
}
