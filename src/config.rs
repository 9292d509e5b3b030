//! Per-invocation options: CLI flag, then git config `sops.<name>`, then
//! the default. The whole set is resolved once at startup into an
//! immutable value; per-file copies are derived from it.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::engine::{KeySources, Metadata};
use crate::error::{Result, SopsGitError};
use crate::mangle::MangleOptions;
use crate::repo::Repo;

pub const DEFAULT_INDENT: usize = 2;

/// Raw option values as they arrive from the command line; `None` falls
/// back to the repository configuration.
#[derive(Debug, Clone, Default)]
pub struct OptionFlags {
    pub age: Option<String>,
    pub indent: Option<usize>,
    pub rename_keys: Option<String>,
    pub encrypted_comment_suffix: Option<String>,
    pub encrypted_comment_prefix: Option<String>,
    pub keep_formatting: Option<String>,
    pub ignore_mac: bool,
    pub file_modtime: bool,
    pub shamir_threshold: Option<u32>,
}

/// Resolved options for one invocation.
#[derive(Debug, Clone)]
pub struct Options {
    pub age_recipients: String,
    pub indent: usize,
    pub ignore_mac: bool,
    pub file_modtime: bool,
    pub shamir_threshold: u32,
    pub rename_keys: HashMap<String, String>,
    pub rename_keys_raw: String,
    pub mangle: MangleOptions,
    pub key_sources: KeySources,
}

impl Options {
    pub fn resolve(repo: &Repo, flags: &OptionFlags) -> Result<Self> {
        let get = |flag: &Option<String>, name: &str| -> Result<String> {
            match flag {
                Some(val) if !val.is_empty() => Ok(val.clone()),
                _ => repo.config_get("", &format!("sops.{name}")),
            }
        };

        let age_recipients = get(&flags.age, "age")?;
        let indent = match flags.indent {
            Some(n) if n > 0 => n,
            _ => {
                let raw = repo.config_get("", "sops.indent")?;
                if raw.is_empty() {
                    DEFAULT_INDENT
                } else {
                    raw.parse().map_err(|_| {
                        SopsGitError::Other(format!("invalid sops.indent {raw:?}"))
                    })?
                }
            }
        };
        let ignore_mac =
            flags.ignore_mac || repo.config_get("", "sops.ignore-mac")? == "true";
        let file_modtime =
            flags.file_modtime || repo.config_get("", "sops.file-modtime")? == "true";
        let shamir_threshold = match flags.shamir_threshold {
            Some(n) => n,
            None => {
                let raw = repo.config_get("", "sops.shamir-secret-sharing-threshold")?;
                if raw.is_empty() { 0 } else { raw.parse().unwrap_or(0) }
            }
        };

        let rename_raw = get(&flags.rename_keys, "rename-keys")?;
        let rename_keys = parse_rename_keys(&rename_raw)?;

        let mut mangle = MangleOptions::new(
            &get(&flags.keep_formatting, "keep-formatting")?,
            &get(&flags.encrypted_comment_suffix, "encrypted-comment-suffix")?,
            &get(&flags.encrypted_comment_prefix, "encrypted-comment-prefix")?,
        )?;
        mangle.indent = indent;

        Ok(Self {
            age_recipients,
            indent,
            ignore_mac,
            file_modtime,
            shamir_threshold,
            rename_keys,
            rename_keys_raw: rename_raw,
            mangle,
            key_sources: KeySources::from_env(),
        })
    }

    /// Persist the resolved options into git config (used by setup).
    pub fn save(&self, repo: &Repo) -> Result<()> {
        repo.config_set("", "sops.age", &self.age_recipients)?;
        repo.config_set("", "sops.indent", &self.indent.to_string())?;
        repo.config_set("", "sops.ignore-mac", &self.ignore_mac.to_string())?;
        repo.config_set("", "sops.file-modtime", &self.file_modtime.to_string())?;
        repo.config_set(
            "",
            "sops.shamir-secret-sharing-threshold",
            &self.shamir_threshold.to_string(),
        )?;
        repo.config_set("", "sops.keep-formatting", &self.mangle.flag_string())?;
        repo.config_set("", "sops.rename-keys", &self.rename_keys_raw)?;
        repo.config_set(
            "",
            "sops.encrypted-comment-suffix",
            &self.mangle.encrypted_comment_suffix,
        )?;
        repo.config_set(
            "",
            "sops.encrypted-comment-prefix",
            &self.mangle.encrypted_comment_prefix,
        )?;
        Ok(())
    }

    /// Derive the options for one file. With `file-modtime` active the
    /// metadata lastmodified is taken from the file's mtime.
    pub fn for_path(&self, path: &str) -> FileOptions {
        let mut meta = Metadata::new();
        meta.shamir_threshold = self.shamir_threshold;
        if self.file_modtime {
            if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
                meta.last_modified = Some(DateTime::<Utc>::from(modified));
            }
        }
        FileOptions {
            opts: self.clone(),
            path: path.to_string(),
            meta,
        }
    }
}

/// Options plus per-file state: the path and the metadata slot carrying a
/// reused or freshly generated data key.
#[derive(Debug, Clone)]
pub struct FileOptions {
    pub opts: Options,
    pub path: String,
    pub meta: Metadata,
}

impl FileOptions {
    /// Adopt the data key and recipients of a parent file's metadata.
    pub fn reuse_parent(&mut self, parent: &Metadata) {
        self.meta.data_key = parent.data_key.clone();
        self.meta.key_groups = parent.key_groups.clone();
    }

    pub fn set_last_modified(&mut self, spec: &str) -> Result<()> {
        const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
        let naive = chrono::NaiveDateTime::parse_from_str(spec, FORMAT).map_err(|_| {
            SopsGitError::Other(format!(
                "cannot parse time {spec:?} using format {FORMAT:?}"
            ))
        })?;
        self.meta.last_modified = Some(Utc.from_utc_datetime(&naive));
        Ok(())
    }
}

pub fn parse_rename_keys(value: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Some((from, to)) = token.split_once(':') else {
            return Err(SopsGitError::Other("invalid rename-keys parameter".into()));
        };
        if from.is_empty() || to.is_empty() || to.contains(':') {
            return Err(SopsGitError::Other("invalid rename-keys parameter".into()));
        }
        map.insert(from.to_string(), to.to_string());
    }
    Ok(map)
}

/// Canonical `from1:to1,from2:to2` form for persisting in git config.
pub fn rename_keys_string(map: &HashMap<String, String>) -> String {
    let mut list: Vec<&String> = map.keys().collect();
    list.sort();
    list.iter()
        .map(|from| format!("{from}:{}", map[*from]))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_keys_parse_and_print() {
        let map = parse_rename_keys("a:b, c:d").unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"], "b");
        assert_eq!(rename_keys_string(&map), "a:b,c:d");

        assert!(parse_rename_keys("broken").is_err());
        assert!(parse_rename_keys("a:").is_err());
        assert!(parse_rename_keys("").unwrap().is_empty());
    }

    #[test]
    fn last_modified_parses_fixed_format() {
        let repo_less = Options {
            age_recipients: String::new(),
            indent: 2,
            ignore_mac: false,
            file_modtime: false,
            shamir_threshold: 0,
            rename_keys: HashMap::new(),
            rename_keys_raw: String::new(),
            mangle: MangleOptions::default(),
            key_sources: KeySources::default(),
        };
        let mut fopts = repo_less.for_path("x.yaml");
        fopts.set_last_modified("2026-08-02T12:30:00").unwrap();
        assert!(fopts.meta.last_modified.is_some());
        assert!(fopts.set_last_modified("02/08/2026").is_err());
    }
}
