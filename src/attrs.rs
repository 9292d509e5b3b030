//! Which paths carry the `sops` filter.
//!
//! Parses a gitattributes file from the chosen source and matches the file
//! list discovered in that same source. Matching uses `globset`, which
//! understands `[0-9]`-style character classes natively, so no textual
//! pattern rewriting is needed.

use globset::{GlobBuilder, GlobMatcher};
use tracing::debug;

use crate::error::{Result, SopsGitError};
use crate::repo::{short_loc, Repo};

pub const GIT_ATTR_FILE: &str = ".gitattributes";
pub const DRIVER: &str = "sops";

struct Pattern {
    matcher: GlobMatcher,
    basename: bool,
}

/// The glob patterns bound to a filter driver in a gitattributes file.
pub struct PathSpec {
    patterns: Vec<Pattern>,
}

impl PathSpec {
    /// Collect the patterns whose attributes include `filter=<driver>`.
    pub fn parse(text: &str, driver: &str) -> Result<Self> {
        let want = format!("filter={driver}");
        let mut patterns = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let Some(raw) = tokens.next() else { continue };
            if !tokens.any(|attr| attr == want) {
                continue;
            }
            patterns.push(Self::build(raw)?);
        }
        Ok(Self { patterns })
    }

    fn build(raw: &str) -> Result<Pattern> {
        // a pattern with a slash is anchored to the repository root;
        // otherwise it matches the file name at any depth
        let basename = !raw.contains('/');
        let glob = raw.trim_start_matches('/');
        let matcher = GlobBuilder::new(glob)
            .literal_separator(!basename)
            .build()
            .map_err(|e| SopsGitError::Other(format!("invalid attribute pattern {raw:?}: {e}")))?
            .compile_matcher();
        Ok(Pattern { matcher, basename })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| {
            if p.basename {
                let name = path.rsplit('/').next().unwrap_or(path);
                p.matcher.is_match(name)
            } else {
                p.matcher.is_match(path)
            }
        })
    }
}

/// Sorted repo-relative paths in `loc` matching the driver patterns found
/// in the same `loc`. A missing gitattributes file means no matches.
pub fn match_files(repo: &Repo, loc: &str) -> Result<Vec<String>> {
    let data = match repo.read_file(GIT_ATTR_FILE, loc) {
        Ok(data) => data,
        Err(e) if e.is_not_found() => {
            debug!("gitattributes not found in {}", short_loc(loc));
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    let text = String::from_utf8_lossy(&data);
    let spec = PathSpec::parse(&text, DRIVER)?;
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    let mut all_files = list_files(repo, loc)?;
    all_files.sort_unstable();
    let mut files: Vec<String> = all_files
        .into_iter()
        .filter(|path| spec.is_match(path))
        .collect();
    files.sort_unstable();
    debug!("matching files in {}: {:?}", short_loc(loc), files);
    Ok(files)
}

fn list_files(repo: &Repo, loc: &str) -> Result<Vec<String>> {
    let mut all = Vec::new();
    match loc {
        "worktree" => walk_dir(repo.workdir(), "", &mut all)?,
        "index" => {
            let index = repo.inner().index()?;
            for entry in index.iter() {
                // regular files only; symlinks and gitlinks stay out
                let kind = entry.mode & 0o170000;
                if kind == 0o100000 {
                    all.push(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
        }
        hash => {
            let oid = git2::Oid::from_str(hash)
                .map_err(|_| SopsGitError::Other(format!("invalid file location {hash:?}")))?;
            let commit = repo.inner().find_commit(oid)?;
            let tree = commit.tree()?;
            tree.walk(git2::TreeWalkMode::PreOrder, |parent, entry| {
                if entry.kind() != Some(git2::ObjectType::Tree) {
                    if let Some(name) = entry.name() {
                        if parent.is_empty() {
                            all.push(name.to_string());
                        } else {
                            all.push(format!("{parent}{name}"));
                        }
                    }
                }
                git2::TreeWalkResult::Ok
            })?;
        }
    }
    Ok(all)
}

fn walk_dir(root: &std::path::Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let dir = if prefix.is_empty() {
        root.to_path_buf()
    } else {
        root.join(prefix)
    };
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == ".git" {
            continue;
        }
        let path = if prefix.is_empty() {
            name.into_owned()
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(root, &path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(attrs: &str) -> PathSpec {
        PathSpec::parse(attrs, DRIVER).unwrap()
    }

    #[test]
    fn plain_extension_pattern_matches_any_depth() {
        let s = spec("*.secret.yaml filter=sops diff=sops\n");
        assert!(s.is_match("app.secret.yaml"));
        assert!(s.is_match("deep/nested/app.secret.yaml"));
        assert!(!s.is_match("app.yaml"));
    }

    #[test]
    fn anchored_pattern_matches_from_root() {
        let s = spec("secrets/** filter=sops\n");
        assert!(s.is_match("secrets/db.yaml"));
        assert!(s.is_match("secrets/sub/db.yaml"));
        assert!(!s.is_match("other/secrets.yaml"));
    }

    #[test]
    fn character_classes_are_native() {
        let s = spec("env[0-9].yaml filter=sops\nkey[.-]secret filter=sops\n");
        assert!(s.is_match("env1.yaml"));
        assert!(s.is_match("conf/env7.yaml"));
        assert!(!s.is_match("envx.yaml"));
        assert!(s.is_match("key.secret"));
        assert!(s.is_match("key-secret"));
        assert!(!s.is_match("key_secret"));
    }

    #[test]
    fn only_our_filter_attribute_selects() {
        let s = spec("*.yaml filter=other\n*.yml diff=sops\nreal.yaml filter=sops\n");
        assert!(!s.is_match("a.yaml"));
        assert!(!s.is_match("a.yml"));
        assert!(s.is_match("real.yaml"));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let s = spec("# note\n\n*.yaml filter=sops\n");
        assert!(s.is_match("a.yaml"));
    }
}
