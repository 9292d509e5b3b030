//! Object store adapter and branch state.
//!
//! Wraps `git2` for everything the rewriter and the filter endpoints need:
//! reading files from the worktree, the index or a commit; writing blobs,
//! trees and commits; listing the first-parent commit log in chronological
//! order; and the per-branch encryption flag with its push-remote
//! discipline.

use std::path::{Path, PathBuf};

use chrono::Utc;
use git2::{Oid, Repository};
use tracing::debug;

use crate::error::{Result, SopsGitError};

pub const ENV_FILTERING: &str = "SOPS_FILTERING";

/// Reserved remote name; pushing to it fails loudly.
pub const PUSH_DISABLED: &str = "sops-push-disabled";
const SAVED_REMOTE: &str = "sops-saved-remote";
const BRANCH_ENCRYPT: &str = "sops-encrypt";
pub const CONFIGURED: &str = "sops.configured";

pub const SHORT_LEN: usize = 8;

pub fn short_hash(oid: Oid) -> String {
    oid.to_string()[..SHORT_LEN].to_string()
}

pub fn short_loc(loc: &str) -> &str {
    if loc.len() > SHORT_LEN {
        &loc[..SHORT_LEN]
    } else {
        loc
    }
}

#[derive(Debug, Clone)]
pub struct HeadState {
    pub branch: String,
    pub hash: Oid,
    pub encrypted: bool,
    pub rebasing: bool,
}

pub struct Repo {
    repo: Repository,
    workdir: PathBuf,
}

impl Repo {
    /// Discover the repository from the current directory and move to its
    /// toplevel so that repo-relative paths resolve.
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let repo = Repository::discover(&cwd).map_err(|_| SopsGitError::NotInGitRepo)?;
        let workdir = repo
            .workdir()
            .ok_or(SopsGitError::NotInGitRepo)?
            .to_path_buf();
        std::env::set_current_dir(&workdir)?;
        Ok(Self { repo, workdir })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repo = Repository::discover(path).map_err(|_| SopsGitError::NotInGitRepo)?;
        let workdir = repo
            .workdir()
            .ok_or(SopsGitError::NotInGitRepo)?
            .to_path_buf();
        Ok(Self { repo, workdir })
    }

    pub fn inner(&self) -> &Repository {
        &self.repo
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn git_dir(&self) -> &Path {
        self.repo.path()
    }

    pub fn abs_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workdir.join(p)
        }
    }

    // -----------------------------------------------------------------
    // git config

    fn locate(branch: &str, name: &str) -> String {
        if branch.is_empty() {
            name.to_string()
        } else {
            format!("branch.{branch}.{name}")
        }
    }

    pub fn config_get(&self, branch: &str, name: &str) -> Result<String> {
        let cfg = self.repo.config()?;
        let key = Self::locate(branch, name);
        match cfg.get_string(&key) {
            Ok(val) => Ok(val),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn config_set(&self, branch: &str, name: &str, value: &str) -> Result<()> {
        let mut cfg = self.repo.config()?;
        cfg.set_str(&Self::locate(branch, name), value)?;
        Ok(())
    }

    pub fn config_unset(&self, branch: &str, name: &str) -> Result<()> {
        let mut cfg = self.repo.config()?;
        match cfg.remove(&Self::locate(branch, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_config_section(&self, section: &str) -> Result<()> {
        let cfg = self.repo.config()?;
        let mut keys = Vec::new();
        {
            let mut entries = cfg.entries(Some(&format!("{section}\\..*")))?;
            while let Some(entry) = entries.next() {
                if let Some(name) = entry?.name() {
                    keys.push(name.to_string());
                }
            }
        }
        let mut cfg = self.repo.config()?;
        for key in keys {
            let _ = cfg.remove(&key);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // head state

    pub fn head_state(&self) -> Result<HeadState> {
        let head = self.repo.head()?;
        let hash = head
            .target()
            .ok_or_else(|| SopsGitError::Other("unborn HEAD".into()))?;
        let mut rebasing = false;
        let mut name = head.name().unwrap_or("").to_string();
        if !name.starts_with("refs/heads/") {
            // detached HEAD during a rebase keeps the branch name aside
            let marker = self.git_dir().join("rebase-merge").join("head-name");
            match std::fs::read_to_string(&marker) {
                Ok(text) if text.trim().starts_with("refs/heads/") => {
                    name = text.trim().to_string();
                    rebasing = true;
                }
                _ => return Err(SopsGitError::NotOnBranch),
            }
        }
        let branch = name.trim_start_matches("refs/heads/").to_string();

        let configured = self.config_get("", CONFIGURED)?;
        let flag = self.config_get(&branch, BRANCH_ENCRYPT)?;
        let encrypted = match std::env::var(ENV_FILTERING).as_deref() {
            Ok("1") | Ok("true") | Ok("encrypt") => true,
            Ok("0") | Ok("false") | Ok("decrypt") => false,
            _ => configured == "true" && flag == "true",
        };
        Ok(HeadState {
            branch,
            hash,
            encrypted,
            rebasing,
        })
    }

    /// Check that all files are committed. The internal status does not
    /// honor the attribute pipeline, so on an encrypted branch fall back to
    /// the host git whose filters keep the worktree comparison honest.
    pub fn ensure_clean(&self, file: Option<&str>, quiet: bool) -> Result<(HeadState, bool)> {
        let state = self.head_state()?;
        let dirty = if !state.encrypted {
            let mut opts = git2::StatusOptions::new();
            opts.include_untracked(true);
            let statuses = self.repo.statuses(Some(&mut opts))?;
            !statuses.is_empty()
        } else {
            let mut args = vec!["status", "--short"];
            if let Some(f) = file {
                args.push("--");
                args.push(f);
            }
            let out = self.run_git(&args)?;
            let out = out.trim();
            if !quiet && !out.is_empty() {
                println!("{out}");
            }
            !out.is_empty()
        };
        Ok((state, dirty))
    }

    pub fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SopsGitError::Subprocess(format!(
                "git {}: {}{}",
                args.join(" "),
                stdout,
                stderr
            )));
        }
        Ok(stdout)
    }

    // -----------------------------------------------------------------
    // object store

    /// Read a file from `worktree`, `index`, a compound location, or a
    /// commit hash. Missing files come back as `NotFound`.
    pub fn read_file(&self, path: &str, source: &str) -> Result<Vec<u8>> {
        match source {
            "worktree" => match std::fs::read(self.abs_path(path)) {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(SopsGitError::NotFound(path.to_string()))
                }
                Err(e) => Err(e.into()),
            },
            "index" => self.read_index_file(path),
            "worktree,index" => match self.read_file(path, "worktree") {
                Err(e) if e.is_not_found() => self.read_file(path, "index"),
                other => other,
            },
            "index,worktree" => match self.read_file(path, "index") {
                Err(e) if e.is_not_found() => self.read_file(path, "worktree"),
                other => other,
            },
            loc => {
                let oid = Oid::from_str(loc)
                    .map_err(|_| SopsGitError::Other(format!("invalid file location {loc:?}")))?;
                self.read_commit_file(oid, path)
            }
        }
    }

    fn read_index_file(&self, path: &str) -> Result<Vec<u8>> {
        let index = self.repo.index()?;
        let entry = index
            .get_path(Path::new(path), 0)
            .ok_or_else(|| SopsGitError::NotFound(path.to_string()))?;
        let blob = self.repo.find_blob(entry.id)?;
        Ok(blob.content().to_vec())
    }

    pub fn read_commit_file(&self, commit: Oid, path: &str) -> Result<Vec<u8>> {
        let commit = self.repo.find_commit(commit)?;
        let tree = commit.tree()?;
        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| SopsGitError::NotFound(path.to_string()))?;
        let blob = self
            .repo
            .find_blob(entry.id())
            .map_err(|_| SopsGitError::NotFound(path.to_string()))?;
        Ok(blob.content().to_vec())
    }

    /// Idempotent: identical bytes yield the identical hash.
    pub fn write_blob(&self, data: &[u8]) -> Result<Oid> {
        Ok(self.repo.blob(data)?)
    }

    /// First-parent commit hashes from the root to `HEAD`.
    pub fn commit_log(&self) -> Result<Vec<Oid>> {
        let mut walk = self.repo.revwalk()?;
        walk.push_head()?;
        walk.simplify_first_parent()?;
        let mut hashes: Vec<Oid> = walk.collect::<std::result::Result<_, _>>()?;
        hashes.reverse();
        Ok(hashes)
    }

    pub fn commit_message(&self, hash: Oid, max_len: usize) -> Result<String> {
        let commit = self.repo.find_commit(hash)?;
        let msg = commit.message().unwrap_or("-");
        let mut msg = msg.trim().lines().next().unwrap_or("-").trim().to_string();
        if max_len > 0 && msg.len() > max_len {
            let cut = msg
                .char_indices()
                .take_while(|(i, _)| *i < max_len - 1)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            msg.truncate(cut);
            msg.push('…');
        }
        Ok(msg)
    }

    // -----------------------------------------------------------------
    // branches

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo
            .find_branch(name, git2::BranchType::Local)
            .is_ok()
    }

    pub fn set_branch_ref(&self, name: &str, hash: Oid) -> Result<()> {
        self.repo
            .reference(&format!("refs/heads/{name}"), hash, true, "git-sops")?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str, force: bool) -> Result<()> {
        let Ok(mut branch) = self.repo.find_branch(name, git2::BranchType::Local) else {
            return Ok(()); // it really does not exist, fine
        };
        if !force {
            return Err(SopsGitError::Other(format!(
                "branch already exists: {name}"
            )));
        }
        branch.delete()?;
        let _ = self.remove_config_section(&format!("branch.{name}"));
        Ok(())
    }

    /// Create a uniquely named temporary branch at `HEAD` and switch to it.
    pub fn temp_branch(&self, base: &str) -> Result<String> {
        let mut name = String::new();
        if !base.is_empty() {
            name = format!("{base}-");
        }
        let suffix = Utc::now().format("%Y%m%d-%H%M%S-%f");
        name = format!("{name}SOPS-{suffix}");

        let base_name = name.clone();
        let mut free = !self.branch_exists(&name);
        for i in 1..100 {
            if free {
                break;
            }
            name = format!("{base_name}-{i}");
            free = !self.branch_exists(&name);
        }
        if !free {
            return Err(SopsGitError::Other("cannot make temporary branch".into()));
        }

        let head = self.repo.head()?.peel_to_commit()?;
        self.repo.branch(&name, &head, false)?;
        self.repo.set_head(&format!("refs/heads/{name}"))?;
        debug!(branch = %name, "created temporary branch");
        Ok(name)
    }

    /// Point `HEAD` at a branch and force-sync the worktree to it.
    pub fn force_checkout(&self, branch: &str) -> Result<()> {
        self.repo.set_head(&format!("refs/heads/{branch}"))?;
        let mut opts = git2::build::CheckoutBuilder::new();
        opts.force();
        self.repo.checkout_head(Some(&mut opts))?;
        Ok(())
    }

    pub fn reset_hard(&self) -> Result<()> {
        let head = self.repo.head()?.peel(git2::ObjectType::Commit)?;
        self.repo.reset(&head, git2::ResetType::Hard, None)?;
        Ok(())
    }

    /// Copy branch remote configuration from one branch to another.
    pub fn copy_branch_config(&self, from: &str, to: &str) -> Result<()> {
        for key in ["remote", "merge", SAVED_REMOTE] {
            let val = self.config_get(from, key)?;
            if !val.is_empty() {
                self.config_set(to, key, &val)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // branch marking (encryption flag + push discipline)

    /// Record the branch's encryption state. With `adjust_pushes`, a
    /// decrypted branch gets its push remote parked and replaced with the
    /// `sops-push-disabled` sentinel; marking it encrypted restores it.
    pub fn mark_branch(&self, branch: &str, encrypted: bool, adjust_pushes: bool) -> Result<()> {
        let branch = if branch.is_empty() {
            self.head_state()?.branch
        } else {
            branch.to_string()
        };

        self.config_set(&branch, BRANCH_ENCRYPT, if encrypted { "true" } else { "false" })?;

        if !adjust_pushes {
            return Ok(());
        }
        if !encrypted {
            // disable pushes on the branch that now holds plaintext
            let remote = self.config_get(&branch, "remote")?;
            if !remote.is_empty() && remote != PUSH_DISABLED {
                self.config_set(&branch, SAVED_REMOTE, &remote)?;
            } else {
                self.config_unset(&branch, SAVED_REMOTE)?;
            }
            self.config_set(&branch, "remote", PUSH_DISABLED)?;
        } else {
            // re-enable pushes now that history is ciphertext again
            let remote = self.config_get(&branch, SAVED_REMOTE)?;
            self.config_unset(&branch, SAVED_REMOTE)?;
            if !remote.is_empty() && remote != PUSH_DISABLED {
                self.config_set(&branch, "remote", &remote)?;
            } else {
                self.config_unset(&branch, "remote")?;
            }
        }
        debug!(branch, encrypted, "marked branch");
        Ok(())
    }

    pub fn branch_encrypted_flag(&self, branch: &str) -> Result<String> {
        self.config_get(branch, BRANCH_ENCRYPT)
    }

    /// Drop the cached textconv results; they hold decrypted content.
    pub fn purge_textconv_cache(&self) -> Result<()> {
        match self.repo.find_reference("refs/notes/textconv/sops") {
            Ok(mut reference) => {
                reference.delete()?;
                Ok(())
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
