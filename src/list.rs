//! Secret-file listing and worktree maintenance: `ls`, `chmod`, worktree
//! smudging after branch switches, and the checkout wrapper that settles
//! the index against the attribute pipeline.

use tracing::{debug, warn};

use crate::app::App;
use crate::attrs;
use crate::cryptor;
use crate::error::{Result, SopsGitError};

impl App {
    pub fn list_files(&self, staged: bool) -> Result<()> {
        let loc = if staged { "index" } else { "worktree" };
        for file in attrs::match_files(&self.repo, loc)? {
            println!("{file}");
        }
        Ok(())
    }

    fn match_worktree(&self, files: Option<Vec<String>>) -> Result<Vec<String>> {
        match files {
            Some(files) => Ok(files),
            None => attrs::match_files(&self.repo, "worktree"),
        }
    }

    /// Remove "other" access from every secret file in the worktree.
    pub fn chmod_files(&self, files: Option<Vec<String>>) -> Result<()> {
        let files = self.match_worktree(files)?;
        for path in &files {
            let abs = self.repo.abs_path(path);
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let meta = std::fs::metadata(&abs)?;
                let mut perms = meta.permissions();
                perms.set_mode(perms.mode() & 0o770);
                std::fs::set_permissions(&abs, perms)?;
            }
            #[cfg(not(unix))]
            {
                let _ = abs;
            }
        }
        Ok(())
    }

    /// Decrypt every secret file in the worktree from its index version.
    pub fn smudge_files(&self, files: Option<Vec<String>>) -> Result<()> {
        let files = self.match_worktree(files)?;
        for path in &files {
            let input = self.repo.read_file(path, "index")?;
            let output = if input.is_empty() {
                input
            } else {
                let mut fopts = self.opts.for_path(path);
                cryptor::decrypt_file(&mut fopts, &input)?.into_bytes(&input)
            };
            let abs = self.repo.abs_path(path);
            if abs.exists() {
                std::fs::remove_file(&abs)?;
            }
            std::fs::write(&abs, output)?;
        }
        Ok(())
    }

    /// Force-checkout a branch and settle the worktree: decrypted branches
    /// only need a hard reset, encrypted ones get their secret files
    /// smudged and their permissions tightened.
    pub fn checkout_branch(&self, branch: &str, textconv: bool) -> Result<()> {
        if !branch.is_empty() {
            self.repo.force_checkout(branch)?;
        }
        if !textconv {
            return self.repo.reset_hard();
        }
        let files = self.match_worktree(None)?;
        self.smudge_files(Some(files.clone()))
            .map_err(|e| SopsGitError::Other(format!("decrypt worktree: {e}")))?;
        self.chmod_files(Some(files.clone()))?;
        // settle the index against the filtered worktree
        self.repo.run_git(&["reset", "--hard"])?;
        self.chmod_files(Some(files))?;
        Ok(())
    }

    /// Wrapper for `git checkout` that keeps branch state and index
    /// consistent with the attribute pipeline.
    pub fn checkout_wrapper(&self, branch_arg: &str, quiet: bool, force: bool, create: bool) -> Result<()> {
        let (state, dirty) = self.repo.ensure_clean(None, false)?;
        let mut rebase = false;
        if dirty {
            if !force {
                return Err(SopsGitError::DirtyWorktree);
            }
            warn!("forcing checkout on dirty repository");
        }
        if state.rebasing {
            if force && !create && branch_arg.is_empty() {
                warn!("force checkout while rebasing");
                rebase = true;
            } else {
                return Err(SopsGitError::Rebasing);
            }
        }
        let was_encrypted = state.encrypted;

        // run the normal git checkout if needed
        if !branch_arg.is_empty() {
            let mut args = vec!["checkout"];
            if quiet {
                args.push("-q");
            }
            if force {
                args.push("-f");
            }
            if create {
                args.push("-b");
            }
            args.push(branch_arg);
            debug!("run command: git {}", args.join(" "));
            self.repo.run_git(&args)?;
        }

        // settle index vs worktree, fix remotes
        let state = self.repo.head_state()?;
        let mut encrypted = state.encrypted;
        let mut branch = state.branch;
        if create && !rebase {
            encrypted = was_encrypted;
            self.repo.mark_branch(&branch, encrypted, true)?;
        }
        if rebase {
            branch = String::new();
        }
        self.checkout_branch(&branch, encrypted)
    }
}
