//! Branch-history rewriting.
//!
//! Walks the first-parent commit chain chronologically, converts every
//! matching file in every commit between plaintext and ciphertext, rebuilds
//! the trees bottom-up and re-emits each commit onto a temporary branch.
//! The destination ref moves only after the last commit lands; any failure
//! leaves the original branch untouched and the guard cleans up.

use std::cell::Cell;
use std::collections::HashMap;
use std::time::Instant;

use git2::Oid;
use tracing::{debug, warn};

use crate::app::App;
use crate::attrs;
use crate::config::Options;
use crate::cryptor::{self, Outcome};
use crate::error::{Result, SopsGitError};
use crate::repo::{short_hash, Repo};

const FILE_MODE_DIR: i32 = 0o040000;
const FILE_MODE_SYMLINK: i32 = 0o120000;
const FILE_MODE_GITLINK: i32 = 0o160000;

#[derive(Clone)]
struct MutEntry {
    name: String,
    mode: i32,
    oid: Oid,
}

type MutTree = Vec<MutEntry>;

/// Deletes the temp branch and restores the original checkout on every
/// exit path, including panics.
struct BranchGuard<'r> {
    repo: &'r Repo,
    cur_branch: String,
    tmp_branch: String,
    restore_cur: Cell<bool>,
    delete_temp: Cell<bool>,
}

impl Drop for BranchGuard<'_> {
    fn drop(&mut self) {
        if self.restore_cur.get() {
            let _ = self.repo.force_checkout(&self.cur_branch);
        }
        if self.delete_temp.get() {
            let _ = self.repo.delete_branch(&self.tmp_branch, true);
        }
    }
}

struct Transformer<'a> {
    app: &'a App,
    base_opts: Options,
    encrypt: bool,
    progress: bool,
    hash_log: Vec<Oid>,
    cur_hash: Oid,
    short: String,
    new_dad: Option<Oid>,
    started: Instant,
    trans_cache: HashMap<Oid, Oid>,
    tree_cache: HashMap<String, MutTree>,
}

impl App {
    /// Rewrite the whole branch history, encrypting or decrypting every
    /// matching file, then atomically repoint `new_branch`.
    pub fn transform_branch(
        &self,
        new_branch: &str,
        encrypt: bool,
        force: bool,
        progress: bool,
    ) -> Result<()> {
        // check that the worktree is clean
        let (state, dirty) = self.repo.ensure_clean(None, false)?;
        if state.rebasing {
            return Err(SopsGitError::Rebasing);
        }
        if dirty {
            if !force {
                return Err(SopsGitError::DirtyWorktree);
            }
            warn!("forcing rewrite on dirty repository");
        }

        // check that the current branch needs action
        let what = if encrypt { "encrypted" } else { "decrypted" };
        if encrypt == state.encrypted && !force {
            warn!("the branch is already {what}");
            return Ok(());
        }

        let cur_branch = state.branch.clone();
        let mut where_ = "on current";
        let new_branch = if new_branch.is_empty() {
            cur_branch.clone()
        } else {
            new_branch.to_string()
        };
        if new_branch != cur_branch {
            where_ = "to new";
            if self.repo.branch_exists(&new_branch) && !force {
                return Err(SopsGitError::Other("target branch already exists".into()));
            }
        }

        // obtain and validate the commit log before touching anything
        let hash_log = self.repo.commit_log()?;
        for (i, hash) in hash_log.iter().enumerate() {
            let msg = self.repo.commit_message(*hash, 80).map_err(|e| {
                SopsGitError::Other(format!("pre-validate commit {}: {e}", short_hash(*hash)))
            })?;
            debug!(
                "verified commit {}/{} {} {msg:?}",
                i + 1,
                hash_log.len(),
                short_hash(*hash)
            );
        }

        // the worktree is unused during the rewrite; ignore file modtime
        let mut base_opts = self.opts.clone();
        base_opts.file_modtime = false;

        // rewrite onto a temporary branch
        let tmp_branch = self.repo.temp_branch(&cur_branch)?;
        let guard = BranchGuard {
            repo: &self.repo,
            cur_branch: cur_branch.clone(),
            tmp_branch,
            restore_cur: Cell::new(true),
            delete_temp: Cell::new(true),
        };

        let mut t = Transformer {
            app: self,
            base_opts,
            encrypt,
            progress,
            hash_log,
            cur_hash: Oid::zero(),
            short: String::new(),
            new_dad: None,
            started: Instant::now(),
            trans_cache: HashMap::new(),
            tree_cache: HashMap::new(),
        };

        // traverse the commit log in chronological order
        for i in 0..t.hash_log.len() {
            let hash = t.hash_log[i];
            t.cur_hash = hash;
            t.short = short_hash(hash);
            t.report_progress(i + 1);
            let new_hash = t.transform_commit().map_err(|e| {
                SopsGitError::Other(format!("convert commit {}: {e}", t.short))
            })?;
            debug!("~ commit transformed: {} -> {}", t.short, short_hash(new_hash));
            t.new_dad = Some(new_hash);
        }
        t.report_final();
        let new_head = t
            .new_dad
            .ok_or_else(|| SopsGitError::Other("nothing to transform".into()))?;

        // switch to the resulting branch
        debug!(
            "switching branch {} -> {} at {}",
            guard.tmp_branch,
            new_branch,
            short_hash(new_head)
        );
        self.switch_branch(new_head, &cur_branch, &new_branch, encrypt)?;
        guard.restore_cur.set(false);
        println!(
            "{what} {where_} branch '{new_branch}' at {}",
            short_hash(new_head)
        );
        Ok(())
    }

    /// Repoint the destination branch at the rewritten head and check it
    /// out with the matching branch state.
    fn switch_branch(
        &self,
        hash: Oid,
        old_branch: &str,
        new_branch: &str,
        encrypted: bool,
    ) -> Result<()> {
        if old_branch != new_branch {
            self.repo.delete_branch(new_branch, true).map_err(|e| {
                SopsGitError::Other(format!("delete target branch {new_branch:?}: {e}"))
            })?;
        }

        self.repo.set_branch_ref(new_branch, hash).map_err(|e| {
            SopsGitError::Other(format!(
                "point target branch {new_branch:?} at {}: {e}",
                short_hash(hash)
            ))
        })?;

        if old_branch != new_branch {
            self.repo.copy_branch_config(old_branch, new_branch)?;
        }

        self.repo
            .mark_branch(new_branch, encrypted, true)
            .map_err(|e| {
                SopsGitError::Other(format!(
                    "mark branch {new_branch:?} as encrypted={encrypted}: {e}"
                ))
            })?;

        self.checkout_branch(new_branch, true)
            .map_err(|e| SopsGitError::Other(format!("checkout target branch {new_branch:?}: {e}")))
    }
}

impl Transformer<'_> {
    fn transform_commit(&mut self) -> Result<Oid> {
        let repo = self.app.repo.inner();
        let commit = repo.find_commit(self.cur_hash)?;
        let tree = commit.tree()?;
        let old_tree_oid = tree.id();

        // collect the source trees keyed by path
        self.tree_cache.clear();
        self.collect_trees("", &tree)?;

        // transform matching files in this commit's tree
        let matching = attrs::match_files(&self.app.repo, &self.cur_hash.to_string())
            .map_err(|e| SopsGitError::Other(format!("match source files: {e}")))?;
        for path in &matching {
            self.transform_file(path)
                .map_err(|e| SopsGitError::Other(format!("transform file {path}: {e}")))?;
        }

        // recompute tree hashes bottom-up
        let new_tree_oid = self.update_hashes("")?;
        debug!(
            "~ tree({}) {} -> {}",
            self.short,
            short_hash(old_tree_oid),
            short_hash(new_tree_oid)
        );

        // re-emit the commit with the rewritten tree and the new parent;
        // additional parents are dropped, the history is linearized
        let new_tree = repo.find_tree(new_tree_oid)?;
        let message = commit.message().unwrap_or_default().to_string();
        let new_dad = self.new_dad.map(|oid| repo.find_commit(oid)).transpose()?;
        let parents: Vec<&git2::Commit> = new_dad.iter().collect();
        let new_hash = repo.commit(
            None,
            &commit.author(),
            &commit.committer(),
            &message,
            &new_tree,
            &parents,
        )?;
        Ok(new_hash)
    }

    fn collect_trees(&mut self, parent_path: &str, tree: &git2::Tree) -> Result<()> {
        let repo = self.app.repo.inner();
        let mut entries = Vec::new();
        for entry in tree.iter() {
            let name = entry
                .name()
                .ok_or_else(|| SopsGitError::Other("non-utf8 tree entry".into()))?
                .to_string();
            let mode = entry.filemode();
            let oid = entry.id();
            if mode == FILE_MODE_DIR {
                let child_path = join_path(parent_path, &name);
                let child_tree = repo
                    .find_tree(oid)
                    .map_err(|_| SopsGitError::Other(format!("find tree for path {child_path}")))?;
                self.collect_trees(&child_path, &child_tree)?;
            }
            entries.push(MutEntry { name, mode, oid });
        }
        self.tree_cache.insert(parent_path.to_string(), entries);
        Ok(())
    }

    fn transform_file(&mut self, file_path: &str) -> Result<()> {
        let (parent_path, file_name) = split_path(file_path);
        let tree = self
            .tree_cache
            .get(parent_path)
            .ok_or_else(|| SopsGitError::Other("get source tree".into()))?;
        let entry = tree
            .iter()
            .find(|e| e.name == file_name)
            .ok_or_else(|| SopsGitError::Other("get source hash".into()))?;
        if entry.mode == FILE_MODE_DIR
            || entry.mode == FILE_MODE_SYMLINK
            || entry.mode == FILE_MODE_GITLINK
        {
            return Err(SopsGitError::Other("source is not a file".into()));
        }
        let src_oid = entry.oid;

        // look up the result in the transformation cache
        if let Some(&dst_oid) = self.trans_cache.get(&src_oid) {
            debug!(
                "{}:{file_path} cache hit {} -> {}",
                self.short,
                short_hash(src_oid),
                short_hash(dst_oid)
            );
            self.patch_entry(parent_path, &file_name, dst_oid);
            return Ok(());
        }

        // read and convert the source data
        let src_data = self
            .app
            .repo
            .inner()
            .find_blob(src_oid)
            .map_err(|e| SopsGitError::Other(format!("read source: {e}")))?
            .content()
            .to_vec();

        let dst_data = if src_data.is_empty() {
            src_data.clone()
        } else if self.encrypt {
            self.encrypt_file(file_path, &src_data)?
        } else {
            self.decrypt_file(file_path, &src_data)?
        };

        // store the result and memoize its hash
        let dst_oid = self.app.repo.write_blob(&dst_data)?;
        self.trans_cache.insert(src_oid, dst_oid);
        self.patch_entry(parent_path, &file_name, dst_oid);
        debug!(
            "{}:{file_path} transformed {} -> {}",
            self.short,
            short_hash(src_oid),
            short_hash(dst_oid)
        );
        Ok(())
    }

    fn patch_entry(&mut self, parent_path: &str, file_name: &str, oid: Oid) {
        if let Some(tree) = self.tree_cache.get_mut(parent_path) {
            if let Some(entry) = tree.iter_mut().find(|e| e.name == file_name) {
                entry.oid = oid;
            }
        }
    }

    fn update_hashes(&mut self, parent_path: &str) -> Result<Oid> {
        let mut entries = self
            .tree_cache
            .get(parent_path)
            .cloned()
            .ok_or_else(|| SopsGitError::Other(format!("no tree to update for path {parent_path}")))?;
        for entry in entries.iter_mut() {
            if entry.mode != FILE_MODE_DIR {
                continue;
            }
            let child_path = join_path(parent_path, &entry.name);
            entry.oid = self.update_hashes(&child_path)?;
        }

        let repo = self.app.repo.inner();
        let mut builder = repo.treebuilder(None)?;
        for entry in &entries {
            builder.insert(&entry.name, entry.oid, entry.mode)?;
        }
        // the store deduplicates: an existing object is accepted silently
        Ok(builder.write()?)
    }

    /// Encrypt one blob, reusing the data key of the already-rewritten
    /// parent commit's version of the same path. When the plaintext equals
    /// the decrypted parent, the parent ciphertext is emitted verbatim so
    /// the blob hash does not churn.
    fn encrypt_file(&self, path: &str, input: &[u8]) -> Result<Vec<u8>> {
        let mut fopts = self.base_opts.for_path(path);

        // pull metadata from the dad file
        let mut dad_data = None;
        let mut dad_meta = None;
        if let Some(dad_hash) = self.new_dad {
            if let Ok(data) = self.app.repo.read_file(path, &dad_hash.to_string()) {
                if let Ok(meta) = cryptor::extract_metadata(&fopts, &data) {
                    dad_meta = Some(meta);
                }
                dad_data = Some(data);
            }
        }
        if let Some(meta) = &dad_meta {
            debug!("{}:{path} reusing dad data key", self.short);
            fopts.reuse_parent(meta);
        }

        let output = match cryptor::encrypt_file(&mut fopts, input)? {
            Outcome::PassThrough => {
                debug!("{}:{path} already encrypted", self.short);
                return Ok(input.to_vec());
            }
            Outcome::Transformed(bytes) => bytes,
        };

        if let (Some(data), Some(_)) = (&dad_data, &dad_meta) {
            // the file was plain while the dad was encrypted
            let mut dad_opts = self.base_opts.for_path(path);
            if let Outcome::Transformed(plain_dad) = cryptor::decrypt_file(&mut dad_opts, data)? {
                if plain_dad == input {
                    debug!("{}:{path} plain file equals plain dad", self.short);
                    return Ok(data.clone());
                }
            }
        }
        Ok(output)
    }

    fn decrypt_file(&self, path: &str, input: &[u8]) -> Result<Vec<u8>> {
        let mut fopts = self.base_opts.for_path(path);
        match cryptor::decrypt_file(&mut fopts, input)? {
            Outcome::PassThrough => {
                debug!("{}:{path} already decrypted", self.short);
                Ok(input.to_vec())
            }
            Outcome::Transformed(bytes) => Ok(bytes),
        }
    }

    fn report_progress(&self, step: usize) {
        let total = self.hash_log.len();
        let msg = self
            .app
            .repo
            .commit_message(self.cur_hash, 62)
            .unwrap_or_default();
        let report = format!("{step}/{total} {} {msg:?}", self.short);
        let glyph = if self.encrypt { '>' } else { '<' };
        debug!("{glyph} commit {report}");
        if !self.progress {
            return;
        }
        const THROB_CHARS: &[u8] = br"/-\|";
        let throbber = THROB_CHARS[step % THROB_CHARS.len()] as char;
        let elapsed = self.started.elapsed().as_secs_f64();
        let expected = if total > 0 && step > 0 {
            elapsed * total as f64 / step as f64
        } else {
            elapsed
        };
        let timing = format!("{}/{}s", elapsed as u64, expected as u64);
        eprint!("\r> {timing:>7} {report:<81} {throbber}\u{8}");
    }

    fn report_final(&self) {
        if !self.progress {
            return;
        }
        let report = format!(
            "{} commit(s) done in {}s",
            self.hash_log.len(),
            self.started.elapsed().as_secs()
        );
        eprintln!("\r{report:<95}");
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn split_path(path: &str) -> (&str, String) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name.to_string()),
        None => ("", path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("d", "a"), "d/a");
        assert_eq!(split_path("d/sub/a.yaml"), ("d/sub", "a.yaml".to_string()));
        assert_eq!(split_path("a.yaml"), ("", "a.yaml".to_string()));
    }
}
