//! The clean/smudge/textconv/merge endpoints the host git invokes through
//! the attribute pipeline. Empty input always passes through verbatim.

use std::io::Write;

use tracing::{debug, warn};

use crate::app::{overwrite_file, App};
use crate::cryptor::{self, Outcome};
use crate::engine::Metadata;
use crate::error::{Result, SopsGitError};
use crate::repo::short_hash;

fn filter_status(encrypted: bool, rebase: bool, stdin: bool) -> String {
    let mut status = [b'-', b'-', b'-'];
    if encrypted {
        status[0] = b'e';
    }
    if rebase {
        status[1] = b'r';
    }
    if !stdin {
        status[2] = b'f';
    }
    String::from_utf8_lossy(&status).into_owned()
}

fn write_stdout(data: &[u8]) -> Result<()> {
    std::io::stdout().write_all(data)?;
    Ok(())
}

impl App {
    /// Clean filter: worktree plaintext in, stored ciphertext out. Reuses
    /// the parent version's data key, and emits the parent ciphertext
    /// verbatim when the plaintext is unchanged.
    pub fn clean(&self, path: &str, stdin: bool, parent_loc: &str, last_modified: &str) -> Result<()> {
        let state = self.repo.head_state()?;
        debug!(
            "sops clean: {:?} {} '{}' {path}",
            state.branch,
            short_hash(state.hash),
            filter_status(state.encrypted, state.rebasing, stdin)
        );

        let input = self.get_input(path, stdin)?;
        if input.is_empty() {
            return Ok(()); // preserve empty input
        }
        if !state.encrypted {
            return write_stdout(&input);
        }

        let mut fopts = self.opts.for_path(path);
        if stdin {
            fopts.meta.last_modified = None;
        }

        let mut dad_data: Option<Vec<u8>> = None;
        let mut dad_meta: Option<Metadata> = None;
        if !parent_loc.is_empty() && parent_loc != "none" {
            match self.repo.read_file(path, parent_loc) {
                Ok(data) => {
                    match cryptor::extract_metadata(&fopts, &data) {
                        Ok(meta) => dad_meta = Some(meta),
                        Err(SopsGitError::MetadataNotFound) => {}
                        Err(e) => return Err(e),
                    }
                    dad_data = Some(data);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(meta) = &dad_meta {
            debug!("{path}: parent data key from {parent_loc}");
            fopts.reuse_parent(meta);
        }
        if !last_modified.is_empty() {
            fopts.set_last_modified(last_modified)?;
        }

        let mut output = match cryptor::encrypt_file(&mut fopts, &input)? {
            Outcome::PassThrough => {
                debug!("{path}: already encrypted");
                input.clone()
            }
            Outcome::Transformed(bytes) => bytes,
        };

        if let (Some(data), Some(_)) = (&dad_data, &dad_meta) {
            // the parent existed and was encrypted; identical plaintext
            // must yield identical ciphertext bytes
            let mut dad_opts = self.opts.for_path(path);
            if let Outcome::Transformed(plain_dad) = cryptor::decrypt_file(&mut dad_opts, data)? {
                if plain_dad == input {
                    debug!("{path}: equals decrypted parent");
                    output = data.clone();
                } else {
                    debug!("{path}: encrypting anew");
                }
            }
        } else {
            debug!("{path}: encrypting");
        }
        write_stdout(&output)
    }

    /// Smudge filter: stored bytes in, worktree plaintext out.
    pub fn smudge(&self, path: &str, stdin: bool, force: bool) -> Result<()> {
        let state = self.repo.head_state()?;
        let force = force || state.rebasing;
        debug!(
            "sops smudge: {:?} {} '{}' {path}",
            state.branch,
            short_hash(state.hash),
            filter_status(state.encrypted, state.rebasing, stdin)
        );

        let input = self.get_input(path, stdin)?;
        if input.is_empty() {
            debug!("{path}: preserve empty input");
            return Ok(()); // preserve empty input
        }
        if !state.encrypted && !force {
            return write_stdout(&input);
        }

        let mut fopts = self.opts.for_path(path);
        if stdin {
            fopts.meta.last_modified = None;
        }
        match cryptor::decrypt_file(&mut fopts, &input) {
            Ok(Outcome::Transformed(output)) => {
                debug!("{path}: decrypting");
                write_stdout(&output)
            }
            Ok(Outcome::PassThrough) => {
                debug!("{path}: already decrypted");
                write_stdout(&input)
            }
            Err(e) if cryptor::is_merge_conflict(&e, &input) => {
                warn!("{path}: found merge conflict");
                write_stdout(&input)
            }
            Err(e) => Err(e),
        }
    }

    /// Textconv for diff generation: decrypt regardless of branch state.
    pub fn textconv(&self, path: &str) -> Result<()> {
        self.smudge(path, false, true)
    }

    /// Three-way merge driver: decrypt the inputs in place, let the host
    /// git merge them, then re-encrypt the result when the branch is
    /// encrypted, reusing whichever source first yielded a data key.
    pub fn merge_driver(&self, path: &str, ancestor: &str, current: &str, other: &str) -> Result<()> {
        let state = self.repo.head_state()?;
        debug!(
            "sops merge: {:?} {} '{}' {path}",
            state.branch,
            short_hash(state.hash),
            filter_status(state.encrypted, state.rebasing, false)
        );
        debug!("ancestor: {ancestor} current: {current} other: {other}");

        // decrypt merge sources in place
        let mut metas: Vec<(&str, Option<Metadata>)> =
            vec![("current", None), ("ancestor", None), ("other", None)];
        for (role, source) in [("ancestor", ancestor), ("current", current), ("other", other)] {
            debug!("merge decrypting {role}: {source}");
            let input = std::fs::read(source).map_err(|e| {
                SopsGitError::Other(format!("reading merged {role} input from {source}: {e}"))
            })?;
            if input.is_empty() {
                continue;
            }
            let mut fopts = self.opts.for_path(path);
            match cryptor::decrypt_file(&mut fopts, &input) {
                Ok(Outcome::Transformed(output)) => {
                    for slot in metas.iter_mut().filter(|(r, _)| *r == role) {
                        slot.1 = Some(fopts.meta.clone());
                    }
                    overwrite_file(source, &output, true).map_err(|e| {
                        SopsGitError::Other(format!("writing decrypted {role} to {source}: {e}"))
                    })?;
                }
                Ok(Outcome::PassThrough) => {}
                Err(e) => {
                    return Err(SopsGitError::Other(format!("decrypting merged {role}: {e}")));
                }
            }
        }

        // perform the 3-way merge with the host git
        let diff_opt = if self.repo.config_get("", "merge.conflictstyle")? == "diff3" {
            "--diff3"
        } else {
            "--no-diff3"
        };
        let merge_out = self.repo.run_git(&[
            "merge-file",
            "-L",
            "CURRENT",
            "-L",
            "ANCESTOR",
            "-L",
            "OTHER",
            diff_opt,
            current,
            ancestor,
            other,
        ]);
        if let Err(e) = merge_out {
            return Err(SopsGitError::Subprocess(format!(
                "{path}: merge-file failed: {e}"
            )));
        }
        if !state.encrypted {
            return Ok(());
        }

        // read the merge result
        let input = match std::fs::read(current) {
            Ok(data) if !data.is_empty() => data,
            _ => return Ok(()),
        };
        let mut fopts = self.opts.for_path(path);

        // pull source metadata, first hit wins
        for (role, meta) in &metas {
            if let Some(meta) = meta {
                debug!("pulled merge data key from {role}");
                fopts.reuse_parent(meta);
                break;
            }
        }

        // encrypt the merge result in place
        let output = cryptor::encrypt_file(&mut fopts, &input)?.into_bytes(&input);
        overwrite_file(current, &output, true)
            .map_err(|e| SopsGitError::Other(format!("writing merge result: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_status_glyphs() {
        assert_eq!(filter_status(false, false, true), "---");
        assert_eq!(filter_status(true, false, true), "e--");
        assert_eq!(filter_status(true, true, false), "erf");
    }
}
