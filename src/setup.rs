//! Repository setup and teardown: registers this executable as the
//! clean/smudge/textconv/merge driver and as the rawlog alias, with an
//! optional probe flow letting a bare encrypted clone validate its key
//! material before any filter is installed.

use tracing::debug;

use crate::app::App;
use crate::attrs::DRIVER;
use crate::cryptor::{self, Outcome};
use crate::error::{Result, SopsGitError};
use crate::repo::CONFIGURED;

const GIT_SETTINGS: &[(&str, &str)] = &[
    ("filter.[driver].clean", "[program] clean %f"),
    ("filter.[driver].smudge", "[program] smudge %f"),
    ("filter.[driver].required", "true"),
    ("merge.[driver].driver", "[program] merge %P %O %A %B"),
    ("merge.[driver].name", "merge driver for secret files"),
    ("merge.[driver].recursive", "binary"),
    ("merge.renormalize", "true"),
    ("diff.[driver].textconv", "[program] textconv"),
    ("diff.[driver].binary", "false"),
    ("diff.[driver].cachetextconv", "true"),
];

const GIT_ALIASES: &[(&str, &str)] = &[("rawlog", "! [program] rawlog --")];

const GIT_SECTIONS: &[&str] = &["sops", "filter.sops", "diff.sops", "merge.sops"];

impl App {
    pub fn setup_repo(&self, force: bool, probe_file: &str, probe_text: &str) -> Result<()> {
        let configured = self.repo.config_get("", CONFIGURED)?;
        if !configured.is_empty() && !force {
            return Err(SopsGitError::Other("repository is already configured".into()));
        }

        // query the previous state
        let (state, dirty) = self.repo.ensure_clean(None, false)?;
        if dirty {
            return Err(SopsGitError::DirtyWorktree);
        }
        if state.rebasing {
            return Err(SopsGitError::Rebasing);
        }
        self.opts
            .key_sources
            .validate_recipients(&self.opts.age_recipients)?;

        // validate a bare encrypted clone by probing a nominated file
        let mut encrypted = state.encrypted;
        let mut should_decrypt = false;
        if !probe_file.is_empty() {
            if probe_text.is_empty() {
                return Err(SopsGitError::Other("--probe-file requires --probe-text".into()));
            }
            let file_data = self
                .get_input(probe_file, false)
                .map_err(|e| SopsGitError::Other(format!("read probe file: {e}")))?;
            let mut fopts = self.opts.for_path(probe_file);
            let data = match cryptor::decrypt_file(&mut fopts, &file_data) {
                Ok(Outcome::Transformed(plain)) => {
                    encrypted = true;
                    should_decrypt = true;
                    plain
                }
                Ok(Outcome::PassThrough) => file_data,
                Err(e) => return Err(SopsGitError::Other(format!("parse probe file: {e}"))),
            };
            if !String::from_utf8_lossy(&data).contains(probe_text) {
                return Err(SopsGitError::Other("probe file validation failed".into()));
            }
        }

        // reset sops settings and persist the resolved options
        let _ = self.teardown_repo(true);
        self.opts.save(&self.repo)?;

        // register this executable as the driver
        let program = std::env::current_exe()?;
        let program = program
            .to_str()
            .ok_or_else(|| SopsGitError::Other("non-utf8 executable path".into()))?;
        for (key, val) in GIT_SETTINGS {
            let key = key.replace("[driver]", DRIVER);
            let val = val.replace("[program]", program);
            self.repo.config_set("", &key, &val)?;
        }
        for (alias, command) in GIT_ALIASES {
            let command = command.replace("[program]", program);
            self.repo.config_set("", &format!("alias.{alias}"), &command)?;
        }

        // the config now names key material locations; lock it down
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let config = self.repo.git_dir().join("config");
            let mut perms = std::fs::metadata(&config)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&config, perms)?;
        }

        self.repo.purge_textconv_cache()?;

        // finish the worktree setup
        self.repo.mark_branch(&state.branch, encrypted, false)?;
        if should_decrypt {
            println!("decrypting worktree");
            self.checkout_branch("", true)
                .map_err(|e| SopsGitError::Other(format!("decrypt worktree: {e}")))?;
        } else {
            self.chmod_files(None)?;
        }
        self.repo.config_set("", CONFIGURED, "true")?;
        println!("setup complete");

        let status = self.repo.run_git(&["status", "--short"])?;
        print!("{status}");
        Ok(())
    }

    pub fn teardown_repo(&self, quiet: bool) -> Result<()> {
        for section in GIT_SECTIONS {
            let _ = self.repo.remove_config_section(section);
        }
        for (key, _) in GIT_SETTINGS {
            let key = key.replace("[driver]", DRIVER);
            let _ = self.repo.config_unset("", &key);
        }
        for (alias, _) in GIT_ALIASES {
            let _ = self.repo.config_unset("", &format!("alias.{alias}"));
        }
        let _ = self.repo.config_unset("", CONFIGURED);
        debug!("removed sops git settings");

        if !quiet {
            println!("teardown complete");
        }
        Ok(())
    }

    pub fn show_status(&self) -> Result<()> {
        let state = self.repo.head_state().ok();
        let configured = self.repo.config_get("", CONFIGURED)?;
        println!("directory:  {}", self.repo.workdir().display());
        println!("configured: {}", configured == "true");
        println!(
            "branch:     {}",
            state.as_ref().map(|s| s.branch.as_str()).unwrap_or("-")
        );
        println!(
            "encrypted:  {}",
            state.as_ref().map(|s| s.encrypted).unwrap_or(false)
        );
        Ok(())
    }
}
