//! Raw history viewer: runs the host `git log --patch --no-textconv` with
//! filtering disabled via the environment override and streams its output
//! through a line filter on a consumer thread.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::app::App;
use crate::error::{Result, SopsGitError};
use crate::repo::ENV_FILTERING;

#[derive(Debug, Default, Clone)]
pub struct SkipFilters {
    pub hunk_marks: bool,
    pub metadata: bool,
    pub encrypted: bool,
    pub blank_lines: bool,
    pub same_lines: bool,
    pub removals: bool,
    // state
    pub(crate) yaml_metadata: bool,
    pub(crate) json_metadata: bool,
}

static RE_COLOR_ESCAPE: Lazy<Regex> = Lazy::new(|| Regex::new("\x1b\\[[^m]*m").unwrap());

impl SkipFilters {
    pub fn all() -> Self {
        Self {
            hunk_marks: true,
            metadata: true,
            encrypted: true,
            blank_lines: true,
            same_lines: true,
            removals: true,
            ..Default::default()
        }
    }

    pub fn active(&self) -> bool {
        self.hunk_marks
            || self.metadata
            || self.encrypted
            || self.blank_lines
            || self.same_lines
            || self.removals
    }

    pub fn skip_line(&mut self, line: &str) -> bool {
        let plain = RE_COLOR_ESCAPE.replace_all(line, "");
        let mut s = plain.trim_end_matches([' ', '\t', '\r']);
        if s.is_empty() {
            return self.blank_lines;
        }
        let mut skip = false;
        match s.as_bytes()[0] {
            b'+' => {
                if s.starts_with("+++ ") && s.contains('/') {
                    self.yaml_metadata = false;
                    self.json_metadata = false;
                    return false;
                }
                s = &s[1..];
            }
            b'-' => {
                if s.starts_with("--- ") && s.contains('/') {
                    self.yaml_metadata = false;
                    self.json_metadata = false;
                    return false;
                }
                if self.removals {
                    skip = true;
                }
                s = &s[1..];
            }
            b' ' => {
                if self.same_lines {
                    skip = true;
                }
                s = &s[1..];
            }
            b'@' => {
                if self.hunk_marks && s.starts_with("@@ ") {
                    skip = true;
                }
            }
            b'd' => {
                if s.starts_with("diff ") {
                    self.yaml_metadata = false;
                    self.json_metadata = false;
                }
            }
            b'i' => {
                if s.starts_with("index ") {
                    self.yaml_metadata = false;
                    self.json_metadata = false;
                }
            }
            _ => {}
        }
        match s {
            "" => {
                if self.blank_lines {
                    skip = true;
                }
            }
            "sops:" => self.yaml_metadata = true,
            "..." => self.yaml_metadata = false,
            "\t\"sops\": {" => self.json_metadata = true,
            "}" => self.json_metadata = false,
            _ => {
                if self.encrypted && s.contains("ENC[AES256_GCM,") {
                    skip = true;
                }
            }
        }
        if self.metadata && (self.yaml_metadata || self.json_metadata) {
            skip = true;
        }
        skip
    }
}

impl App {
    pub fn raw_log(&self, colorize: bool, mut filters: SkipFilters, ext: &[String]) -> Result<()> {
        let mut args: Vec<String> = vec![
            "log".into(),
            "--patch".into(),
            "--no-textconv".into(),
        ];
        if colorize {
            args.push("--color=always".into());
        }
        if ext.is_empty() {
            const FORMAT: &str =
                "%C(bold blue)%h%C(reset) - %C(white)%s%C(reset)%C(bold yellow)%d%C(reset)";
            args.extend([
                "--abbrev-commit".into(),
                "--decorate".into(),
                "--date=relative".into(),
                format!("--format={FORMAT}"),
            ]);
        } else {
            args.extend(ext.iter().cloned());
        }
        debug!("git {}", args.join(" "));

        let filtering = filters.active();
        let mut cmd = Command::new("git");
        cmd.args(&args)
            .current_dir(self.repo.workdir())
            // suppress recursive filter application in the child
            .env(ENV_FILTERING, "false")
            .stdin(Stdio::inherit())
            .stderr(Stdio::inherit());
        if filtering {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SopsGitError::Subprocess(format!("git log: {e}")))?;

        if filtering {
            // the producer is the child process; consume its pipe on a
            // second thread and join both at the end
            let stdout = child.stdout.take().expect("stdout was piped");
            let consumer = std::thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if !filters.skip_line(&line) {
                        println!("{line}");
                    }
                }
            });
            let status = child.wait()?;
            consumer
                .join()
                .map_err(|_| SopsGitError::Other("log filter thread panicked".into()))?;
            if !status.success() {
                return Err(SopsGitError::Subprocess("git log failed".into()));
            }
        } else {
            let status = child.wait()?;
            if !status.success() {
                return Err(SopsGitError::Subprocess("git log failed".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hunk_marks_and_encrypted_lines() {
        let mut f = SkipFilters {
            hunk_marks: true,
            encrypted: true,
            ..Default::default()
        };
        assert!(f.skip_line("@@ -9,4 +15,4 @@"));
        assert!(f.skip_line("+pass: ENC[AES256_GCM,data:x,iv:y,tag:z,type:str]"));
        assert!(!f.skip_line("+pass: plaintext"));
    }

    #[test]
    fn metadata_block_tracking() {
        let mut f = SkipFilters {
            metadata: true,
            ..Default::default()
        };
        assert!(!f.skip_line("+key: value"));
        assert!(f.skip_line("+sops:")); // the marker line itself is metadata
        assert!(f.skip_line("+    mac: ENC[...]"));
        assert!(!f.skip_line("diff --git a/x b/x"));
        assert!(!f.skip_line("+key: value"));
    }

    #[test]
    fn removals_and_same_lines() {
        let mut f = SkipFilters {
            removals: true,
            same_lines: true,
            ..Default::default()
        };
        assert!(f.skip_line("-old line"));
        assert!(f.skip_line(" context line"));
        assert!(!f.skip_line("+new line"));
        assert!(!f.skip_line("--- a/file.yaml"));
    }

    #[test]
    fn color_escapes_are_ignored() {
        let mut f = SkipFilters {
            hunk_marks: true,
            ..Default::default()
        };
        assert!(f.skip_line("\x1b[36m@@ -1 +1 @@\x1b[m"));
    }
}
