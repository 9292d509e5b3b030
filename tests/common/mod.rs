use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;

use age::secrecy::ExposeSecret;
use tempfile::TempDir;

/// Create a new temporary git repository with user config set.
pub fn create_git_repo() -> TempDir {
    let temp = TempDir::new().expect("failed to create temp dir");

    git(temp.path(), &["init", "-q", "-b", "main"]);
    git(temp.path(), &["config", "user.email", "test@example.com"]);
    git(temp.path(), &["config", "user.name", "Test User"]);

    temp
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn commit_all(dir: &Path, message: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-q", "-m", message]);
}

/// Absolute path to the git-sops test binary.
#[allow(dead_code)]
pub fn git_sops_bin() -> &'static str {
    env!("CARGO_BIN_EXE_git-sops")
}

/// A generated age key pair: the key file for identities and the public
/// recipient string.
pub struct AgeKey {
    _dir: TempDir,
    pub key_file: PathBuf,
    pub recipient: String,
}

pub fn create_age_key() -> AgeKey {
    let identity = age::x25519::Identity::generate();
    let dir = TempDir::new().expect("failed to create key dir");
    let key_file = dir.path().join("keys.txt");
    let recipient = identity.to_public().to_string();
    std::fs::write(
        &key_file,
        format!(
            "# created: by test\n# public key: {recipient}\n{}\n",
            identity.to_string().expose_secret()
        ),
    )
    .expect("failed to write key file");
    AgeKey {
        _dir: dir,
        key_file,
        recipient,
    }
}

/// Run the git-sops binary in a repo with the age key file in scope.
#[allow(dead_code)]
pub fn git_sops(dir: &Path, key: &AgeKey, args: &[&str]) -> std::process::Output {
    StdCommand::new(git_sops_bin())
        .args(args)
        .current_dir(dir)
        .env("SOPS_AGE_KEY_FILE", &key.key_file)
        .output()
        .expect("failed to run git-sops")
}

#[allow(dead_code)]
pub fn git_sops_ok(dir: &Path, key: &AgeKey, args: &[&str]) -> String {
    let output = git_sops(dir, key, args);
    assert!(
        output.status.success(),
        "git-sops {args:?} failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}
