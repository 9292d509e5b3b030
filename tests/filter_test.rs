//! Filter endpoint tests: clean (encrypt), smudge (decrypt), textconv,
//! passthrough rules and empty-input preservation.

mod common;

use std::io::Write;
use std::process::{Command, Stdio};

use common::{commit_all, create_age_key, create_git_repo, git_sops_bin, AgeKey};

fn run_filter(
    repo: &std::path::Path,
    key: &AgeKey,
    args: &[&str],
    input: &[u8],
) -> std::process::Output {
    let mut child = Command::new(git_sops_bin())
        .args(args)
        .current_dir(repo)
        .env("SOPS_AGE_KEY_FILE", &key.key_file)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn git-sops");
    child
        .stdin
        .as_mut()
        .expect("failed to open stdin")
        .write_all(input)
        .expect("failed to write stdin");
    child.wait_with_output().expect("failed to read output")
}

/// A repo marked encrypted with recipients configured, as setup leaves it.
fn encrypted_repo(key: &AgeKey) -> tempfile::TempDir {
    let temp = create_git_repo();
    std::fs::write(temp.path().join("README.md"), "hello\n").unwrap();
    commit_all(temp.path(), "initial");
    common::git(temp.path(), &["config", "sops.configured", "true"]);
    common::git(temp.path(), &["config", "sops.age", &key.recipient]);
    common::git(temp.path(), &["config", "sops.keep-formatting", "true"]);
    common::git(temp.path(), &["config", "branch.main.sops-encrypt", "true"]);
    temp
}

const PLAIN: &[u8] = b"user: admin\npass: \"hunter2\"\n";

#[test]
fn clean_encrypts_and_smudge_decrypts() {
    let key = create_age_key();
    let temp = encrypted_repo(&key);

    let clean = run_filter(temp.path(), &key, &["clean", "app.secret.yaml"], PLAIN);
    assert!(
        clean.status.success(),
        "clean failed: {}",
        String::from_utf8_lossy(&clean.stderr)
    );
    let encrypted = clean.stdout;
    let text = String::from_utf8_lossy(&encrypted);
    assert!(text.contains("ENC[AES256_GCM,"));
    assert!(text.contains("sops:"));
    assert!(!text.contains("hunter2"));

    let smudge = run_filter(temp.path(), &key, &["smudge", "app.secret.yaml"], &encrypted);
    assert!(smudge.status.success());
    assert_eq!(smudge.stdout, PLAIN);
}

#[test]
fn clean_passes_plaintext_through_on_decrypted_branch() {
    let key = create_age_key();
    let temp = encrypted_repo(&key);
    common::git(temp.path(), &["config", "branch.main.sops-encrypt", "false"]);

    let clean = run_filter(temp.path(), &key, &["clean", "app.secret.yaml"], PLAIN);
    assert!(clean.status.success());
    assert_eq!(clean.stdout, PLAIN);
}

#[test]
fn smudge_passes_plaintext_through() {
    let key = create_age_key();
    let temp = encrypted_repo(&key);

    let smudge = run_filter(temp.path(), &key, &["smudge", "app.secret.yaml"], PLAIN);
    assert!(smudge.status.success());
    assert_eq!(smudge.stdout, PLAIN);
}

#[test]
fn empty_input_is_preserved_verbatim() {
    let key = create_age_key();
    let temp = encrypted_repo(&key);

    for sub in ["clean", "smudge"] {
        let out = run_filter(temp.path(), &key, &[sub, "app.secret.yaml"], b"");
        assert!(out.status.success(), "{sub} failed on empty input");
        assert!(out.stdout.is_empty(), "{sub} must preserve empty input");
    }
}

#[test]
fn clean_is_stable_against_parent_in_index() {
    let key = create_age_key();
    let temp = encrypted_repo(&key);

    // first encryption, staged as the parent version
    let clean = run_filter(temp.path(), &key, &["clean", "app.secret.yaml"], PLAIN);
    assert!(clean.status.success());
    std::fs::write(temp.path().join("app.secret.yaml"), &clean.stdout).unwrap();
    common::git(temp.path(), &["add", "app.secret.yaml"]);

    // the same plaintext must produce the parent ciphertext verbatim
    let again = run_filter(temp.path(), &key, &["clean", "app.secret.yaml"], PLAIN);
    assert!(again.status.success());
    assert_eq!(again.stdout, clean.stdout);
}

#[test]
fn smudge_passes_merge_conflicts_through() {
    let key = create_age_key();
    let temp = encrypted_repo(&key);

    let conflicted =
        b"<<<<<<< CURRENT\nuser: one\n=======\nuser: two\n>>>>>>> OTHER\n".to_vec();
    let smudge = run_filter(temp.path(), &key, &["smudge", "app.secret.yaml"], &conflicted);
    assert!(smudge.status.success());
    assert_eq!(smudge.stdout, conflicted);
}

#[test]
fn textconv_decrypts_a_file_argument() {
    let key = create_age_key();
    let temp = encrypted_repo(&key);

    let clean = run_filter(temp.path(), &key, &["clean", "app.secret.yaml"], PLAIN);
    assert!(clean.status.success());
    std::fs::write(temp.path().join("app.secret.yaml"), &clean.stdout).unwrap();

    let out = Command::new(git_sops_bin())
        .args(["textconv", "app.secret.yaml"])
        .current_dir(temp.path())
        .env("SOPS_AGE_KEY_FILE", &key.key_file)
        .output()
        .expect("failed to run textconv");
    assert!(out.status.success());
    assert_eq!(out.stdout, PLAIN);
}

#[test]
fn version_prints_name_and_version() {
    use predicates::prelude::*;
    assert_cmd::Command::new(git_sops_bin())
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("git-sops"));
}

#[test]
fn filtering_env_override_wins_over_branch_state() {
    let key = create_age_key();
    let temp = encrypted_repo(&key);
    common::git(temp.path(), &["config", "branch.main.sops-encrypt", "false"]);

    // decrypted branch, but the override forces the encrypt path
    let mut child = Command::new(git_sops_bin())
        .args(["clean", "app.secret.yaml"])
        .current_dir(temp.path())
        .env("SOPS_AGE_KEY_FILE", &key.key_file)
        .env("SOPS_FILTERING", "encrypt")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.as_mut().unwrap().write_all(PLAIN).unwrap();
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("ENC[AES256_GCM,"));
}
