//! Branch rewrite tests: whole-history encrypt/decrypt round trips,
//! parent-stable blob hashes, and the push-remote discipline.

mod common;

use common::{commit_all, create_age_key, create_git_repo, git, git_sops_ok};

const ATTRS: &str = "*.secret.yaml filter=sops diff=sops merge=sops\n";
const P1: &str = "user: admin\npass: \"hunter2\"\nport: 0123\n";
const P2: &str = "user: admin\npass: \"rotated\"\nport: 0123\n";

fn rev_parse(dir: &std::path::Path, spec: &str) -> String {
    git(dir, &["rev-parse", spec]).trim().to_string()
}

/// Three linear commits: the secret changes only in the third one.
fn seeded_repo() -> tempfile::TempDir {
    let temp = create_git_repo();
    std::fs::write(temp.path().join(".gitattributes"), ATTRS).unwrap();
    std::fs::write(temp.path().join("app.secret.yaml"), P1).unwrap();
    std::fs::write(temp.path().join("empty.secret.yaml"), "").unwrap();
    std::fs::write(temp.path().join("other.txt"), "one\n").unwrap();
    commit_all(temp.path(), "add secrets");

    std::fs::write(temp.path().join("other.txt"), "two\n").unwrap();
    commit_all(temp.path(), "unrelated change");

    std::fs::write(temp.path().join("app.secret.yaml"), P2).unwrap();
    commit_all(temp.path(), "rotate password");
    temp
}

#[test]
fn encrypt_branch_then_decrypt_restores_trees() {
    let key = create_age_key();
    let temp = seeded_repo();
    let repo = temp.path();

    // original tree hashes, root-first
    let originals: Vec<String> = (0..3)
        .map(|i| rev_parse(repo, &format!("HEAD~{}^{{tree}}", 2 - i)))
        .collect();

    git_sops_ok(
        repo,
        &key,
        &["setup", "--age", &key.recipient, "--keep-formatting", "true"],
    );
    git_sops_ok(repo, &key, &["encrypt"]);

    // history now holds ciphertext
    let stored = git(repo, &["show", "HEAD:app.secret.yaml"]);
    assert!(stored.contains("ENC[AES256_GCM,"));
    assert!(stored.contains("sops:"));
    assert!(!stored.contains("hunter2"));

    // the worktree still reads plaintext
    let worktree = std::fs::read_to_string(repo.join("app.secret.yaml")).unwrap();
    assert_eq!(worktree, P2);

    // the branch is flagged encrypted
    assert_eq!(
        git(repo, &["config", "branch.main.sops-encrypt"]).trim(),
        "true"
    );

    // unchanged plaintext keeps the identical ciphertext blob across
    // commits: commit 1 and commit 2 share the secret's blob hash
    assert_eq!(
        rev_parse(repo, "HEAD~2:app.secret.yaml"),
        rev_parse(repo, "HEAD~1:app.secret.yaml")
    );
    // while the rotated version in commit 3 differs
    assert_ne!(
        rev_parse(repo, "HEAD~1:app.secret.yaml"),
        rev_parse(repo, "HEAD:app.secret.yaml")
    );

    // empty files stay verbatim in every commit
    assert_eq!(
        rev_parse(repo, "HEAD:empty.secret.yaml"),
        rev_parse(repo, "HEAD~2:empty.secret.yaml")
    );

    // unmatched files are untouched
    assert_eq!(git(repo, &["show", "HEAD~1:other.txt"]), "two\n");

    git_sops_ok(repo, &key, &["decrypt"]);

    // the round trip restores every tree hash
    let restored: Vec<String> = (0..3)
        .map(|i| rev_parse(repo, &format!("HEAD~{}^{{tree}}", 2 - i)))
        .collect();
    assert_eq!(originals, restored);
    assert_eq!(
        git(repo, &["config", "branch.main.sops-encrypt"]).trim(),
        "false"
    );
}

#[test]
fn encrypt_to_a_new_branch_leaves_current_alone() {
    let key = create_age_key();
    let temp = seeded_repo();
    let repo = temp.path();
    let original_head = rev_parse(repo, "HEAD");

    git_sops_ok(
        repo,
        &key,
        &["setup", "--age", &key.recipient, "--keep-formatting", "true"],
    );
    git_sops_ok(repo, &key, &["encrypt", "enc-main"]);

    // the source branch still points at the plaintext history
    assert_eq!(rev_parse(repo, "main"), original_head);
    let stored = git(repo, &["show", "enc-main:app.secret.yaml"]);
    assert!(stored.contains("ENC[AES256_GCM,"));
    assert_eq!(
        git(repo, &["config", "branch.enc-main.sops-encrypt"]).trim(),
        "true"
    );
}

#[test]
fn no_temp_branches_survive_a_rewrite() {
    let key = create_age_key();
    let temp = seeded_repo();
    let repo = temp.path();

    git_sops_ok(
        repo,
        &key,
        &["setup", "--age", &key.recipient, "--keep-formatting", "true"],
    );
    git_sops_ok(repo, &key, &["encrypt"]);

    let branches = git(repo, &["branch", "--list"]);
    assert!(
        !branches.contains("SOPS-"),
        "temporary branch left behind: {branches}"
    );
}

#[test]
fn set_decrypted_parks_the_push_remote() {
    let key = create_age_key();
    let temp = seeded_repo();
    let repo = temp.path();
    git(repo, &["config", "branch.main.remote", "origin"]);

    git_sops_ok(repo, &key, &["set-decrypted"]);
    assert_eq!(
        git(repo, &["config", "branch.main.remote"]).trim(),
        "sops-push-disabled"
    );
    assert_eq!(
        git(repo, &["config", "branch.main.sops-saved-remote"]).trim(),
        "origin"
    );
    assert_eq!(
        git(repo, &["config", "branch.main.sops-encrypt"]).trim(),
        "false"
    );

    git_sops_ok(repo, &key, &["set-encrypted"]);
    assert_eq!(git(repo, &["config", "branch.main.remote"]).trim(), "origin");
    let saved = std::process::Command::new("git")
        .args(["config", "branch.main.sops-saved-remote"])
        .current_dir(repo)
        .output()
        .unwrap();
    assert!(!saved.status.success(), "saved remote must be cleared");
}

#[test]
fn dirty_worktree_blocks_a_rewrite() {
    let key = create_age_key();
    let temp = seeded_repo();
    let repo = temp.path();

    git_sops_ok(
        repo,
        &key,
        &["setup", "--age", &key.recipient, "--keep-formatting", "true"],
    );
    std::fs::write(repo.join("other.txt"), "uncommitted\n").unwrap();

    let out = common::git_sops(repo, &key, &["encrypt"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("commit all modified files"));
}

#[test]
fn status_reports_branch_state() {
    let key = create_age_key();
    let temp = seeded_repo();
    let repo = temp.path();

    let out = git_sops_ok(repo, &key, &["status"]);
    assert!(out.contains("configured: false"));
    assert!(out.contains("branch:     main"));
    assert!(out.contains("encrypted:  false"));
}

#[test]
fn ls_lists_matching_files() {
    let key = create_age_key();
    let temp = seeded_repo();
    let repo = temp.path();

    let out = git_sops_ok(repo, &key, &["ls"]);
    let files: Vec<&str> = out.lines().collect();
    assert_eq!(files, vec!["app.secret.yaml", "empty.secret.yaml"]);

    let staged = git_sops_ok(repo, &key, &["ls", "--staged"]);
    assert_eq!(staged, out);
}
